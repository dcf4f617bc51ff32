//! Single in-flight execution per deployment

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::deploy::cancel::CancelToken;
use crate::errors::RemediationError;

/// Registry of deployments currently executing or rolling back
#[derive(Debug, Default)]
pub struct InFlight {
    active: Mutex<HashMap<String, CancelToken>>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `deployment_id`; a second claim while the first is held is rejected
    pub fn acquire(self: &Arc<Self>, deployment_id: &str) -> Result<InFlightGuard, RemediationError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(deployment_id) {
            return Err(RemediationError::DeploymentBusy(deployment_id.to_string()));
        }
        let token = CancelToken::new();
        active.insert(deployment_id.to_string(), token.clone());
        Ok(InFlightGuard {
            registry: Arc::clone(self),
            deployment_id: deployment_id.to_string(),
            token,
        })
    }

    pub fn is_active(&self, deployment_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains_key(deployment_id)
    }

    /// Signal the running execution, returning whether one was found
    pub fn cancel(&self, deployment_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(deployment_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn release(&self, deployment_id: &str) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(deployment_id);
    }
}

/// Releases the claim on drop
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlight>,
    deployment_id: String,
    token: CancelToken,
}

impl InFlightGuard {
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.release(&self.deployment_id);
    }
}
