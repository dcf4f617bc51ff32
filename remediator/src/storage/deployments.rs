//! Deployment persistence and per-deployment locking

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::deploy::fsm::DeploymentEvent;
use crate::errors::RemediationError;
use crate::models::deployment::Deployment;
use crate::storage::audit::{AuditEntry, AuditKind, AuditTrail};

/// Persistence for deployment records
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn create(&self, deployment: &Deployment) -> Result<(), RemediationError>;

    async fn get(&self, id: &str) -> Result<Deployment, RemediationError>;

    async fn update(&self, deployment: &Deployment) -> Result<(), RemediationError>;
}

/// In-memory deployment store
#[derive(Default)]
pub struct InMemoryDeploymentStore {
    entries: RwLock<HashMap<String, Deployment>>,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn create(&self, deployment: &Deployment) -> Result<(), RemediationError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&deployment.id) {
            return Err(RemediationError::ValidationError(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }
        entries.insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Deployment, RemediationError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(id)
            .cloned()
            .ok_or_else(|| RemediationError::NotFound(format!("deployment {}", id)))
    }

    async fn update(&self, deployment: &Deployment) -> Result<(), RemediationError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(&deployment.id) {
            Some(slot) => {
                *slot = deployment.clone();
                Ok(())
            }
            None => Err(RemediationError::NotFound(format!(
                "deployment {}",
                deployment.id
            ))),
        }
    }
}

/// One async mutex per deployment ID.
///
/// An entry lives only while some task holds or waits for it.
#[derive(Default)]
pub struct DeploymentLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeploymentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one deployment record
    pub async fn lock(&self, deployment_id: &str) -> DeploymentGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(deployment_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        DeploymentGuard {
            locks: self,
            deployment_id: deployment_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Deployments with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one record; drops the map entry when nobody else wants it
pub struct DeploymentGuard<'a> {
    locks: &'a DeploymentLocks,
    deployment_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DeploymentGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Waiters clone the Arc under the map lock, so the count is stable here
        drop(self.guard.take());
        let idle = locks
            .get(&self.deployment_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.deployment_id);
        }
    }
}

/// Transactional access to deployment records, with auditing
pub struct DeploymentRecords {
    store: Arc<dyn DeploymentStore>,
    audit: Arc<dyn AuditTrail>,
    locks: DeploymentLocks,
}

impl DeploymentRecords {
    pub fn new(store: Arc<dyn DeploymentStore>, audit: Arc<dyn AuditTrail>) -> Self {
        Self {
            store,
            audit,
            locks: DeploymentLocks::new(),
        }
    }

    pub async fn create(&self, deployment: &Deployment) -> Result<(), RemediationError> {
        self.store.create(deployment).await?;
        self.audit(AuditEntry::new(
            &deployment.id,
            AuditKind::Created,
            json!({
                "patch_id": deployment.patch_id,
                "strategy": deployment.strategy,
                "targets": deployment.target_ids,
                "parent_deployment_id": deployment.parent_deployment_id,
            }),
        ))
        .await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Deployment, RemediationError> {
        self.store.get(id).await
    }

    /// Read-modify-write one record under its lock.
    ///
    /// The record is only written back when `f` succeeds.
    pub async fn update<R, F>(&self, id: &str, f: F) -> Result<R, RemediationError>
    where
        F: FnOnce(&mut Deployment) -> Result<R, RemediationError>,
    {
        let _guard = self.locks.lock(id).await;
        let mut deployment = self.store.get(id).await?;
        let result = f(&mut deployment)?;
        self.store.update(&deployment).await?;
        Ok(result)
    }

    /// Apply a state machine event and audit the transition
    pub async fn transition(
        &self,
        id: &str,
        event: DeploymentEvent,
    ) -> Result<Deployment, RemediationError> {
        self.transition_with(id, event, |_| Ok(())).await
    }

    /// Mutate the record with `prepare`, then apply `event`, in one write
    pub async fn transition_with<F>(
        &self,
        id: &str,
        event: DeploymentEvent,
        prepare: F,
    ) -> Result<Deployment, RemediationError>
    where
        F: FnOnce(&mut Deployment) -> Result<(), RemediationError>,
    {
        let (previous, deployment) = self
            .update(id, |d| {
                prepare(d)?;
                let previous = d.apply(&event)?;
                Ok((previous, d.clone()))
            })
            .await?;

        info!(
            "Deployment {} transitioned {} -> {}",
            id, previous, deployment.status
        );
        self.audit(AuditEntry::new(
            id,
            AuditKind::StateTransition,
            json!({
                "from": previous,
                "to": deployment.status,
                "event": format!("{:?}", event),
            }),
        ))
        .await;
        Ok(deployment)
    }

    /// Append to the audit trail; a failing sink is logged, never fatal
    pub async fn audit(&self, entry: AuditEntry) {
        let kind = entry.kind;
        if let Err(e) = self.audit.append(entry).await {
            warn!("Failed to write {:?} audit entry: {}", kind, e);
        }
    }

    pub fn audit_trail(&self) -> Arc<dyn AuditTrail> {
        self.audit.clone()
    }
}
