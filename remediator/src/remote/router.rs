//! Transport dispatch

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::RemediationError;
use crate::models::asset::{Asset, Transport};
use crate::remote::{CommandOutput, Connection, ExecOptions, RemoteExecutor};

/// Picks the executor matching each asset's transport
pub struct TransportRouter {
    ssh: Arc<dyn RemoteExecutor>,
    local: Arc<dyn RemoteExecutor>,
    container: Arc<dyn RemoteExecutor>,
}

impl TransportRouter {
    pub fn new(
        ssh: Arc<dyn RemoteExecutor>,
        local: Arc<dyn RemoteExecutor>,
        container: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            ssh,
            local,
            container,
        }
    }

    fn route(&self, transport: Transport) -> &dyn RemoteExecutor {
        match transport {
            Transport::Ssh => self.ssh.as_ref(),
            Transport::Local => self.local.as_ref(),
            Transport::Container => self.container.as_ref(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for TransportRouter {
    async fn connect(&self, asset: &Asset) -> Result<Connection, RemediationError> {
        self.route(asset.transport).connect(asset).await
    }

    async fn execute(
        &self,
        conn: &Connection,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandOutput, RemediationError> {
        self.route(conn.asset.transport)
            .execute(conn, command, options)
            .await
    }

    async fn disconnect(&self, conn: Connection) {
        self.route(conn.asset.transport).disconnect(conn).await
    }
}
