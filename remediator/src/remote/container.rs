//! Executor for assets that are running containers

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::RemediationError;
use crate::models::asset::Asset;
use crate::remote::process::run_process;
use crate::remote::{CommandOutput, Connection, ExecOptions, RemoteExecutor};

/// Runs commands through `docker exec`; the asset address is the container name
pub struct ContainerExecutor {
    runtime: String,
    connect_timeout: Duration,
}

impl ContainerExecutor {
    pub fn new(runtime: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            runtime: runtime.into(),
            connect_timeout,
        }
    }
}

impl Default for ContainerExecutor {
    fn default() -> Self {
        Self::new("docker", Duration::from_secs(10))
    }
}

#[async_trait]
impl RemoteExecutor for ContainerExecutor {
    async fn connect(&self, asset: &Asset) -> Result<Connection, RemediationError> {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(["inspect", "-f", "{{.State.Running}}", &asset.address]);

        let output = run_process(cmd, self.connect_timeout, "container inspect")
            .await
            .map_err(|e| RemediationError::ConnectionError(format!("{}: {}", asset.id, e)))?;
        if !output.success || output.stdout.trim() != "true" {
            return Err(RemediationError::ConnectionError(format!(
                "container {} is not running",
                asset.address
            )));
        }
        Ok(Connection::open(asset))
    }

    async fn execute(
        &self,
        conn: &Connection,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandOutput, RemediationError> {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("exec");
        if options.privileged {
            cmd.args(["-u", "0"]);
        }
        cmd.arg(&conn.asset.address).args(["sh", "-c", command]);
        run_process(cmd, options.timeout, "container exec").await
    }

    async fn disconnect(&self, conn: Connection) {
        debug!("Container connection {} to {} closed", conn.id, conn.asset.address);
    }
}
