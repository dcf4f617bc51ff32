//! Executor for the host the engine runs on

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::RemediationError;
use crate::models::asset::Asset;
use crate::remote::process::run_process;
use crate::remote::{CommandOutput, Connection, ExecOptions, RemoteExecutor};

#[derive(Debug, Default)]
pub struct LocalExecutor {
    /// Elevate privileged commands with `sudo -n`; off when already root
    use_sudo: bool,
}

impl LocalExecutor {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn connect(&self, asset: &Asset) -> Result<Connection, RemediationError> {
        Ok(Connection::open(asset))
    }

    async fn execute(
        &self,
        _conn: &Connection,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandOutput, RemediationError> {
        let mut cmd = if options.privileged && self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", "sh", "-c", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        };
        cmd.env("LC_ALL", "C");
        run_process(cmd, options.timeout, "local exec").await
    }

    async fn disconnect(&self, conn: Connection) {
        debug!("Local connection {} released", conn.id);
    }
}
