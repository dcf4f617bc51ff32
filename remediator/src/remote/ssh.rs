//! SSH executor backed by the system `ssh` client

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::RemediationError;
use crate::models::asset::Asset;
use crate::remote::process::{run_process, shell_wrap};
use crate::remote::{CommandOutput, Connection, ExecOptions, RemoteExecutor};

/// ssh reserves this exit status for its own failures
const SSH_ERROR_EXIT: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub binary: String,
    pub connect_timeout: Duration,
    pub strict_host_key_checking: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
            strict_host_key_checking: true,
        }
    }
}

/// One `ssh` process per command; connections carry only the endpoint
pub struct SshExecutor {
    options: SshOptions,
}

impl SshExecutor {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn destination(asset: &Asset) -> String {
        if asset.credentials.username.is_empty() {
            asset.address.clone()
        } else {
            format!("{}@{}", asset.credentials.username, asset.address)
        }
    }

    fn build_command(&self, asset: &Asset, remote_command: &str) -> Command {
        let password = asset.credentials.password.as_ref();
        let mut cmd = match password {
            Some(secret) => {
                // sshpass reads the password from SSHPASS so it never lands in argv
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e")
                    .arg(&self.options.binary)
                    .env("SSHPASS", secret.expose_secret());
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.options.binary);
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };

        let host_keys = if self.options.strict_host_key_checking {
            "StrictHostKeyChecking=yes"
        } else {
            "StrictHostKeyChecking=accept-new"
        };
        cmd.args(["-o", host_keys])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout.as_secs().max(1)
            ))
            .arg("-p")
            .arg(asset.port.to_string());
        if let Some(identity) = &asset.credentials.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(Self::destination(asset)).arg("--").arg(remote_command);
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn connect(&self, asset: &Asset) -> Result<Connection, RemediationError> {
        let cmd = self.build_command(asset, "true");
        // Allow the client its own connect timeout plus handshake slack
        let budget = self.options.connect_timeout + Duration::from_secs(5);

        let output = run_process(cmd, budget, "ssh connect")
            .await
            .map_err(|e| RemediationError::ConnectionError(format!("{}: {}", asset.id, e)))?;
        if !output.success {
            return Err(RemediationError::ConnectionError(format!(
                "{} unreachable (exit {}): {}",
                asset.id,
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let conn = Connection::open(asset);
        info!("SSH connection {} opened to {}", conn.id, Self::destination(asset));
        Ok(conn)
    }

    async fn execute(
        &self,
        conn: &Connection,
        command: &str,
        options: ExecOptions,
    ) -> Result<CommandOutput, RemediationError> {
        let cmd = self.build_command(&conn.asset, &shell_wrap(command, options.privileged));
        let output = run_process(cmd, options.timeout, "ssh exec").await?;

        if output.exit_code == SSH_ERROR_EXIT && output.stderr.contains("ssh:") {
            return Err(RemediationError::ConnectionError(format!(
                "{} dropped: {}",
                conn.asset.id,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn disconnect(&self, conn: Connection) {
        debug!("SSH connection {} to {} closed", conn.id, conn.asset.id);
    }
}
