//! Child process plumbing shared by the concrete executors

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

use crate::errors::RemediationError;
use crate::remote::CommandOutput;

/// Run `command` to completion, capturing output, bounded by `timeout`.
///
/// The child is killed if the timeout elapses.
pub async fn run_process(
    mut command: Command,
    timeout: Duration,
    label: &str,
) -> Result<CommandOutput, RemediationError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let child = command
        .spawn()
        .map_err(|e| RemediationError::ExecutionError(format!("Failed to spawn {}: {}", label, e)))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(RemediationError::ExecutionError(format!(
                "Failed to wait for {}: {}",
                label, e
            )))
        }
        Err(_) => {
            return Err(RemediationError::Timeout(format!(
                "{} exceeded {:?}",
                label, timeout
            )))
        }
    };

    let result = CommandOutput {
        success: output.status.success(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration_ms: started.elapsed().as_millis() as u64,
    };
    debug!(
        "{} exited with {} after {}ms",
        label, result.exit_code, result.duration_ms
    );
    Ok(result)
}

/// Wrap a command for the remote shell, elevating through non-interactive sudo
pub fn shell_wrap(command: &str, privileged: bool) -> String {
    let quoted = crate::utils::shell_quote(command);
    if privileged {
        format!("sudo -n sh -c {}", quoted)
    } else {
        format!("sh -c {}", quoted)
    }
}
