//! Settings file management

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::detect::DetectorConfig;
use crate::errors::RemediationError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::rollback::decision::DecisionConfig;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily-rotated log files under the state directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Local state directory (audit trail, logs)
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Post-change monitoring
    #[serde(default)]
    pub monitoring: MonitoringSettings,

    /// Anomaly detection thresholds
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Rollback decision policy
    #[serde(default)]
    pub decision: DecisionConfig,

    /// Remote execution
    #[serde(default)]
    pub remote: RemoteSettings,

    /// Pre-change backups
    #[serde(default)]
    pub backup: BackupSettings,

    /// Maximum retries of a failed deployment
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_state_dir() -> String {
    "/var/lib/remediator".to_string()
}

fn default_max_retries() -> u32 {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            state_dir: default_state_dir(),
            monitoring: MonitoringSettings::default(),
            detector: DetectorConfig::default(),
            decision: DecisionConfig::default(),
            remote: RemoteSettings::default(),
            backup: BackupSettings::default(),
            max_retries: default_max_retries(),
        }
    }
}

impl Settings {
    /// Load settings from `file`; a missing file yields the defaults
    pub async fn load(file: &File) -> Result<Self, RemediationError> {
        if !file.exists().await {
            info!("No settings file at {}, using defaults", file.path().display());
            return Ok(Self::default());
        }
        let settings: Settings = file.read_json().await?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), RemediationError> {
        if self.monitoring.interval_secs == 0 {
            return Err(RemediationError::ConfigError(
                "monitoring.interval_secs must be positive".to_string(),
            ));
        }
        if self.remote.max_connect_attempts == 0 {
            return Err(RemediationError::ConfigError(
                "remote.max_connect_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.decision.error_rate_threshold) {
            return Err(RemediationError::ConfigError(
                "decision.error_rate_threshold must be a percentage".to_string(),
            ));
        }
        for (name, rule) in &self.detector.thresholds {
            let ordered = if rule.inverted {
                rule.critical <= rule.high
            } else {
                rule.critical >= rule.high
            };
            if !ordered {
                return Err(RemediationError::ConfigError(format!(
                    "detector threshold for {} has critical bound on the wrong side of high",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    /// Seconds between samples inside a monitoring window
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Default monitoring window after a phase
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Short health check between rolling batches
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,

    /// Snapshots taken per target for the baseline
    #[serde(default = "default_baseline_samples")]
    pub baseline_samples: usize,

    /// Spacing between baseline snapshots
    #[serde(default = "default_baseline_interval_secs")]
    pub baseline_interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_window_secs() -> u64 {
    300
}

fn default_health_check_secs() -> u64 {
    30
}

fn default_baseline_samples() -> usize {
    3
}

fn default_baseline_interval_secs() -> u64 {
    5
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            window_secs: default_window_secs(),
            health_check_secs: default_health_check_secs(),
            baseline_samples: default_baseline_samples(),
            baseline_interval_secs: default_baseline_interval_secs(),
        }
    }
}

/// Remote execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Connection attempts before a target is marked unreachable
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// ssh client binary
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,

    /// Verify host keys against known_hosts
    #[serde(default = "default_true")]
    pub strict_host_key_checking: bool,

    /// Wrap privileged commands on the local transport in `sudo -n`
    #[serde(default)]
    pub local_sudo: bool,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_max_connect_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            max_connect_attempts: default_max_connect_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            ssh_binary: default_ssh_binary(),
            strict_host_key_checking: true,
            local_sudo: false,
        }
    }
}

/// Backup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Backup root on each target
    #[serde(default = "default_backup_root")]
    pub root: String,
}

fn default_backup_root() -> String {
    "/var/backups/remediator".to_string()
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            root: default_backup_root(),
        }
    }
}
