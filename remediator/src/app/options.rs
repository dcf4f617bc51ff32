//! Engine configuration options

use std::time::Duration;

use crate::backup::BackupOptions;
use crate::deploy::fsm::FsmSettings;
use crate::deploy::monitor::MonitorOptions;
use crate::deploy::worker::WorkerOptions;
use crate::detect::DetectorConfig;
use crate::remote::ssh::SshOptions;
use crate::remote::RetryPolicy;
use crate::rollback::{DecisionConfig, RollbackOptions};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::telemetry::CollectorOptions;
use crate::utils::CooldownOptions;
use crate::workers::dispatcher;

/// Everything the engine needs, resolved from settings
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Local state layout
    pub layout: StorageLayout,

    pub detector: DetectorConfig,

    pub decision: DecisionConfig,

    pub monitor: MonitorOptions,

    pub collector: CollectorOptions,

    pub worker: WorkerOptions,

    pub backup: BackupOptions,

    pub rollback: RollbackOptions,

    pub ssh: SshOptions,

    /// Run local-transport commands through `sudo -n` when privileged
    pub local_sudo: bool,

    /// Timeout of one remote metrics probe
    pub probe_timeout: Duration,

    /// Connection retry shared by every remote call
    pub retry: RetryPolicy,

    /// FSM deployment settings
    pub fsm_settings: FsmSettings,

    /// Job dispatch worker
    pub dispatcher: dispatcher::Options,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let remote = &settings.remote;
        let retry = RetryPolicy {
            max_attempts: remote.max_connect_attempts,
            backoff: CooldownOptions {
                base_delay: Duration::from_millis(remote.retry_base_delay_ms),
                max_delay: Duration::from_millis(remote.retry_max_delay_ms),
                multiplier: 2.0,
            },
        };
        let command_timeout = Duration::from_secs(remote.command_timeout_secs);
        let monitoring = &settings.monitoring;

        Self {
            layout: StorageLayout::new(&settings.state_dir),
            detector: settings.detector.clone(),
            decision: settings.decision.clone(),
            monitor: MonitorOptions {
                interval: Duration::from_secs(monitoring.interval_secs),
                window: Duration::from_secs(monitoring.window_secs),
                health_check: Duration::from_secs(monitoring.health_check_secs),
            },
            collector: CollectorOptions {
                baseline_samples: monitoring.baseline_samples,
                baseline_interval: Duration::from_secs(monitoring.baseline_interval_secs),
            },
            worker: WorkerOptions {
                command_timeout,
                retry: retry.clone(),
            },
            backup: BackupOptions {
                enabled: settings.backup.enabled,
                root: settings.backup.root.clone(),
                command_timeout,
                retry: retry.clone(),
            },
            rollback: RollbackOptions {
                command_timeout,
                retry: retry.clone(),
            },
            ssh: SshOptions {
                binary: remote.ssh_binary.clone(),
                connect_timeout: Duration::from_secs(remote.connect_timeout_secs),
                strict_host_key_checking: remote.strict_host_key_checking,
            },
            local_sudo: remote.local_sudo,
            probe_timeout: Duration::from_secs(remote.connect_timeout_secs.max(1) * 3),
            retry,
            fsm_settings: FsmSettings {
                max_retries: settings.max_retries,
            },
            dispatcher: dispatcher::Options::default(),
        }
    }
}
