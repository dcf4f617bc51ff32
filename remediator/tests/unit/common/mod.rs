//! Shared fakes for the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use remediator::app::options::EngineOptions;
use remediator::app::service::RemediationService;
use remediator::app::state::{Collaborators, EngineState};
use remediator::errors::RemediationError;
use remediator::models::asset::Asset;
use remediator::models::patch::Patch;
use remediator::remote::{CommandOutput, Connection, ExecOptions, RemoteExecutor, RetryPolicy};
use remediator::storage::audit::MemoryAuditTrail;
use remediator::storage::deployments::InMemoryDeploymentStore;
use remediator::storage::inventory::{InMemoryInventory, InMemoryPatchStore};
use remediator::telemetry::{SystemProbe, SystemSample};
use remediator::utils::{encode_script, CooldownOptions};

/// Remote executor that records every command and fails on request
#[derive(Default)]
pub struct FakeRemote {
    commands: Mutex<Vec<(String, String)>>,
    failures: Mutex<HashMap<String, HashSet<String>>>,
    stalls: Mutex<HashMap<String, HashSet<String>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `command` exit 1 on `target`
    pub fn fail_command(&self, target: &str, command: &str) {
        self.failures
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .insert(command.to_string());
    }

    /// Make `command` hang on `target` until the caller gives up on it
    pub fn stall_command(&self, target: &str, command: &str) {
        self.stalls
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .insert(command.to_string());
    }

    pub fn set_unreachable(&self, target: &str) {
        self.unreachable.lock().unwrap().insert(target.to_string());
    }

    pub fn commands_for(&self, target: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn ran(&self, target: &str, command: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|(t, c)| t == target && c == command)
    }

    /// Targets that ran `command`, in first-run order
    pub fn targets_that_ran(&self, command: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for (t, c) in self.commands.lock().unwrap().iter() {
            if c == command && !seen.contains(t) {
                seen.push(t.clone());
            }
        }
        seen
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn connect(&self, asset: &Asset) -> Result<Connection, RemediationError> {
        if self.unreachable.lock().unwrap().contains(&asset.id) {
            return Err(RemediationError::ConnectionError(format!(
                "{} refused connection",
                asset.address
            )));
        }
        Ok(Connection::open(asset))
    }

    async fn execute(
        &self,
        conn: &Connection,
        command: &str,
        _options: ExecOptions,
    ) -> Result<CommandOutput, RemediationError> {
        let target = conn.asset.id.clone();
        self.commands
            .lock()
            .unwrap()
            .push((target.clone(), command.to_string()));

        let stalls = self
            .stalls
            .lock()
            .unwrap()
            .get(&target)
            .is_some_and(|set| set.contains(command));
        if stalls {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        let fails = self
            .failures
            .lock()
            .unwrap()
            .get(&target)
            .is_some_and(|set| set.contains(command));
        Ok(if fails {
            CommandOutput {
                success: false,
                exit_code: 1,
                stdout: String::new(),
                stderr: "patch step failed".to_string(),
                duration_ms: 1,
            }
        } else {
            CommandOutput {
                success: true,
                exit_code: 0,
                stdout: "size=4096\nitems=0\n".to_string(),
                stderr: String::new(),
                duration_ms: 1,
            }
        })
    }

    async fn disconnect(&self, _conn: Connection) {}
}

/// Healthy samples by default; per-target profiles script the rest
pub struct FakeProbe {
    remote: Arc<FakeRemote>,
    patch_command: String,
    spiking: Mutex<HashSet<String>>,
    steady_cpu: Mutex<HashMap<String, f64>>,
    memory_after_patch: Mutex<HashMap<String, f64>>,
    counter_growth: Mutex<HashMap<String, u64>>,
    taken: Mutex<HashMap<String, u64>>,
}

impl FakeProbe {
    pub fn new(remote: Arc<FakeRemote>, patch: &Patch) -> Arc<Self> {
        Arc::new(Self {
            remote,
            patch_command: encode_script(&patch.content),
            spiking: Mutex::new(HashSet::new()),
            steady_cpu: Mutex::new(HashMap::new()),
            memory_after_patch: Mutex::new(HashMap::new()),
            counter_growth: Mutex::new(HashMap::new()),
            taken: Mutex::new(HashMap::new()),
        })
    }

    /// CPU on `target` goes critical after the patch is applied to it
    pub fn spike_after_patch(&self, target: &str) {
        self.spiking.lock().unwrap().insert(target.to_string());
    }

    /// CPU on `target` sits at `percent` before and after the patch
    pub fn steady_cpu(&self, target: &str, percent: f64) {
        self.steady_cpu.lock().unwrap().insert(target.to_string(), percent);
    }

    /// Memory on `target` holds at `percent` once the patch ran there
    pub fn memory_after_patch(&self, target: &str, percent: f64) {
        self.memory_after_patch
            .lock()
            .unwrap()
            .insert(target.to_string(), percent);
    }

    /// NIC counters on `target` grow by `step` bytes per sample
    pub fn grow_counters(&self, target: &str, step: u64) {
        self.counter_growth.lock().unwrap().insert(target.to_string(), step);
    }

    fn patched(&self, target: &str) -> bool {
        self.remote.ran(target, &self.patch_command)
    }
}

#[async_trait]
impl SystemProbe for FakeProbe {
    async fn sample(&self, target_id: &str) -> Result<SystemSample, RemediationError> {
        let patched = self.patched(target_id);
        let taken = {
            let mut taken = self.taken.lock().unwrap();
            let count = taken.entry(target_id.to_string()).or_default();
            *count += 1;
            *count
        };

        let cpu_percent = if patched && self.spiking.lock().unwrap().contains(target_id) {
            99.0
        } else {
            self.steady_cpu
                .lock()
                .unwrap()
                .get(target_id)
                .copied()
                .unwrap_or(20.0)
        };
        let memory_percent = match self.memory_after_patch.lock().unwrap().get(target_id) {
            Some(percent) if patched => *percent,
            _ => 40.0,
        };
        let step = self
            .counter_growth
            .lock()
            .unwrap()
            .get(target_id)
            .copied()
            .unwrap_or(0);

        Ok(SystemSample {
            cpu_percent,
            memory_percent,
            memory_available_bytes: 4 << 30,
            disk_percent: 50.0,
            disk_free_bytes: 50 << 30,
            network_bytes_sent: 1000 + step * taken,
            network_bytes_recv: 2000 + 2 * step * taken,
        })
    }
}

pub fn target_ids(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("host-{}", i)).collect()
}

/// A patch with an explicit undo script so rollback is deterministic
pub fn service_patch() -> Patch {
    let mut patch = Patch::script("patch-1", "systemctl restart nginx\necho patched");
    patch.undo_script = Some("echo reverted".to_string());
    patch
}

/// Options with millisecond waits so runs finish quickly
pub fn fast_options() -> EngineOptions {
    let mut options = EngineOptions::default();
    let retry = RetryPolicy {
        max_attempts: 2,
        backoff: CooldownOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        },
    };
    options.monitor.interval = Duration::from_millis(10);
    options.monitor.window = Duration::from_millis(30);
    options.monitor.health_check = Duration::from_millis(20);
    options.collector.baseline_samples = 2;
    options.collector.baseline_interval = Duration::from_millis(1);
    options.worker.retry = retry.clone();
    options.backup.retry = retry.clone();
    options.rollback.retry = retry.clone();
    options.retry = retry;
    options
}

pub struct Harness {
    pub service: RemediationService,
    pub remote: Arc<FakeRemote>,
    pub probe: Arc<FakeProbe>,
    pub audit: Arc<MemoryAuditTrail>,
    pub patch: Patch,
    pub patch_command: String,
    pub undo_command: String,
}

pub fn harness(targets: usize, patch: Patch) -> Harness {
    harness_with(targets, patch, fast_options())
}

pub fn harness_with(targets: usize, patch: Patch, options: EngineOptions) -> Harness {
    let remote = FakeRemote::new();
    let probe = FakeProbe::new(remote.clone(), &patch);
    let audit = Arc::new(MemoryAuditTrail::new());

    let assets = target_ids(targets)
        .into_iter()
        .enumerate()
        .map(|(i, id)| Asset::new(id, format!("10.0.0.{}", i + 1)));

    let state = EngineState::new(
        &options,
        Collaborators {
            remote: remote.clone(),
            probe: probe.clone(),
            inventory: Arc::new(InMemoryInventory::new(assets)),
            patches: Arc::new(InMemoryPatchStore::new([patch.clone()])),
            store: Arc::new(InMemoryDeploymentStore::new()),
            audit: audit.clone(),
            snapshots: None,
        },
    );

    Harness {
        service: RemediationService::new(Arc::new(state)),
        patch_command: encode_script(&patch.content),
        undo_command: encode_script(patch.undo_script.as_deref().unwrap_or_default()),
        remote,
        probe,
        audit,
        patch,
    }
}
