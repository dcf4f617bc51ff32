//! Point-in-time system samples from one host

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System};

use crate::errors::RemediationError;
use crate::models::asset::Transport;
use crate::remote::{connect_with_retry, ExecOptions, RemoteExecutor, RetryPolicy};
use crate::storage::inventory::AssetInventory;

/// Raw host counters behind the system metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_available_bytes: u64,
    pub disk_percent: f64,
    pub disk_free_bytes: u64,
    pub network_bytes_sent: u64,
    pub network_bytes_recv: u64,
}

/// Source of system samples
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn sample(&self, target_id: &str) -> Result<SystemSample, RemediationError>;
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        (part / whole * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Samples the orchestrator host itself
#[derive(Debug, Default)]
pub struct LocalProbe;

impl LocalProbe {
    fn collect() -> SystemSample {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.iter().next());
        let (disk_total, disk_free) = root
            .map(|d| (d.total_space(), d.available_space()))
            .unwrap_or((0, 0));

        let networks = Networks::new_with_refreshed_list();
        let (mut sent, mut recv) = (0u64, 0u64);
        for (_name, data) in networks.list() {
            sent += data.total_transmitted();
            recv += data.total_received();
        }

        let total_memory = sys.total_memory();
        let available = sys.available_memory();
        SystemSample {
            cpu_percent: sys.global_cpu_usage() as f64,
            memory_percent: percent(total_memory.saturating_sub(available) as f64, total_memory as f64),
            memory_available_bytes: available,
            disk_percent: percent(disk_total.saturating_sub(disk_free) as f64, disk_total as f64),
            disk_free_bytes: disk_free,
            network_bytes_sent: sent,
            network_bytes_recv: recv,
        }
    }
}

#[async_trait]
impl SystemProbe for LocalProbe {
    async fn sample(&self, _target_id: &str) -> Result<SystemSample, RemediationError> {
        tokio::task::spawn_blocking(Self::collect)
            .await
            .map_err(|e| RemediationError::Internal(format!("local probe task failed: {}", e)))
    }
}

/// One command gathering everything the remote parser needs
const PROBE_COMMAND: &str = "echo @@stat; head -n1 /proc/stat; sleep 1; head -n1 /proc/stat; \
echo @@meminfo; cat /proc/meminfo; \
echo @@df; df -P -B1 / | tail -n1; \
echo @@net; cat /proc/net/dev";

/// Samples a target by reading `/proc` through the remote executor.
///
/// Local-transport assets are the orchestrator host and go through [`LocalProbe`].
pub struct RemoteProbe {
    inventory: Arc<dyn AssetInventory>,
    remote: Arc<dyn RemoteExecutor>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl RemoteProbe {
    pub fn new(
        inventory: Arc<dyn AssetInventory>,
        remote: Arc<dyn RemoteExecutor>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            inventory,
            remote,
            retry,
            timeout,
        }
    }
}

#[async_trait]
impl SystemProbe for RemoteProbe {
    async fn sample(&self, target_id: &str) -> Result<SystemSample, RemediationError> {
        let asset = self.inventory.get_asset(target_id).await?;
        if asset.transport == Transport::Local {
            return LocalProbe.sample(target_id).await;
        }
        let conn = connect_with_retry(self.remote.as_ref(), &asset, &self.retry, None).await?;
        let output = self
            .remote
            .execute(&conn, PROBE_COMMAND, ExecOptions::unprivileged(self.timeout))
            .await;
        self.remote.disconnect(conn).await;

        let output = output?;
        if !output.success {
            return Err(RemediationError::ExecutionError(format!(
                "probe on {} exited with {}",
                target_id, output.exit_code
            )));
        }
        parse_probe_output(&output.stdout)
    }
}

/// Split probe output into its `@@` sections
fn section<'a>(output: &'a str, name: &str) -> Vec<&'a str> {
    let marker = format!("@@{}", name);
    output
        .lines()
        .skip_while(|l| l.trim() != marker)
        .skip(1)
        .take_while(|l| !l.starts_with("@@"))
        .collect()
}

/// (busy, total) jiffies from a `cpu` line of /proc/stat
fn cpu_jiffies(line: &str) -> Option<(u64, u64)> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.take(8).filter_map(|f| f.parse().ok()).collect();
    if values.len() < 5 {
        return None;
    }
    let total: u64 = values.iter().sum();
    let idle = values[3] + values[4];
    Some((total - idle, total))
}

pub(crate) fn parse_cpu(lines: &[&str]) -> Option<f64> {
    let samples: Vec<(u64, u64)> = lines.iter().filter_map(|l| cpu_jiffies(l)).collect();
    let [(busy1, total1), (busy2, total2)] = samples.as_slice() else {
        return None;
    };
    let total = total2.checked_sub(*total1)?;
    let busy = busy2.saturating_sub(*busy1);
    Some(percent(busy as f64, total as f64))
}

/// (percent used, available bytes) from /proc/meminfo
pub(crate) fn parse_meminfo(lines: &[&str]) -> Option<(f64, u64)> {
    let field = |key: &str| -> Option<u64> {
        lines.iter().find_map(|l| {
            let rest = l.strip_prefix(key)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable").or_else(|| field("MemFree"))?;
    Some((
        percent(total.saturating_sub(available) as f64, total as f64),
        available * 1024,
    ))
}

/// (percent used, free bytes) from one `df -P -B1` data line
pub(crate) fn parse_df(lines: &[&str]) -> Option<(f64, u64)> {
    let fields: Vec<&str> = lines.last()?.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    let used: u64 = fields[2].parse().ok()?;
    let free: u64 = fields[3].parse().ok()?;
    Some((percent(used as f64, (used + free) as f64), free))
}

/// (bytes sent, bytes received) summed over non-loopback interfaces
pub(crate) fn parse_net_dev(lines: &[&str]) -> (u64, u64) {
    let mut sent = 0u64;
    let mut recv = 0u64;
    for line in lines {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let values: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.len() >= 9 {
            recv += values[0];
            sent += values[8];
        }
    }
    (sent, recv)
}

pub(crate) fn parse_probe_output(output: &str) -> Result<SystemSample, RemediationError> {
    let malformed = |what: &str| RemediationError::ExecutionError(format!("malformed probe output: {}", what));

    let cpu_percent = parse_cpu(&section(output, "stat")).ok_or_else(|| malformed("/proc/stat"))?;
    let (memory_percent, memory_available_bytes) =
        parse_meminfo(&section(output, "meminfo")).ok_or_else(|| malformed("/proc/meminfo"))?;
    let (disk_percent, disk_free_bytes) = parse_df(&section(output, "df")).ok_or_else(|| malformed("df"))?;
    let (network_bytes_sent, network_bytes_recv) = parse_net_dev(&section(output, "net"));

    Ok(SystemSample {
        cpu_percent,
        memory_percent,
        memory_available_bytes,
        disk_percent,
        disk_free_bytes,
        network_bytes_sent,
        network_bytes_recv,
    })
}
