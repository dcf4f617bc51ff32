//! Engine state: the wired component graph

use std::sync::Arc;

use tracing::info;

use crate::app::options::EngineOptions;
use crate::backup::BackupManager;
use crate::deploy::executor::DeploymentExecutor;
use crate::deploy::fsm::FsmSettings;
use crate::deploy::guard::InFlight;
use crate::deploy::monitor::Monitor;
use crate::deploy::worker::TargetWorker;
use crate::detect::AnomalyDetector;
use crate::errors::RemediationError;
use crate::remote::container::ContainerExecutor;
use crate::remote::local::LocalExecutor;
use crate::remote::router::TransportRouter;
use crate::remote::ssh::SshExecutor;
use crate::remote::RemoteExecutor;
use crate::rollback::{DecisionPolicy, RollbackDecisionEngine, RollbackExecutor, SnapshotProvider};
use crate::storage::audit::{AuditTrail, FileAuditTrail};
use crate::storage::deployments::{DeploymentRecords, DeploymentStore, InMemoryDeploymentStore};
use crate::storage::inventory::{AssetInventory, PatchStore};
use crate::telemetry::{MetricsCollector, RemoteProbe, SystemProbe};

/// Interfaces owned outside the engine
pub struct Collaborators {
    pub remote: Arc<dyn RemoteExecutor>,
    pub probe: Arc<dyn SystemProbe>,
    pub inventory: Arc<dyn AssetInventory>,
    pub patches: Arc<dyn PatchStore>,
    pub store: Arc<dyn DeploymentStore>,
    pub audit: Arc<dyn AuditTrail>,
    pub snapshots: Option<Arc<dyn SnapshotProvider>>,
}

/// Main engine state
pub struct EngineState {
    pub records: Arc<DeploymentRecords>,

    pub inventory: Arc<dyn AssetInventory>,

    pub patches: Arc<dyn PatchStore>,

    pub detector: Arc<AnomalyDetector>,

    pub collector: Arc<MetricsCollector>,

    pub engine: Arc<RollbackDecisionEngine>,

    pub executor: Arc<DeploymentExecutor>,

    /// Deployments currently executing or rolling back
    pub inflight: Arc<InFlight>,

    pub fsm_settings: FsmSettings,
}

impl EngineState {
    /// Wire the engine around externally provided collaborators
    pub fn new(options: &EngineOptions, collaborators: Collaborators) -> Self {
        let Collaborators {
            remote,
            probe,
            inventory,
            patches,
            store,
            audit,
            snapshots,
        } = collaborators;

        let records = Arc::new(DeploymentRecords::new(store, audit));
        let detector = Arc::new(AnomalyDetector::new(options.detector.clone()));
        let policy = DecisionPolicy::new(options.decision.clone());
        let collector = Arc::new(MetricsCollector::new(
            probe,
            records.clone(),
            options.collector.clone(),
        ));

        let mut rollback_executor = RollbackExecutor::new(remote.clone(), options.rollback.clone());
        if let Some(provider) = snapshots {
            rollback_executor = rollback_executor.with_snapshots(provider);
        }
        let engine = Arc::new(RollbackDecisionEngine::new(
            policy.clone(),
            records.clone(),
            inventory.clone(),
            patches.clone(),
            Arc::new(rollback_executor),
        ));

        let backups = Arc::new(BackupManager::new(remote.clone(), options.backup.clone()));
        let worker = Arc::new(TargetWorker::new(
            remote,
            inventory.clone(),
            backups,
            records.clone(),
            options.worker.clone(),
        ));
        let monitor = Monitor::new(
            collector.clone(),
            detector.clone(),
            policy,
            records.clone(),
            options.monitor.clone(),
        );
        let executor = Arc::new(DeploymentExecutor::new(
            records.clone(),
            inventory.clone(),
            patches.clone(),
            worker,
            collector.clone(),
            monitor,
            engine.clone(),
        ));

        Self {
            records,
            inventory,
            patches,
            detector,
            collector,
            engine,
            executor,
            inflight: InFlight::new(),
            fsm_settings: options.fsm_settings.clone(),
        }
    }

    /// Production wiring: transport router, remote probes, file audit trail
    pub async fn init(
        options: &EngineOptions,
        inventory: Arc<dyn AssetInventory>,
        patches: Arc<dyn PatchStore>,
    ) -> Result<Self, RemediationError> {
        info!("Initializing engine state...");
        options.layout.setup().await?;

        let remote: Arc<dyn RemoteExecutor> = Arc::new(TransportRouter::new(
            Arc::new(SshExecutor::new(options.ssh.clone())),
            Arc::new(LocalExecutor::new(options.local_sudo)),
            Arc::new(ContainerExecutor::default()),
        ));
        let probe = Arc::new(RemoteProbe::new(
            inventory.clone(),
            remote.clone(),
            options.retry.clone(),
            options.probe_timeout,
        ));
        let audit = Arc::new(FileAuditTrail::new(options.layout.audit_file()));

        Ok(Self::new(
            options,
            Collaborators {
                remote,
                probe,
                inventory,
                patches,
                store: Arc::new(InMemoryDeploymentStore::new()),
                audit,
                snapshots: None,
            },
        ))
    }
}
