//! Run one deployment plan end to end

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::app::options::EngineOptions;
use crate::app::service::{DeploymentRequest, RemediationService};
use crate::app::state::EngineState;
use crate::errors::RemediationError;
use crate::models::asset::Asset;
use crate::models::patch::Patch;
use crate::storage::inventory::{InMemoryInventory, InMemoryPatchStore};
use crate::workers::dispatcher::{self, Job, JobReport};

/// Assets, patches and the deployment to run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub assets: Vec<Asset>,
    pub patches: Vec<Patch>,
    pub deployment: DeploymentRequest,
}

/// Execute `plan` through the dispatcher.
///
/// `shutdown_signal` cancels the running deployment; touched targets are
/// still rolled back before this returns.
pub async fn run(
    options: EngineOptions,
    plan: Plan,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JobReport, RemediationError> {
    info!(
        "Loaded plan with {} assets and {} patches",
        plan.assets.len(),
        plan.patches.len()
    );
    let inventory = Arc::new(InMemoryInventory::new(plan.assets));
    let patches = Arc::new(InMemoryPatchStore::new(plan.patches));
    let state = Arc::new(EngineState::init(&options, inventory, patches).await?);
    let service = RemediationService::new(state);

    let snapshot = service.start_deployment(plan.deployment).await?;
    let deployment_id = snapshot.id.clone();

    let (shutdown_tx, _): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let (job_tx, job_rx) = mpsc::channel::<Job>(8);
    let (report_tx, mut report_rx) = mpsc::channel::<JobReport>(8);

    let mut worker_shutdown = shutdown_tx.subscribe();
    let dispatcher_options = options.dispatcher.clone();
    let worker_service = service.clone();
    let worker = tokio::spawn(async move {
        dispatcher::run(
            &dispatcher_options,
            worker_service,
            job_rx,
            report_tx,
            Box::pin(async move {
                let _ = worker_shutdown.recv().await;
            }),
        )
        .await;
    });

    job_tx
        .send(Job::Execute {
            deployment_id: deployment_id.clone(),
        })
        .await
        .map_err(|e| RemediationError::Internal(format!("dispatcher unavailable: {}", e)))?;

    tokio::pin!(shutdown_signal);
    let report = tokio::select! {
        report = report_rx.recv() => report,
        _ = &mut shutdown_signal => {
            warn!("Shutdown signal received, cancelling deployment {}...", deployment_id);
            service.cancel(&deployment_id);
            report_rx.recv().await
        }
    };

    let _ = shutdown_tx.send(());
    drop(job_tx);
    if let Err(e) = worker.await {
        error!("Dispatcher worker ended abnormally: {}", e);
    }

    report.ok_or_else(|| {
        RemediationError::Internal(format!("no report produced for deployment {}", deployment_id))
    })
}
