//! Job dispatch worker
//!
//! Consumes `Execute` and `Rollback` jobs, runs them through the service and
//! publishes one report per job. On shutdown every running job is cancelled
//! and awaited, so cancellation rollbacks finish before the worker returns.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::app::service::RemediationService;
use crate::deploy::fsm::DeploymentStatus;
use crate::models::anomaly::Anomaly;
use crate::models::metric::Metric;

/// Dispatcher worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Jobs running at the same time
    pub max_parallel_jobs: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { max_parallel_jobs: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Execute { deployment_id: String },
    Rollback { deployment_id: String, reason: String },
}

impl Job {
    pub fn deployment_id(&self) -> &str {
        match self {
            Job::Execute { deployment_id } | Job::Rollback { deployment_id, .. } => deployment_id,
        }
    }
}

/// Structured result handed back to whoever queued the job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub deployment_id: String,
    pub job: Job,
    pub accepted: bool,
    #[serde(default)]
    pub status: Option<DeploymentStatus>,
    pub summary: String,
    #[serde(default)]
    pub anomalies: Vec<Anomaly>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

async fn handle(service: &RemediationService, job: Job) -> JobReport {
    let deployment_id = job.deployment_id().to_string();
    match &job {
        Job::Execute { .. } => match service.execute(&deployment_id).await {
            Ok(outcome) => JobReport {
                deployment_id,
                accepted: true,
                status: Some(outcome.status),
                summary: outcome.summary,
                anomalies: outcome.anomalies,
                metrics: outcome.metrics,
                job,
            },
            Err(e) => {
                error!("Execute job for {} rejected: {}", deployment_id, e);
                JobReport {
                    deployment_id,
                    accepted: false,
                    status: None,
                    summary: e.to_string(),
                    anomalies: Vec::new(),
                    metrics: Vec::new(),
                    job,
                }
            }
        },
        Job::Rollback { reason, .. } => {
            let ack = service.request_rollback(&deployment_id, reason).await;
            JobReport {
                deployment_id,
                accepted: ack.accepted,
                status: ack.status,
                summary: ack.message,
                anomalies: Vec::new(),
                metrics: Vec::new(),
                job,
            }
        }
    }
}

/// Run the dispatcher until the job channel closes or shutdown fires
pub async fn run(
    options: &Options,
    service: RemediationService,
    mut jobs: mpsc::Receiver<Job>,
    reports: mpsc::Sender<JobReport>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Dispatcher worker starting...");
    let permits = Arc::new(Semaphore::new(options.max_parallel_jobs.max(1)));
    let mut running: JoinSet<String> = JoinSet::new();
    let mut active: Vec<String> = Vec::new();

    loop {
        let job = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Dispatcher worker shutting down, cancelling {} jobs...", active.len());
                for deployment_id in &active {
                    service.cancel(deployment_id);
                }
                break;
            }
            Some(done) = running.join_next(), if !running.is_empty() => {
                settle(done, &mut active);
                continue;
            }
            job = jobs.recv() => match job {
                Some(job) => job,
                None => {
                    info!("Job channel closed, dispatcher worker exiting...");
                    break;
                }
            },
        };

        debug!("Dispatching {:?}", job);
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let service = service.clone();
        let reports = reports.clone();
        active.push(job.deployment_id().to_string());
        running.spawn(async move {
            let report = handle(&service, job).await;
            drop(permit);
            let deployment_id = report.deployment_id.clone();
            if reports.send(report).await.is_err() {
                debug!("Report receiver dropped");
            }
            deployment_id
        });
    }

    while let Some(done) = running.join_next().await {
        settle(done, &mut active);
    }
    info!("Dispatcher worker stopped");
}

fn settle(done: Result<String, tokio::task::JoinError>, active: &mut Vec<String>) {
    match done {
        Ok(deployment_id) => {
            if let Some(i) = active.iter().position(|id| *id == deployment_id) {
                active.swap_remove(i);
            }
        }
        Err(e) => warn!("Dispatched job did not finish: {}", e),
    }
}
