//! End-to-end deployment runs against scripted targets

mod common;

use std::sync::Arc;
use std::time::Duration;

use remediator::app::service::DeploymentRequest;
use remediator::deploy::fsm::DeploymentStatus;
use remediator::errors::RemediationError;
use remediator::models::anomaly::{AnomalyType, Severity};
use remediator::models::deployment::{Strategy, StrategyParams, TargetOutcome};
use remediator::models::patch::{PatchStatus, PatchType};
use remediator::models::rollback::RollbackReason;
use remediator::storage::audit::{AuditKind, AuditTrail};

use common::{harness, service_patch, target_ids};

fn request(strategy: Strategy, params: StrategyParams, targets: usize) -> DeploymentRequest {
    DeploymentRequest {
        patch_id: "patch-1".to_string(),
        target_ids: target_ids(targets),
        strategy,
        params,
        scheduled_at: None,
    }
}

#[tokio::test]
async fn test_rolling_failure_halts_before_final_batch() {
    let h = harness(5, service_patch());
    h.remote.fail_command("host-3", &h.patch_command);

    let params = StrategyParams {
        batch_size: Some(2),
        ..Default::default()
    };
    let created = h
        .service
        .start_deployment(request(Strategy::Rolling, params, 5))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Failed);
    assert_eq!(
        h.remote.targets_that_ran(&h.patch_command),
        vec!["host-1", "host-2", "host-3", "host-4"]
    );
    assert!(h.remote.commands_for("host-5").is_empty());

    let snapshot = h.service.get_deployment_state(&created.id).await.unwrap();
    assert_eq!(snapshot.phases_completed, 2);
    assert_eq!(snapshot.succeeded, vec!["host-1", "host-2", "host-4"]);
    assert_eq!(snapshot.failed, vec!["host-3"]);
    assert_eq!(snapshot.not_attempted, vec!["host-5"]);
    assert!(!snapshot.rolled_back);
    assert!(h.remote.targets_that_ran(&h.undo_command).is_empty());

    assert!(outcome.summary.contains("Not attempted (1): host-5"));
    assert!(outcome.summary.contains("Failed (1): host-3"));
}

#[tokio::test]
async fn test_canary_critical_anomaly_rolls_back_first_phase_only() {
    let h = harness(10, service_patch());
    h.probe.spike_after_patch("host-1");
    h.probe.spike_after_patch("host-2");

    let params = StrategyParams {
        canary_percentages: vec![20, 50, 100],
        ..Default::default()
    };
    let created = h
        .service
        .start_deployment(request(Strategy::Canary, params, 10))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::RolledBack);
    assert_eq!(h.remote.targets_that_ran(&h.patch_command), vec!["host-1", "host-2"]);
    assert_eq!(h.remote.targets_that_ran(&h.undo_command), vec!["host-1", "host-2"]);
    assert!(outcome
        .decision
        .as_ref()
        .is_some_and(|d| d.reason == RollbackReason::CriticalAnomaly));

    let snapshot = h.service.get_deployment_state(&created.id).await.unwrap();
    assert_eq!(snapshot.phases_completed, 1);
    assert_eq!(snapshot.canary_percentage, Some(20));
    assert!(snapshot.rolled_back);
    assert_eq!(snapshot.rolled_back_targets.len(), 2);
    assert_eq!(snapshot.not_attempted.len(), 8);

    let audit = h.audit.entries(&created.id).await.unwrap();
    assert!(audit.iter().any(|e| e.kind == AuditKind::AnomalyBatch));
    assert_eq!(
        audit
            .iter()
            .filter(|e| e.kind == AuditKind::RollbackOutcome)
            .count(),
        2
    );
}

#[tokio::test]
async fn test_all_at_once_success_covers_every_target_once() {
    let h = harness(4, service_patch());
    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 4))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Success);
    for target in target_ids(4) {
        let runs = h
            .remote
            .commands_for(&target)
            .into_iter()
            .filter(|c| *c == h.patch_command)
            .count();
        assert_eq!(runs, 1, "{} ran the patch {} times", target, runs);
    }

    let deployment = h.service.state().records.get(&created.id).await.unwrap();
    assert_eq!(deployment.backups.len(), 4);
    assert!(deployment.backups.values().all(|b| b.success));
    assert_eq!(deployment.baseline.len(), 4);
}

#[tokio::test]
async fn test_blue_green_marks_cutover_ready() {
    let h = harness(3, service_patch());
    let params = StrategyParams {
        blue_targets: vec!["blue-1".to_string()],
        ..Default::default()
    };
    let created = h
        .service
        .start_deployment(request(Strategy::BlueGreen, params, 3))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Success);
    let snapshot = h.service.get_deployment_state(&created.id).await.unwrap();
    assert!(snapshot.cutover_ready);
}

#[tokio::test]
async fn test_unapproved_patch_fails_pre_check() {
    let mut patch = service_patch();
    patch.status = PatchStatus::Draft;
    let h = harness(2, patch);

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 2))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Failed);
    assert!(h.remote.targets_that_ran(&h.patch_command).is_empty());
    let deployment = h.service.state().records.get(&created.id).await.unwrap();
    let check = deployment.pre_check.unwrap();
    assert!(!check.passed);
    assert!(check.errors.iter().any(|e| e.contains("not approved")));
}

#[tokio::test]
async fn test_manual_patch_fails_pre_check() {
    let mut patch = service_patch();
    patch.patch_type = PatchType::Manual;
    let h = harness(1, patch);

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 1))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();
    assert_eq!(outcome.status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_unreachable_target_fails_without_being_reverted() {
    let h = harness(2, service_patch());
    h.remote.set_unreachable("host-2");
    let params = StrategyParams {
        max_failure_rate: 0.5,
        ..Default::default()
    };

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, params, 2))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();

    // Within the phase gate, but the 50% error rate trips the monitor
    assert_eq!(outcome.status, DeploymentStatus::RolledBack);
    assert_eq!(h.remote.targets_that_ran(&h.undo_command), vec!["host-1"]);

    let deployment = h.service.state().records.get(&created.id).await.unwrap();
    let host2 = deployment
        .target_results()
        .find(|t| t.target_id == "host-2")
        .unwrap();
    assert_eq!(host2.outcome, TargetOutcome::ConnectionFailed);
    assert!(host2.unbacked);
}

#[tokio::test]
async fn test_second_execution_is_rejected_while_in_flight() {
    let h = harness(1, service_patch());
    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 1))
        .await
        .unwrap();

    let _claim = h.service.state().inflight.acquire(&created.id).unwrap();
    let err = h.service.execute(&created.id).await.unwrap_err();
    assert!(matches!(err, RemediationError::DeploymentBusy(_)));

    let ack = h.service.request_rollback(&created.id, "operator").await;
    assert!(!ack.accepted);
}

#[tokio::test]
async fn test_executing_twice_is_rejected_after_completion() {
    let h = harness(1, service_patch());
    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 1))
        .await
        .unwrap();
    h.service.execute(&created.id).await.unwrap();

    let err = h.service.execute(&created.id).await.unwrap_err();
    assert!(matches!(err, RemediationError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_manual_rollback_after_failure_then_retry() {
    let h = harness(3, service_patch());
    h.remote.fail_command("host-2", &h.patch_command);
    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 3))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();
    assert_eq!(outcome.status, DeploymentStatus::Failed);

    let ack = h.service.request_rollback(&created.id, "operator request").await;
    assert!(ack.accepted);
    assert_eq!(ack.status, Some(DeploymentStatus::RolledBack));
    // Execution failures may have partially applied, so they are reverted too
    assert_eq!(h.remote.targets_that_ran(&h.undo_command).len(), 3);

    let again = h.service.request_rollback(&created.id, "operator request").await;
    assert!(!again.accepted);

    let retry = h.service.retry_deployment(&created.id).await.unwrap();
    assert_eq!(retry.status, DeploymentStatus::Pending);
    assert_eq!(retry.retry_count, 1);
    let record = h.service.state().records.get(&retry.id).await.unwrap();
    assert_eq!(record.parent_deployment_id.as_deref(), Some(created.id.as_str()));
}

#[tokio::test]
async fn test_retry_limit_is_enforced() {
    let mut options = common::fast_options();
    options.fsm_settings.max_retries = 0;
    let h = common::harness_with(1, service_patch(), options);
    h.remote.fail_command("host-1", &h.patch_command);

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 1))
        .await
        .unwrap();
    h.service.execute(&created.id).await.unwrap();

    let err = h.service.retry_deployment(&created.id).await.unwrap_err();
    assert!(matches!(err, RemediationError::ValidationError(_)));
}

#[tokio::test]
async fn test_retry_rejects_successful_deployment() {
    let h = harness(1, service_patch());
    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 1))
        .await
        .unwrap();
    h.service.execute(&created.id).await.unwrap();

    let err = h.service.retry_deployment(&created.id).await.unwrap_err();
    assert!(matches!(err, RemediationError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_cancel_mid_monitoring_reverts_touched_targets() {
    let mut options = common::fast_options();
    options.monitor.window = Duration::from_secs(30);
    options.monitor.interval = Duration::from_millis(20);
    let h = Arc::new(common::harness_with(2, service_patch(), options));

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 2))
        .await
        .unwrap();

    let runner = {
        let h = h.clone();
        let id = created.id.clone();
        tokio::spawn(async move { h.service.execute(&id).await })
    };

    // Wait for the patch to land, then cancel during the monitoring window
    for _ in 0..200 {
        if h.remote.targets_that_ran(&h.patch_command).len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.service.cancel(&created.id));

    let outcome = runner.await.unwrap().unwrap();
    assert_eq!(outcome.status, DeploymentStatus::Cancelled);
    assert_eq!(h.remote.targets_that_ran(&h.undo_command).len(), 2);

    let deployment = h.service.state().records.get(&created.id).await.unwrap();
    assert_eq!(deployment.rollback_reason.as_deref(), Some("cancelled"));
    assert!(!h.service.cancel(&created.id));
}

#[tokio::test]
async fn test_evaluate_health_scores_spiking_targets() {
    let mut options = common::fast_options();
    options.decision.auto_rollback_enabled = false;
    let h = common::harness_with(2, service_patch(), options);
    h.probe.spike_after_patch("host-1");

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 2))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();
    assert_eq!(outcome.status, DeploymentStatus::Success);

    let report = h.service.evaluate_health(&created.id).await.unwrap();
    assert!(report.health_score < 100);
    assert!(report.anomalies.iter().any(|a| a.metric_name == "cpu_percent"));
    assert!(!report.decision.should_rollback);
}

/// Several ticks per window so verdicts are exercised more than once
fn long_window() -> remediator::app::options::EngineOptions {
    let mut options = common::fast_options();
    options.monitor.window = Duration::from_millis(100);
    options.monitor.interval = Duration::from_millis(10);
    options
}

#[tokio::test]
async fn test_steady_high_cpu_does_not_add_up_across_ticks() {
    let h = common::harness_with(2, service_patch(), long_window());
    h.probe.steady_cpu("host-1", 85.0);

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 2))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Success);
    let high_cpu = outcome
        .anomalies
        .iter()
        .filter(|a| a.metric_name == "cpu_percent" && a.severity == Severity::High)
        .count();
    assert!(high_cpu >= 3, "expected one high cpu anomaly per tick, got {}", high_cpu);
    // Metrics of the last tick only
    let cpu_samples = outcome.metrics.iter().filter(|m| m.name == "cpu_percent").count();
    assert_eq!(cpu_samples, 2);

    let decision = outcome.decision.unwrap();
    assert!(!decision.should_rollback);
    assert_eq!(decision.anomalies.len(), 1);
    assert!(h.remote.targets_that_ran(&h.undo_command).is_empty());
}

#[tokio::test]
async fn test_growing_network_counters_keep_healthy_hosts_deployed() {
    let h = common::harness_with(2, service_patch(), long_window());
    h.probe.grow_counters("host-1", 1_000_000);
    h.probe.grow_counters("host-2", 1_000_000);

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 2))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Success);
    assert!(outcome
        .anomalies
        .iter()
        .all(|a| !a.metric_name.starts_with("network_bytes")));
    assert!(h.remote.targets_that_ran(&h.undo_command).is_empty());
}

#[tokio::test]
async fn test_sustained_memory_pressure_rolls_back() {
    let h = common::harness_with(3, service_patch(), long_window());
    for target in target_ids(3) {
        h.probe.memory_after_patch(&target, 84.0);
    }

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 3))
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::RolledBack);
    let decision = outcome.decision.unwrap();
    assert_eq!(decision.reason, RollbackReason::MultipleHighAnomalies);
    let leaks = decision
        .anomalies
        .iter()
        .filter(|a| a.anomaly_type == AnomalyType::MemoryLeak)
        .count();
    assert_eq!(leaks, 3);
    assert_eq!(h.remote.targets_that_ran(&h.undo_command).len(), 3);
}

#[tokio::test]
async fn test_health_checks_do_not_build_memory_history() {
    let h = common::harness_with(1, service_patch(), common::fast_options());
    h.probe.memory_after_patch("host-1", 84.0);

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 1))
        .await
        .unwrap();
    h.service.execute(&created.id).await.unwrap();

    for _ in 0..4 {
        let report = h.service.evaluate_health(&created.id).await.unwrap();
        assert!(report
            .anomalies
            .iter()
            .all(|a| a.anomaly_type != AnomalyType::MemoryLeak));
    }
}

#[tokio::test]
async fn test_cancel_interrupts_running_patch_command() {
    let h = Arc::new(harness(1, service_patch()));
    h.remote.stall_command("host-1", &h.patch_command);

    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 1))
        .await
        .unwrap();
    let runner = {
        let h = h.clone();
        let id = created.id.clone();
        tokio::spawn(async move { h.service.execute(&id).await })
    };

    for _ in 0..200 {
        if h.remote.ran("host-1", &h.patch_command) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.service.cancel(&created.id));

    let outcome = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("cancel should interrupt the stalled command")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, DeploymentStatus::Cancelled);
    // A half-run patch still gets reverted
    assert!(h.remote.ran("host-1", &h.undo_command));
}

#[tokio::test]
async fn test_dispatcher_runs_execute_then_rollback_jobs() {
    use remediator::workers::dispatcher::{self, Job, Options};
    use tokio::sync::{mpsc, oneshot};

    let h = harness(2, service_patch());
    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 2))
        .await
        .unwrap();

    let (job_tx, job_rx) = mpsc::channel(4);
    let (report_tx, mut report_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let service = h.service.clone();
    let worker = tokio::spawn(async move {
        dispatcher::run(
            &Options::default(),
            service,
            job_rx,
            report_tx,
            Box::pin(async move {
                let _ = stop_rx.await;
            }),
        )
        .await;
    });

    job_tx
        .send(Job::Execute {
            deployment_id: created.id.clone(),
        })
        .await
        .unwrap();
    let report = report_rx.recv().await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.status, Some(DeploymentStatus::Success));

    job_tx
        .send(Job::Rollback {
            deployment_id: created.id.clone(),
            reason: "operator request".to_string(),
        })
        .await
        .unwrap();
    let report = report_rx.recv().await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.status, Some(DeploymentStatus::RolledBack));
    assert_eq!(h.remote.targets_that_ran(&h.undo_command).len(), 2);

    let _ = stop_tx.send(());
    worker.await.unwrap();
}

#[tokio::test]
async fn test_dispatcher_shutdown_cancels_running_jobs() {
    use remediator::workers::dispatcher::{self, Job, Options};
    use tokio::sync::{mpsc, oneshot};

    let mut options = common::fast_options();
    options.monitor.window = Duration::from_secs(30);
    options.monitor.interval = Duration::from_millis(20);
    let h = common::harness_with(2, service_patch(), options);
    let created = h
        .service
        .start_deployment(request(Strategy::AllAtOnce, StrategyParams::default(), 2))
        .await
        .unwrap();

    let (job_tx, job_rx) = mpsc::channel(4);
    let (report_tx, mut report_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let service = h.service.clone();
    let worker = tokio::spawn(async move {
        dispatcher::run(
            &Options::default(),
            service,
            job_rx,
            report_tx,
            Box::pin(async move {
                let _ = stop_rx.await;
            }),
        )
        .await;
    });

    job_tx
        .send(Job::Execute {
            deployment_id: created.id.clone(),
        })
        .await
        .unwrap();
    for _ in 0..200 {
        if h.remote.targets_that_ran(&h.patch_command).len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let _ = stop_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("shutdown should not wait out the monitoring window")
        .unwrap();

    let report = report_rx.recv().await.unwrap();
    assert!(report.accepted);
    assert_eq!(report.status, Some(DeploymentStatus::Cancelled));
    assert_eq!(h.remote.targets_that_ran(&h.undo_command).len(), 2);
    assert!(!h.service.cancel(&created.id));
}
