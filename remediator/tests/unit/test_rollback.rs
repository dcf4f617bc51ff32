//! Rollback decision and execution tests

mod common;

use std::collections::BTreeMap;

use chrono::Utc;

use remediator::deploy::fsm::DeploymentStatus;
use remediator::models::anomaly::{Anomaly, AnomalyType, Severity};
use remediator::models::asset::Asset;
use remediator::models::deployment::{Strategy, StrategyParams};
use remediator::models::patch::Patch;
use remediator::models::rollback::{RollbackReason, RollbackStrategy};
use remediator::rollback::{
    DecisionConfig, DecisionPolicy, RollbackContext, RollbackExecutor, RollbackOptions,
};
use remediator::app::service::DeploymentRequest;
use remediator::storage::audit::AuditTrail;

use common::{harness, service_patch, target_ids, FakeRemote};

fn anomaly(metric: &str, severity: Severity, value: f64) -> Anomaly {
    Anomaly {
        anomaly_type: AnomalyType::Threshold,
        severity,
        metric_name: metric.to_string(),
        metric_value: value,
        threshold: 0.0,
        message: format!("{} = {}", metric, value),
        timestamp: Utc::now(),
        labels: BTreeMap::new(),
        confidence: 0.8,
    }
}

fn policy() -> DecisionPolicy {
    DecisionPolicy::new(DecisionConfig::default())
}

#[test]
fn test_decision_is_pure() {
    let anomalies = vec![
        anomaly("cpu_percent", Severity::High, 85.0),
        anomaly("disk_percent", Severity::Medium, 60.0),
    ];
    let first = policy().evaluate("dep-1", &anomalies);
    let second = policy().evaluate("dep-1", &anomalies);
    assert_eq!(first.should_rollback, second.should_rollback);
    assert_eq!(first.reason, second.reason);
    assert_eq!(first.confidence, second.confidence);
    assert!(!first.should_rollback);
}

#[test]
fn test_single_critical_triggers_rollback() {
    let decision = policy().evaluate("dep-1", &[anomaly("cpu_percent", Severity::Critical, 99.0)]);
    assert!(decision.should_rollback);
    assert_eq!(decision.reason, RollbackReason::CriticalAnomaly);
    assert_eq!(decision.confidence, 1.0);
}

#[test]
fn test_high_anomalies_need_the_threshold_count() {
    let two: Vec<Anomaly> = (0..2)
        .map(|_| anomaly("cpu_percent", Severity::High, 85.0))
        .collect();
    assert!(!policy().evaluate("dep-1", &two).should_rollback);

    let three: Vec<Anomaly> = (0..3)
        .map(|_| anomaly("cpu_percent", Severity::High, 85.0))
        .collect();
    let decision = policy().evaluate("dep-1", &three);
    assert!(decision.should_rollback);
    assert_eq!(decision.reason, RollbackReason::MultipleHighAnomalies);
}

#[test]
fn test_error_rate_rule() {
    let decision = policy().evaluate("dep-1", &[anomaly("error_rate", Severity::High, 12.0)]);
    assert!(decision.should_rollback);
    assert_eq!(decision.reason, RollbackReason::HighErrorRate);

    let decision = policy().evaluate("dep-1", &[anomaly("error_rate", Severity::Medium, 8.0)]);
    assert!(!decision.should_rollback);
}

#[test]
fn test_critical_takes_precedence() {
    let anomalies = vec![
        anomaly("error_rate", Severity::High, 40.0),
        anomaly("cpu_percent", Severity::Critical, 99.0),
    ];
    assert_eq!(
        policy().evaluate("dep-1", &anomalies).reason,
        RollbackReason::CriticalAnomaly
    );
}

#[test]
fn test_disabled_policy_never_rolls_back() {
    let config = DecisionConfig {
        auto_rollback_enabled: false,
        ..Default::default()
    };
    let decision = DecisionPolicy::new(config)
        .evaluate("dep-1", &[anomaly("cpu_percent", Severity::Critical, 99.0)]);
    assert!(!decision.should_rollback);
    assert_eq!(decision.reason, RollbackReason::None);
}

#[tokio::test]
async fn test_trigger_on_rolled_back_deployment_is_a_no_op() {
    let h = harness(2, service_patch());
    h.probe.spike_after_patch("host-1");
    let created = h
        .service
        .start_deployment(DeploymentRequest {
            patch_id: "patch-1".to_string(),
            target_ids: target_ids(2),
            strategy: Strategy::AllAtOnce,
            params: StrategyParams::default(),
            scheduled_at: None,
        })
        .await
        .unwrap();
    let outcome = h.service.execute(&created.id).await.unwrap();
    assert_eq!(outcome.status, DeploymentStatus::RolledBack);

    let state = h.service.state();
    let audit_before = h.audit.entries(&created.id).await.unwrap().len();
    let undo_before = h.remote.targets_that_ran(&h.undo_command).len();
    let record_before = state.records.get(&created.id).await.unwrap();

    let triggered = state
        .engine
        .trigger_rollback(&created.id, &[], true)
        .await
        .unwrap();
    assert!(!triggered);

    let record_after = state.records.get(&created.id).await.unwrap();
    assert_eq!(record_after.status, DeploymentStatus::RolledBack);
    assert_eq!(
        record_after.rollback_completed_at,
        record_before.rollback_completed_at
    );
    assert_eq!(h.audit.entries(&created.id).await.unwrap().len(), audit_before);
    assert_eq!(h.remote.targets_that_ran(&h.undo_command).len(), undo_before);
}

#[tokio::test]
async fn test_automatic_trigger_without_cause_is_ignored() {
    let h = harness(1, service_patch());
    let created = h
        .service
        .start_deployment(DeploymentRequest {
            patch_id: "patch-1".to_string(),
            target_ids: target_ids(1),
            strategy: Strategy::AllAtOnce,
            params: StrategyParams::default(),
            scheduled_at: None,
        })
        .await
        .unwrap();
    h.service.execute(&created.id).await.unwrap();

    let state = h.service.state();
    let triggered = state
        .engine
        .trigger_rollback(&created.id, &[anomaly("cpu_percent", Severity::Low, 30.0)], false)
        .await
        .unwrap();
    assert!(!triggered);
    let record = state.records.get(&created.id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Success);
}

#[tokio::test]
async fn test_derived_undo_with_unreversible_lines_fails() {
    let remote = FakeRemote::new();
    let executor = RollbackExecutor::new(remote.clone(), RollbackOptions::default());
    let mut patch = Patch::script("p1", "systemctl stop cron\nrm -rf /var/cache/app");
    patch.rollback_strategy = Some(RollbackStrategy::UndoScript);
    let asset = Asset::new("host-1", "10.0.0.1");

    let result = executor
        .rollback(
            &asset,
            &patch,
            RollbackContext {
                deployment_id: "dep-1",
                backup: None,
            },
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.flagged, vec!["rm -rf /var/cache/app"]);
    // The reversible part still ran
    assert_eq!(remote.commands_for("host-1").len(), 1);
}

#[tokio::test]
async fn test_package_reinstall_without_prior_version_is_flagged() {
    let remote = FakeRemote::new();
    let executor = RollbackExecutor::new(remote.clone(), RollbackOptions::default());
    let patch = Patch::script("p1", "apt-get install -y openssl");
    let asset = Asset::new("host-1", "10.0.0.1");

    let result = executor
        .rollback(
            &asset,
            &patch,
            RollbackContext {
                deployment_id: "dep-1",
                backup: None,
            },
        )
        .await;

    assert_eq!(result.strategy, RollbackStrategy::PackageDowngrade);
    assert!(result.success);
    assert_eq!(result.flagged.len(), 1);
    assert!(result.flagged[0].contains("openssl"));
}

#[tokio::test]
async fn test_file_restore_without_backup_fails() {
    let remote = FakeRemote::new();
    let executor = RollbackExecutor::new(remote, RollbackOptions::default());
    let patch = Patch::script("p1", "cp app.conf /etc/app/app.conf");
    let asset = Asset::new("host-1", "10.0.0.1");

    let result = executor
        .rollback(
            &asset,
            &patch,
            RollbackContext {
                deployment_id: "dep-1",
                backup: None,
            },
        )
        .await;

    assert_eq!(result.strategy, RollbackStrategy::FileRestore);
    assert!(!result.success);
}
