//! FSM unit tests

use remediator::deploy::fsm::{transition, DeploymentEvent, DeploymentFsm, DeploymentStatus};
use remediator::errors::RemediationError;
use remediator::models::deployment::{Deployment, Strategy, StrategyParams};

fn deploying() -> DeploymentFsm {
    let mut fsm = DeploymentFsm::new();
    fsm.process(&DeploymentEvent::BeginPreCheck).unwrap();
    fsm.process(&DeploymentEvent::PreCheckPassed).unwrap();
    fsm.process(&DeploymentEvent::StartDeploying).unwrap();
    fsm
}

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentStatus::Pending);
    assert!(fsm.error().is_none());
    assert!(!fsm.state().is_terminal());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = DeploymentFsm::new();

    // Pending -> PreCheckRunning
    fsm.process(&DeploymentEvent::BeginPreCheck).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::PreCheckRunning);

    // PreCheckRunning -> PreCheckPassed
    fsm.process(&DeploymentEvent::PreCheckPassed).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::PreCheckPassed);

    // PreCheckPassed -> Deploying
    fsm.process(&DeploymentEvent::StartDeploying).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Deploying);

    // Deploying -> Success
    fsm.process(&DeploymentEvent::Succeed).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Success);
    assert!(fsm.state().is_terminal());
}

#[test]
fn test_fsm_pre_check_failure_flow() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(&DeploymentEvent::BeginPreCheck).unwrap();
    fsm.process(&DeploymentEvent::PreCheckFailed("patch not approved".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::PreCheckFailed);
    assert_eq!(fsm.error(), Some("patch not approved"));

    // A failed pre-check can never start deploying
    assert!(fsm.process(&DeploymentEvent::StartDeploying).is_err());

    fsm.process(&DeploymentEvent::Fail("pre-check failed".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Failed);
}

#[test]
fn test_fsm_automatic_rollback_flow() {
    let mut fsm = deploying();
    fsm.process(&DeploymentEvent::RollbackStarted("critical_anomaly".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::RollingBack);

    fsm.process(&DeploymentEvent::RollbackCompleted).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::RolledBack);
}

#[test]
fn test_fsm_rollback_failure() {
    let mut fsm = deploying();
    fsm.process(&DeploymentEvent::RollbackStarted("manual".to_string()))
        .unwrap();
    fsm.process(&DeploymentEvent::RollbackFailed("undo exited 1".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Failed);
    assert_eq!(fsm.error(), Some("undo exited 1"));
}

#[test]
fn test_manual_rollback_after_completion() {
    for state in [DeploymentStatus::Success, DeploymentStatus::Failed] {
        let next = transition(state, &DeploymentEvent::RollbackStarted("manual".to_string()));
        assert_eq!(next, Ok(DeploymentStatus::RollingBack));
    }

    for state in [
        DeploymentStatus::Pending,
        DeploymentStatus::PreCheckPassed,
        DeploymentStatus::RolledBack,
        DeploymentStatus::Cancelled,
    ] {
        let event = DeploymentEvent::RollbackStarted("manual".to_string());
        assert!(transition(state, &event).is_err(), "{} accepted a rollback", state);
    }
}

#[test]
fn test_cancel_rules() {
    for state in [
        DeploymentStatus::Pending,
        DeploymentStatus::PreCheckRunning,
        DeploymentStatus::PreCheckPassed,
        DeploymentStatus::Deploying,
    ] {
        assert_eq!(
            transition(state, &DeploymentEvent::Cancel),
            Ok(DeploymentStatus::Cancelled)
        );
    }

    for state in [
        DeploymentStatus::RollingBack,
        DeploymentStatus::Success,
        DeploymentStatus::Failed,
        DeploymentStatus::RolledBack,
        DeploymentStatus::Cancelled,
    ] {
        assert!(transition(state, &DeploymentEvent::Cancel).is_err());
    }
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = DeploymentFsm::new();

    // Can't succeed from Pending
    let result = fsm.process(&DeploymentEvent::Succeed);
    assert!(result.is_err());
    assert_eq!(fsm.state(), DeploymentStatus::Pending);

    // Can't skip the pre-check
    assert!(fsm.process(&DeploymentEvent::StartDeploying).is_err());
}

#[test]
fn test_deployment_apply_stamps_timestamps() {
    let mut deployment = Deployment::new(
        "patch-1",
        vec!["host-1".to_string()],
        Strategy::AllAtOnce,
        StrategyParams::default(),
    );

    deployment.apply(&DeploymentEvent::BeginPreCheck).unwrap();
    deployment.apply(&DeploymentEvent::PreCheckPassed).unwrap();
    assert!(deployment.started_at.is_none());

    let previous = deployment.apply(&DeploymentEvent::StartDeploying).unwrap();
    assert_eq!(previous, DeploymentStatus::PreCheckPassed);
    assert!(deployment.started_at.is_some());

    deployment
        .apply(&DeploymentEvent::RollbackStarted("error_rate".to_string()))
        .unwrap();
    assert_eq!(deployment.rollback_reason.as_deref(), Some("error_rate"));
    assert!(deployment.rollback_started_at.is_some());
    assert!(deployment.completed_at.is_none());

    deployment.apply(&DeploymentEvent::RollbackCompleted).unwrap();
    assert!(deployment.rolled_back);
    assert!(deployment.rollback_completed_at.is_some());
    assert!(deployment.completed_at.is_some());
    assert_eq!(deployment.status, DeploymentStatus::RolledBack);
}

#[test]
fn test_deployment_apply_rejects_without_mutation() {
    let mut deployment = Deployment::new(
        "patch-1",
        vec!["host-1".to_string()],
        Strategy::AllAtOnce,
        StrategyParams::default(),
    );

    let err = deployment
        .apply(&DeploymentEvent::Fail("boom".to_string()))
        .unwrap_err();
    assert!(matches!(err, RemediationError::InvalidTransition(_)));
    assert_eq!(deployment.status, DeploymentStatus::Pending);
    assert!(deployment.error.is_none());
}

#[test]
fn test_deployment_apply_agrees_with_the_machine() {
    let mut deployment = Deployment::new(
        "patch-1",
        vec!["host-1".to_string()],
        Strategy::Rolling,
        StrategyParams::default(),
    );
    let mut fsm = DeploymentFsm::new();

    let events = [
        DeploymentEvent::BeginPreCheck,
        DeploymentEvent::PreCheckPassed,
        DeploymentEvent::StartDeploying,
        DeploymentEvent::Fail("batch 2/3 failure rate 50%".to_string()),
        DeploymentEvent::RollbackStarted("manual".to_string()),
        DeploymentEvent::RollbackFailed("undo exited 1".to_string()),
    ];
    for event in &events {
        deployment.apply(event).unwrap();
        fsm.process(event).unwrap();
        assert_eq!(deployment.status, fsm.state());
        assert_eq!(deployment.error.as_deref(), fsm.error());
    }

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(deployment.error.as_deref(), Some("undo exited 1"));
    assert!(deployment.rollback_completed_at.is_some());
}
