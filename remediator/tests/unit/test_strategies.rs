//! Phase planning tests

use std::collections::HashMap;

use tokio_test::{assert_err, assert_ok};

use remediator::deploy::strategy::{canary_count, plan_phases, PhasePlan};
use remediator::errors::RemediationError;
use remediator::models::deployment::{Strategy, StrategyParams};

fn targets(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("t{}", i)).collect()
}

fn assert_exactly_once(phases: &[PhasePlan], expected: &[String]) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for phase in phases {
        for target in &phase.targets {
            *seen.entry(target.as_str()).or_default() += 1;
        }
    }
    assert_eq!(seen.len(), expected.len());
    assert!(seen.values().all(|count| *count == 1));

    // Order is preserved across phases
    let flattened: Vec<&String> = phases.iter().flat_map(|p| p.targets.iter()).collect();
    assert_eq!(flattened, expected.iter().collect::<Vec<_>>());
}

#[test]
fn test_every_strategy_covers_targets_exactly_once() {
    let all = targets(7);
    let cases = [
        (Strategy::AllAtOnce, StrategyParams::default()),
        (Strategy::BlueGreen, StrategyParams::default()),
        (
            Strategy::Rolling,
            StrategyParams {
                batch_size: Some(3),
                ..Default::default()
            },
        ),
        (
            Strategy::Canary,
            StrategyParams {
                canary_percentages: vec![10, 30, 60],
                ..Default::default()
            },
        ),
    ];

    for (strategy, params) in cases {
        let phases = assert_ok!(plan_phases(strategy, &params, &all));
        assert_exactly_once(&phases, &all);
        assert_eq!(phases.last().map(|p| p.cumulative), Some(all.len()));
    }
}

#[test]
fn test_rolling_batches() {
    let params = StrategyParams {
        batch_size: Some(2),
        ..Default::default()
    };
    let phases = plan_phases(Strategy::Rolling, &params, &targets(5)).unwrap();
    let sizes: Vec<usize> = phases.iter().map(|p| p.targets.len()).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(phases[2].label, "batch 3/3");
}

#[test]
fn test_canary_counts_for_ten_targets() {
    let params = StrategyParams {
        canary_percentages: vec![20, 50, 100],
        ..Default::default()
    };
    let phases = plan_phases(Strategy::Canary, &params, &targets(10)).unwrap();

    let cumulative: Vec<usize> = phases.iter().map(|p| p.cumulative).collect();
    assert_eq!(cumulative, vec![2, 5, 10]);
    let percentages: Vec<Option<u8>> = phases.iter().map(|p| p.percentage).collect();
    assert_eq!(percentages, vec![Some(20), Some(50), Some(100)]);
}

#[test]
fn test_canary_appends_full_rollout() {
    let params = StrategyParams {
        canary_percentages: vec![10, 50],
        ..Default::default()
    };
    let phases = plan_phases(Strategy::Canary, &params, &targets(10)).unwrap();
    assert_eq!(phases.len(), 3);
    assert_eq!(phases[2].percentage, Some(100));
    assert_eq!(phases[2].targets.len(), 5);
}

#[test]
fn test_canary_counts_round_up_and_never_shrink() {
    assert_eq!(canary_count(10, 3), 1);
    assert_eq!(canary_count(34, 3), 2);
    assert_eq!(canary_count(100, 3), 3);
    assert_eq!(canary_count(0, 3), 0);

    let params = StrategyParams {
        canary_percentages: vec![5, 5, 40],
        ..Default::default()
    };
    let phases = plan_phases(Strategy::Canary, &params, &targets(9)).unwrap();
    assert!(phases.windows(2).all(|w| w[0].cumulative <= w[1].cumulative));
    assert!(phases[1].targets.is_empty());
}

#[test]
fn test_invalid_parameters_are_rejected() {
    let cases = [
        (
            Strategy::Rolling,
            StrategyParams {
                batch_size: Some(0),
                ..Default::default()
            },
            targets(3),
        ),
        (
            Strategy::Canary,
            StrategyParams {
                canary_percentages: vec![50, 20],
                ..Default::default()
            },
            targets(3),
        ),
        (
            Strategy::Canary,
            StrategyParams {
                canary_percentages: vec![150],
                ..Default::default()
            },
            targets(3),
        ),
        (
            Strategy::AllAtOnce,
            StrategyParams {
                max_failure_rate: 1.5,
                ..Default::default()
            },
            targets(3),
        ),
        (
            Strategy::BlueGreen,
            StrategyParams {
                blue_targets: vec!["t1".to_string()],
                ..Default::default()
            },
            targets(3),
        ),
        (Strategy::AllAtOnce, StrategyParams::default(), Vec::new()),
        (
            Strategy::AllAtOnce,
            StrategyParams::default(),
            vec!["t1".to_string(), "t1".to_string()],
        ),
    ];

    for (strategy, params, requested) in cases {
        let err = assert_err!(plan_phases(strategy, &params, &requested));
        assert!(matches!(err, RemediationError::ValidationError(_)));
    }
}
