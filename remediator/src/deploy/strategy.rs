//! Phase planning per rollout strategy

use std::collections::HashSet;

use crate::errors::RemediationError;
use crate::models::deployment::{Strategy, StrategyParams};

/// Targets newly rolled out in one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    pub index: usize,
    pub label: String,
    /// Targets first touched in this phase
    pub targets: Vec<String>,
    /// Targets covered once this phase completes
    pub cumulative: usize,
    pub percentage: Option<u8>,
}

/// Targets covered by a canary percentage, rounded up
pub fn canary_count(percentage: u8, total: usize) -> usize {
    (usize::from(percentage) * total).div_ceil(100).min(total)
}

/// Canary percentages with the final 100% phase made explicit
pub fn canary_schedule(params: &StrategyParams) -> Vec<u8> {
    let mut schedule = params.canary_percentages.clone();
    if schedule.last() != Some(&100) {
        schedule.push(100);
    }
    schedule
}

/// Problems with the request that make it unplannable
pub fn validate_params(strategy: Strategy, params: &StrategyParams, targets: &[String]) -> Vec<String> {
    let mut errors = Vec::new();

    if targets.is_empty() {
        errors.push("no targets requested".to_string());
    }
    let mut seen = HashSet::new();
    for target in targets {
        if !seen.insert(target.as_str()) {
            errors.push(format!("target {} requested more than once", target));
        }
    }
    if !(0.0..=1.0).contains(&params.max_failure_rate) {
        errors.push(format!(
            "max_failure_rate {} must be within [0, 1]",
            params.max_failure_rate
        ));
    }
    if params.max_concurrency == Some(0) {
        errors.push("max_concurrency must be at least 1".to_string());
    }

    match strategy {
        Strategy::Rolling => {
            if params.batch_size == Some(0) {
                errors.push("batch_size must be at least 1".to_string());
            }
        }
        Strategy::Canary => {
            if let Some(p) = params.canary_percentages.iter().find(|p| **p > 100) {
                errors.push(format!("canary percentage {} is outside [0, 100]", p));
            }
            if params.canary_percentages.windows(2).any(|w| w[1] < w[0]) {
                errors.push("canary percentages must be non-decreasing".to_string());
            }
        }
        Strategy::BlueGreen => {
            let green: HashSet<&str> = targets.iter().map(String::as_str).collect();
            for blue in &params.blue_targets {
                if green.contains(blue.as_str()) {
                    errors.push(format!("target {} is in both blue and green sets", blue));
                }
            }
        }
        Strategy::AllAtOnce => {}
    }
    errors
}

/// Split `targets` into sequential phases; every target appears in exactly one
pub fn plan_phases(
    strategy: Strategy,
    params: &StrategyParams,
    targets: &[String],
) -> Result<Vec<PhasePlan>, RemediationError> {
    let errors = validate_params(strategy, params, targets);
    if !errors.is_empty() {
        return Err(RemediationError::ValidationError(errors.join("; ")));
    }

    let phases = match strategy {
        Strategy::AllAtOnce => vec![PhasePlan {
            index: 0,
            label: "all targets".to_string(),
            targets: targets.to_vec(),
            cumulative: targets.len(),
            percentage: None,
        }],
        Strategy::BlueGreen => vec![PhasePlan {
            index: 0,
            label: "green set".to_string(),
            targets: targets.to_vec(),
            cumulative: targets.len(),
            percentage: None,
        }],
        Strategy::Rolling => {
            let size = params.batch_size.unwrap_or(1);
            let batches = targets.len().div_ceil(size);
            targets
                .chunks(size)
                .enumerate()
                .map(|(index, chunk)| PhasePlan {
                    index,
                    label: format!("batch {}/{}", index + 1, batches),
                    targets: chunk.to_vec(),
                    cumulative: (index * size + chunk.len()).min(targets.len()),
                    percentage: None,
                })
                .collect()
        }
        Strategy::Canary => {
            let mut covered = 0;
            canary_schedule(params)
                .into_iter()
                .enumerate()
                .map(|(index, percentage)| {
                    let until = canary_count(percentage, targets.len()).max(covered);
                    let phase = PhasePlan {
                        index,
                        label: format!("canary {}%", percentage),
                        targets: targets[covered..until].to_vec(),
                        cumulative: until,
                        percentage: Some(percentage),
                    };
                    covered = until;
                    phase
                })
                .collect()
        }
    };
    Ok(phases)
}
