//! Ingestion eligibility
//!
//! Drops replayed trials, then keeps only users whose per-day trial counts
//! match the protocol exactly.

use std::collections::{HashMap, HashSet};

use crate::config::StudyConfig;
use crate::error::PipelineError;
use crate::report::DecisionLog;
use crate::table::Table;
use crate::types::{DAY, REPLAY, USER_ID};

/// Per-user trial counts on the two protocol days
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayCounts {
    pub baseline: usize,
    pub test: usize,
}

/// Keep rows whose `Replay` is 0. Missing replay flags are dropped.
pub fn drop_replays(table: &mut Table) -> Result<usize, PipelineError> {
    let keep: Vec<bool> = table
        .numbers(REPLAY)?
        .iter()
        .map(|r| *r == Some(0.0))
        .collect();
    let before = table.n_rows();
    table.retain(&keep);
    Ok(before - table.n_rows())
}

/// Count each user's trials on the baseline and test days. Rows with a
/// missing or other day are not counted anywhere.
pub fn day_counts(
    table: &Table,
    config: &StudyConfig,
) -> Result<HashMap<String, DayCounts>, PipelineError> {
    let users = table.labels(USER_ID)?;
    let days = table.numbers(DAY)?;

    let mut counts: HashMap<String, DayCounts> = HashMap::new();
    for (user, day) in users.iter().zip(&days) {
        let (Some(user), Some(day)) = (user, day) else {
            continue;
        };
        let entry = counts.entry(user.clone()).or_default();
        if *day == config.baseline_day as f64 {
            entry.baseline += 1;
        } else if *day == config.test_day as f64 {
            entry.test += 1;
        }
    }
    Ok(counts)
}

pub fn has_expected_counts(counts: DayCounts, config: &StudyConfig) -> bool {
    counts.baseline == config.expected_day1_trials && counts.test == config.expected_day2_trials
}

/// Remove every row of users without the expected day-1 and day-2 trial
/// counts. Returns the number of removed users.
pub fn filter_by_trial_counts(
    table: &mut Table,
    config: &StudyConfig,
    log: &mut DecisionLog,
) -> Result<usize, PipelineError> {
    let counts = day_counts(table, config)?;
    let eligible: HashSet<&str> = counts
        .iter()
        .filter(|(_, c)| has_expected_counts(**c, config))
        .map(|(user, _)| user.as_str())
        .collect();

    let users_before = table.user_count()?;
    let keep: Vec<bool> = table
        .labels(USER_ID)?
        .iter()
        .map(|u| u.as_deref().is_some_and(|u| eligible.contains(u)))
        .collect();
    table.retain(&keep);

    let removed = users_before - table.user_count()?;
    log.info(format!(
        "Removed {} users without exactly {} trials on Day {} or {} trials on Day {}.",
        removed,
        config.expected_day1_trials,
        config.baseline_day,
        config.expected_day2_trials,
        config.test_day
    ));
    Ok(removed)
}
