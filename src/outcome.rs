//! Trial outcome classification and response times
//!
//! Labels every trial with a signal-detection outcome, picks its response
//! time from the timestamp field that matches the outcome, and cleans the
//! response times.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::config::StudyConfig;
use crate::error::PipelineError;
use crate::report::DecisionLog;
use crate::table::{Cell, Table};
use crate::types::{
    FIRST_LEGAL_TAP_TIME, ILLEGAL1_MARK_TIME, ILLEGAL_ITEMS, ILLEGAL_ITEMS_MARKED,
    LEGAL_ITEMS_MARKED, LOG_RT, RT, TARGET_ABSENT, TARGET_PRESENT, TIME_IN_SCANNER, TRIAL_NUMBER,
    TRIAL_RESULT, UNIQUE_TAPS, USER_ID,
};

/// Signal-detection outcome of one trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialOutcome {
    Hit,
    Miss,
    #[serde(rename = "False Alarm")]
    FalseAlarm,
    #[serde(rename = "Correct Rejection")]
    CorrectRejection,
    Incorrect,
}

impl TrialOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialOutcome::Hit => "Hit",
            TrialOutcome::Miss => "Miss",
            TrialOutcome::FalseAlarm => "False Alarm",
            TrialOutcome::CorrectRejection => "Correct Rejection",
            TrialOutcome::Incorrect => "Incorrect",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "Hit" => Some(TrialOutcome::Hit),
            "Miss" => Some(TrialOutcome::Miss),
            "False Alarm" => Some(TrialOutcome::FalseAlarm),
            "Correct Rejection" => Some(TrialOutcome::CorrectRejection),
            "Incorrect" => Some(TrialOutcome::Incorrect),
            _ => None,
        }
    }

    /// Timestamp field holding this outcome's response time
    pub fn rt_source(&self) -> Option<&'static str> {
        match self {
            TrialOutcome::Hit => Some(ILLEGAL1_MARK_TIME),
            TrialOutcome::CorrectRejection => Some(TIME_IN_SCANNER),
            TrialOutcome::FalseAlarm => Some(FIRST_LEGAL_TAP_TIME),
            TrialOutcome::Miss => Some(TIME_IN_SCANNER),
            TrialOutcome::Incorrect => None,
        }
    }
}

impl fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item counts a trial is classified from
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarkCounts {
    pub illegal_items: Option<f64>,
    pub illegal_items_marked: Option<f64>,
    pub legal_items_marked: Option<f64>,
    pub unique_taps: Option<f64>,
}

/// Classify one trial. Comparisons against a missing count are false.
///
/// Hit, correct rejection and miss are evaluated first; a false alarm
/// (more distinct marks than targets) replaces whichever of them matched.
pub fn classify(counts: &MarkCounts) -> TrialOutcome {
    let targets = counts.illegal_items;
    let marked = counts.illegal_items_marked;

    let hit = matches!((targets, marked), (Some(t), Some(m)) if t > 0.0 && m == t);
    let correct_rejection = targets.map_or(true, |t| t == 0.0)
        && counts.legal_items_marked.map_or(true, |m| m == 0.0);
    let miss = matches!((targets, marked), (Some(t), Some(m)) if t > 0.0 && m < t);
    let false_alarm =
        matches!((counts.unique_taps, targets), (Some(taps), Some(t)) if taps > t);

    let mut outcome = TrialOutcome::Incorrect;
    if hit {
        outcome = TrialOutcome::Hit;
    }
    if correct_rejection {
        outcome = TrialOutcome::CorrectRejection;
    }
    if miss {
        outcome = TrialOutcome::Miss;
    }
    if false_alarm {
        outcome = TrialOutcome::FalseAlarm;
    }
    outcome
}

/// Add `target_present` / `target_absent` (0/1) from `IllegalItems`
pub fn categorize_target_condition(table: &mut Table) -> Result<(), PipelineError> {
    let items = table.numbers(ILLEGAL_ITEMS)?;
    let present = items
        .iter()
        .map(|i| Cell::Number(if i.is_some_and(|i| i > 0.0) { 1.0 } else { 0.0 }))
        .collect();
    let absent = items
        .iter()
        .map(|i| Cell::Number(if *i == Some(0.0) { 1.0 } else { 0.0 }))
        .collect();
    table.set_column(TARGET_PRESENT, present)?;
    table.set_column(TARGET_ABSENT, absent)?;
    Ok(())
}

/// Number each user's trials 1, 2, 3… in table order
pub fn assign_trial_numbers(table: &mut Table) -> Result<(), PipelineError> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let numbers = table
        .labels(USER_ID)?
        .into_iter()
        .map(|user| {
            user.map_or(Cell::Missing, |u| {
                let n = seen.entry(u).or_insert(0);
                *n += 1;
                Cell::Number(*n as f64)
            })
        })
        .collect();
    table.set_column(TRIAL_NUMBER, numbers)
}

/// Write the `TrialResult` column
pub fn label_outcomes(table: &mut Table) -> Result<Vec<TrialOutcome>, PipelineError> {
    let targets = table.numbers(ILLEGAL_ITEMS)?;
    let marked = table.numbers(ILLEGAL_ITEMS_MARKED)?;
    let legal_marked = table.numbers(LEGAL_ITEMS_MARKED)?;
    let taps = table.numbers(UNIQUE_TAPS)?;

    let outcomes: Vec<TrialOutcome> = (0..table.n_rows())
        .map(|row| {
            classify(&MarkCounts {
                illegal_items: targets[row],
                illegal_items_marked: marked[row],
                legal_items_marked: legal_marked[row],
                unique_taps: taps[row],
            })
        })
        .collect();

    table.set_column(
        TRIAL_RESULT,
        outcomes.iter().map(|o| Cell::text(o.as_str())).collect(),
    )?;
    Ok(outcomes)
}

/// Read back the outcome labels written by [`label_outcomes`]
pub fn read_outcomes(table: &Table) -> Result<Vec<Option<TrialOutcome>>, PipelineError> {
    Ok(table
        .labels(TRIAL_RESULT)?
        .iter()
        .map(|l| l.as_deref().and_then(TrialOutcome::parse))
        .collect())
}

/// Write the `RT` column from each row's outcome-specific timestamp field
pub fn select_response_times(table: &mut Table) -> Result<(), PipelineError> {
    let outcomes = read_outcomes(table)?;
    let sources = [ILLEGAL1_MARK_TIME, TIME_IN_SCANNER, FIRST_LEGAL_TAP_TIME];
    let mut fields: HashMap<&str, Vec<Option<f64>>> = HashMap::new();
    for source in sources {
        fields.insert(source, table.numbers(source)?);
    }

    let rt = outcomes
        .iter()
        .enumerate()
        .map(|(row, outcome)| {
            outcome
                .and_then(|o| o.rt_source())
                .and_then(|source| fields.get(source).and_then(|values| values[row]))
        })
        .collect();
    table.set_numbers(RT, rt)
}

/// Remove every row of any user who logged a sentinel RT. Returns the
/// number of removed users.
pub fn drop_sentinel_rt_users(
    table: &mut Table,
    config: &StudyConfig,
    log: &mut DecisionLog,
) -> Result<usize, PipelineError> {
    let rt = table.numbers(RT)?;
    let users = table.labels(USER_ID)?;

    let faulty: HashSet<&str> = users
        .iter()
        .zip(&rt)
        .filter(|(_, rt)| rt.is_some_and(|v| config.rt_sentinels.contains(&v)))
        .filter_map(|(user, _)| user.as_deref())
        .collect();

    let keep: Vec<bool> = users
        .iter()
        .map(|u| !u.as_deref().is_some_and(|u| faulty.contains(u)))
        .collect();
    table.retain(&keep);

    log.info(format!("Number of users with invalid RTs: {}", faulty.len()));
    Ok(faulty.len())
}

/// Null RT values outside `(rt_min_exclusive, rt_max_inclusive]`
pub fn null_out_of_range_rt(
    table: &mut Table,
    config: &StudyConfig,
) -> Result<usize, PipelineError> {
    let mut nulled = 0;
    let rt = table
        .numbers(RT)?
        .into_iter()
        .map(|v| match v {
            Some(v) if v <= config.rt_min_exclusive || v > config.rt_max_inclusive => {
                nulled += 1;
                None
            }
            other => other,
        })
        .collect();
    table.set_numbers(RT, rt)?;
    Ok(nulled)
}

/// Natural log of a response time; undefined for missing or non-positive RT
pub fn log_rt(rt: Option<f64>) -> Option<f64> {
    rt.filter(|v| *v > 0.0).map(f64::ln)
}

pub fn add_log_rt(table: &mut Table) -> Result<(), PipelineError> {
    let values = table.numbers(RT)?.into_iter().map(log_rt).collect();
    table.set_numbers(LOG_RT, values)
}

/// Dataset composition after outcome labelling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub missing_rt: usize,
    pub trials: usize,
    pub users: usize,
    pub hits: usize,
    pub correct_rejections: usize,
    pub accuracy: f64,
}

pub fn summarize(table: &Table) -> Result<OutcomeSummary, PipelineError> {
    let outcomes = read_outcomes(table)?;
    let missing_rt = table.numbers(RT)?.iter().filter(|v| v.is_none()).count();
    let hits = outcomes
        .iter()
        .filter(|o| **o == Some(TrialOutcome::Hit))
        .count();
    let correct_rejections = outcomes
        .iter()
        .filter(|o| **o == Some(TrialOutcome::CorrectRejection))
        .count();
    let trials = table.n_rows();
    let accuracy = if trials > 0 {
        (hits + correct_rejections) as f64 / trials as f64
    } else {
        0.0
    };

    Ok(OutcomeSummary {
        missing_rt,
        trials,
        users: table.user_count()?,
        hits,
        correct_rejections,
        accuracy,
    })
}
