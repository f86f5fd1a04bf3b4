//! Individual performance metrics
//!
//! Per-user aggregates over the test day's target-present trials, overall
//! and broken out per target identity. The result is persisted as its own
//! table and joined onto the baseline-day rows by user.

use crate::error::PipelineError;
use crate::outcome::TrialOutcome;
use crate::table::{sort_labels, Cell, Table};
use crate::types::{
    AVG_HIT_LOG_RT, AVG_HIT_RT, AVG_TARGET_PRESENT_ACCURACY, DAY, ILLEGAL1_NAME, ILLEGAL_ITEMS,
    LOG_RT, RT, TRIAL_RESULT, USER_ID,
};
use std::collections::HashMap;

/// Suffixes of the per-target pivot columns, in output order
pub const TARGET_METRICS: [&str; 3] = [
    "target_id_accuracy",
    "target_id_hit_RT",
    "target_id_hit_log_RT",
];

/// Mean of the present values; `None` when nothing is present
pub fn mean_of(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Median of the present values; `None` when nothing is present
pub fn median_of(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let mut present: Vec<f64> = values.into_iter().flatten().collect();
    if present.is_empty() {
        return None;
    }
    present.sort_by(f64::total_cmp);
    let mid = present.len() / 2;
    if present.len() % 2 == 0 {
        Some((present[mid - 1] + present[mid]) / 2.0)
    } else {
        Some(present[mid])
    }
}

/// Accuracy and mean response times of one set of trials
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub accuracy: Option<f64>,
    pub hit_rt: Option<f64>,
    pub hit_log_rt: Option<f64>,
}

impl Aggregate {
    fn values(&self) -> [Option<f64>; 3] {
        [self.accuracy, self.hit_rt, self.hit_log_rt]
    }
}

/// Column views the aggregates are computed from
struct TrialColumns {
    results: Vec<Option<String>>,
    rt: Vec<Option<f64>>,
    log_rt: Vec<Option<f64>>,
}

impl TrialColumns {
    fn read(table: &Table) -> Result<Self, PipelineError> {
        Ok(Self {
            results: table.labels(TRIAL_RESULT)?,
            rt: table.numbers(RT)?,
            log_rt: table.numbers(LOG_RT)?,
        })
    }

    /// Accuracy counts every row; a missing label is not a hit
    fn aggregate(&self, rows: &[usize]) -> Aggregate {
        let hits = rows
            .iter()
            .filter(|&&r| self.results[r].as_deref() == Some(TrialOutcome::Hit.as_str()))
            .count();
        let accuracy = if rows.is_empty() {
            None
        } else {
            Some(hits as f64 / rows.len() as f64)
        };
        Aggregate {
            accuracy,
            hit_rt: mean_of(rows.iter().map(|&r| self.rt[r])),
            hit_log_rt: mean_of(rows.iter().map(|&r| self.log_rt[r])),
        }
    }
}

/// Rows of one day with at least one target item
pub fn target_present_trials(table: &Table, day: i64) -> Result<Table, PipelineError> {
    let days = table.numbers(DAY)?;
    let targets = table.numbers(ILLEGAL_ITEMS)?;
    let rows: Vec<usize> = days
        .iter()
        .zip(&targets)
        .enumerate()
        .filter(|(_, (d, t))| **d == Some(day as f64) && t.is_some_and(|t| t > 0.0))
        .map(|(i, _)| i)
        .collect();
    Ok(table.take(&rows))
}

/// Per-user metrics table plus the users without any usable RT
#[derive(Debug, Clone)]
pub struct IndividualMetrics {
    pub table: Table,
    pub users_missing_rt: Vec<String>,
}

/// Aggregate target-present trials per user and per (user, target).
///
/// Users come out in sorted order. Per-target columns are named
/// `<target>-<metric>`, grouped by metric, targets sorted within each group;
/// a pivot column with no value for any user is left out.
pub fn individual_metrics(trials: &Table) -> Result<IndividualMetrics, PipelineError> {
    let columns = TrialColumns::read(trials)?;

    let mut overall: Vec<(String, Aggregate)> = trials
        .groups(&[USER_ID])?
        .into_iter()
        .map(|g| (g.key[0].clone(), columns.aggregate(&g.rows)))
        .collect();
    let mut users: Vec<String> = overall.iter().map(|(u, _)| u.clone()).collect();
    sort_labels(&mut users);
    let position: HashMap<String, usize> = users
        .iter()
        .enumerate()
        .map(|(i, u)| (u.clone(), i))
        .collect();
    overall.sort_by_key(|(u, _)| position.get(u).copied().unwrap_or(usize::MAX));

    let mut per_target: HashMap<(String, String), Aggregate> = HashMap::new();
    let mut targets: Vec<String> = Vec::new();
    for group in trials.groups(&[USER_ID, ILLEGAL1_NAME])? {
        let (user, target) = (group.key[0].clone(), group.key[1].clone());
        if !targets.contains(&target) {
            targets.push(target.clone());
        }
        per_target.insert((user, target), columns.aggregate(&group.rows));
    }
    targets.sort();

    let users_missing_rt: Vec<String> = overall
        .iter()
        .filter(|(_, a)| a.hit_rt.is_none())
        .map(|(u, _)| u.clone())
        .collect();

    let mut table = Table::default();
    table.set_column(USER_ID, users.iter().map(|u| Cell::parse(u)).collect())?;
    for (i, name) in [AVG_TARGET_PRESENT_ACCURACY, AVG_HIT_RT, AVG_HIT_LOG_RT]
        .iter()
        .enumerate()
    {
        table.set_numbers(name, overall.iter().map(|(_, a)| a.values()[i]).collect())?;
    }

    for (i, metric) in TARGET_METRICS.iter().enumerate() {
        for target in &targets {
            let values: Vec<Option<f64>> = users
                .iter()
                .map(|u| {
                    per_target
                        .get(&(u.clone(), target.clone()))
                        .and_then(|a| a.values()[i])
                })
                .collect();
            if values.iter().all(Option::is_none) {
                continue;
            }
            table.set_numbers(&format!("{target}-{metric}"), values)?;
        }
    }

    Ok(IndividualMetrics {
        table,
        users_missing_rt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn day2_trials() -> Table {
        Table::from_csv_reader(
            "UserId,Day,IllegalItems,Illegal1Name,TrialResult,RT,log_RT\n\
             20,2,1,KNIFE,Hit,400,5.99\n\
             20,2,1,GUN,Miss,600,6.40\n\
             20,2,1,KNIFE,Hit,800,6.68\n\
             3,2,1,GUN,Miss,,\n\
             3,2,0,,Correct Rejection,900,6.80\n\
             3,1,1,KNIFE,Hit,500,6.21\n"
                .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_mean_and_median() {
        assert_eq!(mean_of([Some(1.0), None, Some(3.0)]), Some(2.0));
        assert_eq!(mean_of([None, None]), None);
        assert_eq!(median_of([Some(3.0), Some(1.0), Some(2.0)]), Some(2.0));
        assert_eq!(median_of([Some(4.0), None, Some(1.0), Some(2.0), Some(3.0)]), Some(2.5));
        assert_eq!(median_of(Vec::<Option<f64>>::new()), None);
    }

    #[test]
    fn test_target_present_trials() {
        let trials = target_present_trials(&day2_trials(), 2).unwrap();
        assert_eq!(trials.n_rows(), 4);
    }

    #[test]
    fn test_individual_metrics() {
        let trials = target_present_trials(&day2_trials(), 2).unwrap();
        let metrics = individual_metrics(&trials).unwrap();
        let table = &metrics.table;

        assert_eq!(
            table.column_names(),
            &[
                "UserId",
                "avg_target_present_accuracy",
                "avg_hit_RT",
                "avg_hit_log_RT",
                "GUN-target_id_accuracy",
                "KNIFE-target_id_accuracy",
                "GUN-target_id_hit_RT",
                "KNIFE-target_id_hit_RT",
                "GUN-target_id_hit_log_RT",
                "KNIFE-target_id_hit_log_RT",
            ]
        );
        // numeric ids sort numerically
        assert_eq!(table.numbers("UserId").unwrap(), vec![Some(3.0), Some(20.0)]);
        assert_eq!(
            table.numbers("avg_target_present_accuracy").unwrap()[1],
            Some(2.0 / 3.0)
        );
        assert_eq!(table.numbers("avg_hit_RT").unwrap(), vec![None, Some(600.0)]);
        assert_eq!(
            table.numbers("KNIFE-target_id_hit_RT").unwrap(),
            vec![None, Some(600.0)]
        );
        assert_eq!(
            table.numbers("GUN-target_id_accuracy").unwrap(),
            vec![Some(0.0), Some(0.0)]
        );
        assert_eq!(metrics.users_missing_rt, vec!["3".to_string()]);
    }
}
