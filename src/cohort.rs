//! Cohort and feature filter
//!
//! Narrows the recency table to the analysis cohort. Each step is
//! irreversible and logs the row and user counts it leaves behind:
//!
//! 1. Analysis days only
//! 2. Users whose device upgrades all fall inside the allowed mask
//! 3. Test-day individual metrics, joined onto baseline-day rows
//! 4. Single-target trials in the common bag types, restricted to frequent
//!    targets seen in every bag type, with a minimum set size
//! 5. Derived features and target difficulty
//! 6. Hits with every modelled column present

use std::collections::{HashMap, HashSet};

use crate::config::StudyConfig;
use crate::error::PipelineError;
use crate::features::FeatureDeriver;
use crate::metrics::{individual_metrics, target_present_trials};
use crate::outcome::TrialOutcome;
use crate::report::DecisionLog;
use crate::table::{format_number, Cell, Table};
use crate::types::{
    cumulative_prob_column, trials_since_column, ACTIVE_UPGRADES_ID, AVG_HIT_RT,
    AVG_HIT_RT_CATEGORY, BAG_TYPE_ID, DAY, DIFFICULTY_CATEGORY, DIFFICULTY_SCORE, ILLEGAL1_NAME,
    ILLEGAL_ITEMS, LEGAL_ITEMS, PLANE, PREVIOUS_TARGET_COND_MATCH, PREVIOUS_TARGET_ID_MATCH, RT,
    SET_SIZE_CATEGORY, TARGET_PRESENT, TRIAL_NUMBER, TRIAL_RESULT, USER_ID,
};

/// Columns every model-ready row must have
pub fn required_columns() -> Vec<String> {
    let mut columns: Vec<String> = [
        AVG_HIT_RT_CATEGORY,
        PREVIOUS_TARGET_ID_MATCH,
        PREVIOUS_TARGET_COND_MATCH,
        SET_SIZE_CATEGORY,
        DIFFICULTY_CATEGORY,
        PLANE,
        USER_ID,
        RT,
        TRIAL_NUMBER,
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    columns.push(trials_since_column(ILLEGAL1_NAME));
    columns.push(trials_since_column(TARGET_PRESENT));
    columns.push(LEGAL_ITEMS.to_string());
    columns.push(ILLEGAL1_NAME.to_string());
    columns.push(AVG_HIT_RT.to_string());
    columns.push(cumulative_prob_column(ILLEGAL1_NAME));
    columns.push(cumulative_prob_column(TARGET_PRESENT));
    columns
}

/// Tables produced by the cohort stage
#[derive(Debug, Clone)]
pub struct CohortOutput {
    /// Per-user test-day metrics
    pub metrics: Table,
    /// Feature table before the hit filter and NA removal
    pub features: Table,
    /// Hits with every required column present
    pub model_input: Table,
}

/// True when every set bit of `value` is also set in `allowed`
pub fn is_allowed_upgrade(value: i64, allowed: i64) -> bool {
    value & !allowed == 0
}

fn upgrade_allowed(value: Option<f64>, allowed: i64) -> bool {
    match value {
        Some(v) if v.fract() == 0.0 => is_allowed_upgrade(v as i64, allowed),
        _ => false,
    }
}

/// Keep rows whose numeric column matches the predicate
fn retain_where(
    table: &mut Table,
    column: &str,
    keep: impl Fn(Option<f64>) -> bool,
) -> Result<(), PipelineError> {
    let mask: Vec<bool> = table.numbers(column)?.into_iter().map(keep).collect();
    table.retain(&mask);
    Ok(())
}

/// Keep rows whose `Day` is one of the analysis days
pub fn retain_days(table: &mut Table, days: &[i64]) -> Result<(), PipelineError> {
    retain_where(table, DAY, |d| {
        d.is_some_and(|d| days.iter().any(|day| *day as f64 == d))
    })
}

/// Drop every row of a user with any trial outside the allowed upgrades.
/// Returns the number of removed users.
pub fn filter_allowed_upgrades(table: &mut Table, allowed: i64) -> Result<usize, PipelineError> {
    let users = table.labels(USER_ID)?;
    let upgrades = table.numbers(ACTIVE_UPGRADES_ID)?;
    let disallowed: HashSet<&str> = users
        .iter()
        .zip(&upgrades)
        .filter(|(_, u)| !upgrade_allowed(**u, allowed))
        .filter_map(|(user, _)| user.as_deref())
        .collect();

    let keep: Vec<bool> = users
        .iter()
        .map(|u| u.as_deref().is_some_and(|u| !disallowed.contains(u)))
        .collect();
    table.retain(&keep);
    Ok(disallowed.len())
}

/// Targets among the most frequent that also appear in every common bag
/// type. Frequency ties keep first-appearance order. The result is sorted.
pub fn select_targets(table: &Table, config: &StudyConfig) -> Result<Vec<String>, PipelineError> {
    let names = table.labels(ILLEGAL1_NAME)?;
    let bag_types = table.numbers(BAG_TYPE_ID)?;

    let mut frequency: Vec<(String, usize)> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    for name in names.iter().flatten() {
        match position.get(name) {
            Some(&i) => frequency[i].1 += 1,
            None => {
                position.insert(name.clone(), frequency.len());
                frequency.push((name.clone(), 1));
            }
        }
    }
    // stable sort keeps first appearance among equal counts
    frequency.sort_by(|a, b| b.1.cmp(&a.1));
    let top: HashSet<&str> = frequency
        .iter()
        .take(config.top_target_count)
        .map(|(n, _)| n.as_str())
        .collect();

    let mut common: Option<HashSet<&str>> = None;
    for bag in &config.common_bag_types {
        let seen: HashSet<&str> = names
            .iter()
            .zip(&bag_types)
            .filter(|(_, b)| **b == Some(*bag as f64))
            .filter_map(|(n, _)| n.as_deref())
            .collect();
        common = Some(match common {
            Some(c) => c.intersection(&seen).copied().collect(),
            None => seen,
        });
    }

    let mut selected: Vec<String> = top
        .intersection(&common.unwrap_or_default())
        .map(|s| s.to_string())
        .collect();
    selected.sort();
    Ok(selected)
}

/// Project the difficulty table onto its join columns, keeping the first row
/// of each target. Returns the projection and the duplicated targets.
pub fn difficulty_lookup(difficulty: &Table) -> Result<(Table, Vec<String>), PipelineError> {
    difficulty.require(&[ILLEGAL1_NAME, DIFFICULTY_SCORE, DIFFICULTY_CATEGORY])?;
    let names = difficulty.labels(ILLEGAL1_NAME)?;

    let mut seen: HashSet<&str> = HashSet::new();
    let mut duplicates: Vec<String> = Vec::new();
    let mut rows: Vec<usize> = Vec::new();
    for (row, name) in names.iter().enumerate() {
        let Some(name) = name.as_deref() else { continue };
        if seen.insert(name) {
            rows.push(row);
        } else if !duplicates.iter().any(|d| d == name) {
            duplicates.push(name.to_string());
        }
    }

    let projection = Table::from_columns(
        [ILLEGAL1_NAME, DIFFICULTY_SCORE, DIFFICULTY_CATEGORY]
            .iter()
            .map(|c| {
                let cells = difficulty.column(c)?;
                Ok((c.to_string(), rows.iter().map(|&r| cells[r].clone()).collect()))
            })
            .collect::<Result<Vec<(String, Vec<Cell>)>, PipelineError>>()?,
    )?;
    Ok((projection, duplicates))
}

/// Count missing cells per required column
pub fn missing_counts(
    table: &Table,
    columns: &[String],
) -> Result<Vec<(String, usize)>, PipelineError> {
    columns
        .iter()
        .map(|c| {
            let missing = table.column(c)?.iter().filter(|cell| cell.is_missing()).count();
            Ok((c.clone(), missing))
        })
        .collect()
}

/// Drop rows missing any of the given columns
pub fn drop_incomplete(table: &mut Table, columns: &[String]) -> Result<(), PipelineError> {
    let mut keep = vec![true; table.n_rows()];
    for column in columns {
        for (k, cell) in keep.iter_mut().zip(table.column(column)?) {
            *k &= !cell.is_missing();
        }
    }
    table.retain(&keep);
    Ok(())
}

/// Run the full filter chain
pub fn build_cohort(
    mut table: Table,
    difficulty: &Table,
    config: &StudyConfig,
    log: &mut DecisionLog,
) -> Result<CohortOutput, PipelineError> {
    log.counts("Initial data loaded", table.counts()?);

    let before = table.counts()?;
    retain_days(&mut table, &config.analysis_days)?;
    let days: Vec<String> = config.analysis_days.iter().map(|d| d.to_string()).collect();
    log.delta(&format!("Days {}", days.join(" and ")), before, table.counts()?);

    let before = table.counts()?;
    let removed = filter_allowed_upgrades(&mut table, config.allowed_upgrades_mask)?;
    log.info(format!("Removed {removed} users due to disallowed upgrades."));
    log.delta("Allowed upgrades", before, table.counts()?);

    let metrics = individual_metrics(&target_present_trials(&table, config.metrics_day)?)?;
    log.info(format!(
        "Found {} users with NaN {}.",
        metrics.users_missing_rt.len(),
        AVG_HIT_RT
    ));
    if !metrics.users_missing_rt.is_empty() {
        tracing::debug!(users = ?metrics.users_missing_rt, "users without hit RT");
    }

    let before = table.counts()?;
    retain_where(&mut table, DAY, |d| d == Some(config.feature_day as f64))?;
    let mut table = table.left_join(&metrics.table, USER_ID)?;
    log.delta(
        &format!("Day {} rows with individual metrics", config.feature_day),
        before,
        table.counts()?,
    );

    let before = table.counts()?;
    retain_where(&mut table, ILLEGAL_ITEMS, |n| n == Some(1.0))?;
    log.delta("Single-target trials", before, table.counts()?);

    let before = table.counts()?;
    retain_where(&mut table, BAG_TYPE_ID, |t| {
        t.is_some_and(|t| config.common_bag_types.iter().any(|b| *b as f64 == t))
    })?;
    log.delta("Common bag types", before, table.counts()?);

    let targets = select_targets(&table, config)?;
    log.info(format!(
        "Identified {} common targets across all bag types: {}.",
        targets.len(),
        targets.join(", ")
    ));
    let before = table.counts()?;
    let keep: Vec<bool> = table
        .labels(ILLEGAL1_NAME)?
        .iter()
        .map(|n| n.as_ref().is_some_and(|n| targets.contains(n)))
        .collect();
    table.retain(&keep);
    log.delta("Common targets", before, table.counts()?);

    let before = table.counts()?;
    let min_size = config.min_set_size_exclusive;
    retain_where(&mut table, LEGAL_ITEMS, |n| n.is_some_and(|n| n > min_size))?;
    log.delta(
        &format!("Set size above {}", format_number(min_size)),
        before,
        table.counts()?,
    );

    if let Some(median) = FeatureDeriver::derive(&mut table, config)? {
        log.info(format!("Median {AVG_HIT_RT} for the split: {median}."));
    }

    let (lookup, duplicates) = difficulty_lookup(difficulty)?;
    if !duplicates.is_empty() {
        log.warn(format!(
            "Difficulty table lists {} targets more than once; first row kept: {}.",
            duplicates.len(),
            duplicates.join(", ")
        ));
    }
    let features = table.left_join(&lookup, ILLEGAL1_NAME)?;

    let mut model_input = features.clone();
    let before = model_input.counts()?;
    let hit = TrialOutcome::Hit.as_str();
    let keep: Vec<bool> = model_input
        .labels(TRIAL_RESULT)?
        .iter()
        .map(|r| r.as_deref() == Some(hit))
        .collect();
    model_input.retain(&keep);
    log.delta("Hit trials", before, model_input.counts()?);

    let required = required_columns();
    log.info("Missing values before final clean-up:");
    for (column, missing) in missing_counts(&model_input, &required)? {
        log.info(format!("{column}: {missing}"));
    }
    let before = model_input.counts()?;
    drop_incomplete(&mut model_input, &required)?;
    log.delta("Complete rows", before, model_input.counts()?);
    log.counts("Final dataset", model_input.counts()?);

    Ok(CohortOutput {
        metrics: metrics.table,
        features,
        model_input,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_allowed_upgrade_predicate() {
        let allowed = 8 | 16 | 2048;
        assert!(is_allowed_upgrade(0, allowed));
        assert!(is_allowed_upgrade(8 | 2048, allowed));
        assert!(!is_allowed_upgrade(8 | 4, allowed));
        assert!(!upgrade_allowed(None, allowed));
        assert!(!upgrade_allowed(Some(8.5), allowed));
    }

    #[test]
    fn test_upgrade_filter_drops_whole_user() {
        let mut table = Table::from_csv_reader(
            "UserId,ActiveUpgradesId\na,8\na,4\nb,2064\nc,\n".as_bytes(),
        )
        .unwrap();
        let removed = filter_allowed_upgrades(&mut table, 8 | 16 | 2048).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(table.labels("UserId").unwrap(), vec![Some("b".to_string())]);
    }

    fn target_rows(name: &str, bag: i64, n: usize) -> String {
        format!("{name},{bag}\n").repeat(n)
    }

    #[test]
    fn test_frequent_target_missing_from_one_bag_excluded() {
        let mut csv = String::from("Illegal1Name,TypeId\n");
        for bag in 1..=4 {
            csv.push_str(&target_rows("KNIFE", bag, 3));
            csv.push_str(&target_rows("GUN", bag, 1));
        }
        // most frequent overall, never in bag 4
        for bag in 1..=3 {
            csv.push_str(&target_rows("LIGHTER", bag, 10));
        }
        let table = Table::from_csv_reader(csv.as_bytes()).unwrap();

        let targets = select_targets(&table, &StudyConfig::default()).unwrap();
        assert_eq!(targets, vec!["GUN".to_string(), "KNIFE".to_string()]);
    }

    #[test]
    fn test_top_count_applies_before_intersection() {
        let mut csv = String::from("Illegal1Name,TypeId\n");
        for bag in 1..=4 {
            csv.push_str(&target_rows("KNIFE", bag, 3));
            csv.push_str(&target_rows("GUN", bag, 2));
            csv.push_str(&target_rows("BAT", bag, 1));
        }
        let table = Table::from_csv_reader(csv.as_bytes()).unwrap();
        let config = StudyConfig {
            top_target_count: 2,
            ..StudyConfig::default()
        };
        assert_eq!(
            select_targets(&table, &config).unwrap(),
            vec!["GUN".to_string(), "KNIFE".to_string()]
        );
    }

    #[test]
    fn test_difficulty_lookup_first_row_wins() {
        let difficulty = Table::from_csv_reader(
            "Illegal1Name,Difficulty_Score,Difficulty_Category,Extra\n\
             KNIFE,0.2,easy,x\n\
             GUN,0.8,hard,y\n\
             KNIFE,0.9,hard,z\n"
                .as_bytes(),
        )
        .unwrap();
        let (lookup, duplicates) = difficulty_lookup(&difficulty).unwrap();
        assert_eq!(duplicates, vec!["KNIFE".to_string()]);
        assert_eq!(lookup.n_rows(), 2);
        assert!(!lookup.has_column("Extra"));
        assert_eq!(
            lookup.numbers("Difficulty_Score").unwrap(),
            vec![Some(0.2), Some(0.8)]
        );
    }

    #[test]
    fn test_drop_incomplete() {
        let mut table =
            Table::from_csv_reader("UserId,RT,Other\na,500,\nb,,1\nc,600,2\n".as_bytes()).unwrap();
        let columns = vec!["UserId".to_string(), "RT".to_string()];
        assert_eq!(
            missing_counts(&table, &columns).unwrap(),
            vec![("UserId".to_string(), 0), ("RT".to_string(), 1)]
        );
        drop_incomplete(&mut table, &columns).unwrap();
        assert_eq!(table.n_rows(), 2);
    }

    #[test]
    fn test_required_columns() {
        let required = required_columns();
        assert_eq!(required.len(), 16);
        assert!(required.contains(&"TrialsSinceLast_target_present_ByDay".to_string()));
        assert!(required.contains(&"Cumulative_Illegal1Name_ByDay_Prob".to_string()));
    }
}
