//! Feature derivation
//!
//! Derives the analysis features of the cohort stage from the columns built
//! by earlier stages:
//! - Cumulative exposure probabilities
//! - Median split of the individual hit RT
//! - Immediate-repeat indicators
//! - Set-size and block splits

use crate::config::StudyConfig;
use crate::error::PipelineError;
use crate::metrics::median_of;
use crate::table::{Cell, Table};
use crate::types::{
    cumulative_column, cumulative_prob_column, trials_since_column, AVG_HIT_RT,
    AVG_HIT_RT_CATEGORY, ILLEGAL1_NAME, LEGAL_ITEMS, PLANE, PREVIOUS_TARGET_COND_MATCH,
    PREVIOUS_TARGET_ID_MATCH, SET_SIZE_CATEGORY, TARGET_PRESENT, TRIAL_NUMBER,
};

/// Events whose cumulative counts are turned into probabilities
pub const PROBABILITY_EVENTS: [&str; 2] = [ILLEGAL1_NAME, TARGET_PRESENT];

pub const HIGH: &str = "high";
pub const LOW: &str = "low";

/// Feature deriver for the cohort table
pub struct FeatureDeriver;

impl FeatureDeriver {
    /// Append every derived feature column. Returns the median used for the
    /// hit-RT split, if there was one.
    pub fn derive(table: &mut Table, config: &StudyConfig) -> Result<Option<f64>, PipelineError> {
        let trial_numbers = table.numbers(TRIAL_NUMBER)?;
        for event in PROBABILITY_EVENTS {
            let cumulative = table.numbers(&cumulative_column(event))?;
            table.set_numbers(
                &cumulative_prob_column(event),
                compute_exposure_probability(&cumulative, &trial_numbers),
            )?;
        }

        let avg_hit_rt = table.numbers(AVG_HIT_RT)?;
        let median = median_of(avg_hit_rt.iter().copied());
        table.set_column(AVG_HIT_RT_CATEGORY, compute_median_split(&avg_hit_rt, median))?;

        for (event, target) in [
            (ILLEGAL1_NAME, PREVIOUS_TARGET_ID_MATCH),
            (TARGET_PRESENT, PREVIOUS_TARGET_COND_MATCH),
        ] {
            let since = table.numbers(&trials_since_column(event))?;
            table.set_numbers(target, compute_immediate_repeat(&since))?;
        }

        let legal_items = table.numbers(LEGAL_ITEMS)?;
        table.set_column(
            SET_SIZE_CATEGORY,
            compute_set_size_category(&legal_items, config.set_size_high_threshold),
        )?;
        table.set_numbers(
            PLANE,
            compute_plane(&trial_numbers, config.block_split_trial),
        )?;

        Ok(median)
    }
}

/// Share of trials so far in which the event was seen
fn compute_exposure_probability(
    cumulative: &[Option<f64>],
    trial_numbers: &[Option<f64>],
) -> Vec<Option<f64>> {
    cumulative
        .iter()
        .zip(trial_numbers)
        .map(|(c, n)| match (c, n) {
            (Some(c), Some(n)) if *n > 0.0 => Some(c / n),
            _ => None,
        })
        .collect()
}

/// `high` strictly above the median, `low` otherwise (missing included)
fn compute_median_split(values: &[Option<f64>], median: Option<f64>) -> Vec<Cell> {
    values
        .iter()
        .map(|v| match (v, median) {
            (Some(v), Some(m)) if *v > m => Cell::text(HIGH),
            _ => Cell::text(LOW),
        })
        .collect()
}

/// 1 when the event also occurred on the immediately preceding trial
fn compute_immediate_repeat(trials_since: &[Option<f64>]) -> Vec<Option<f64>> {
    trials_since
        .iter()
        .map(|s| Some(if *s == Some(1.0) { 1.0 } else { 0.0 }))
        .collect()
}

fn compute_set_size_category(legal_items: &[Option<f64>], threshold: f64) -> Vec<Cell> {
    legal_items
        .iter()
        .map(|n| {
            if n.is_some_and(|n| n > threshold) {
                Cell::text(HIGH)
            } else {
                Cell::text(LOW)
            }
        })
        .collect()
}

/// Block 2 after the split trial, block 1 otherwise
fn compute_plane(trial_numbers: &[Option<f64>], split: f64) -> Vec<Option<f64>> {
    trial_numbers
        .iter()
        .map(|n| Some(if n.is_some_and(|n| n > split) { 2.0 } else { 1.0 }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_test_table() -> Table {
        Table::from_csv_reader(
            "UserId,TrialNumber,LegalItems,avg_hit_RT,\
             Cumulative_Illegal1Name_ByDay,Cumulative_target_present_ByDay,\
             TrialsSinceLast_Illegal1Name_ByDay,TrialsSinceLast_target_present_ByDay\n\
             a,1,5,700,1,1,,\n\
             a,4,8,700,2,4,3,1\n\
             b,13,12,900,1,10,,2\n\
             c,20,7,,3,15,1,1\n"
                .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_exposure_probability() {
        let probs = compute_exposure_probability(
            &[Some(2.0), Some(1.0), None],
            &[Some(4.0), Some(0.0), Some(3.0)],
        );
        assert_eq!(probs, vec![Some(0.5), None, None]);
    }

    #[test]
    fn test_median_split() {
        let values = [Some(700.0), Some(700.0), Some(900.0), None];
        let median = median_of(values.iter().copied());
        assert_eq!(median, Some(700.0));
        assert_eq!(
            compute_median_split(&values, median),
            vec![Cell::text(LOW), Cell::text(LOW), Cell::text(HIGH), Cell::text(LOW)]
        );
    }

    #[test]
    fn test_immediate_repeat() {
        assert_eq!(
            compute_immediate_repeat(&[None, Some(1.0), Some(2.0)]),
            vec![Some(0.0), Some(1.0), Some(0.0)]
        );
    }

    #[test]
    fn test_derive_all_features() {
        let mut table = make_test_table();
        let median = FeatureDeriver::derive(&mut table, &StudyConfig::default()).unwrap();
        assert_eq!(median, Some(700.0));

        assert_eq!(
            table.numbers("Cumulative_target_present_ByDay_Prob").unwrap(),
            vec![Some(1.0), Some(1.0), Some(10.0 / 13.0), Some(0.75)]
        );
        assert_eq!(
            table.labels("avg_hit_RT_Category").unwrap(),
            vec![
                Some("low".to_string()),
                Some("low".to_string()),
                Some("high".to_string()),
                Some("low".to_string())
            ]
        );
        assert_eq!(
            table.numbers("PreviousTargetIdMatch").unwrap(),
            vec![Some(0.0), Some(0.0), Some(0.0), Some(1.0)]
        );
        assert_eq!(
            table.numbers("PreviousTargetCondMatch").unwrap(),
            vec![Some(0.0), Some(1.0), Some(0.0), Some(1.0)]
        );
        assert_eq!(
            table.labels("SetSize_Category").unwrap(),
            vec![
                Some("low".to_string()),
                Some("high".to_string()),
                Some("high".to_string()),
                Some("low".to_string())
            ]
        );
        assert_eq!(
            table.numbers("Plane").unwrap(),
            vec![Some(1.0), Some(1.0), Some(2.0), Some(2.0)]
        );
    }
}
