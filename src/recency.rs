//! Recency and exposure features
//!
//! For each user and session day, tracks how many trials ago the same event
//! value (target identity, target presence, bag type) was last seen and how
//! many times it has been seen so far. Colour matches between target and
//! distractor colours get their own tracker. The lookback projector then
//! copies the outcome of the referenced earlier trial onto each row.
//!
//! The per-group calculators work on plain ordered slices; the table
//! functions only gather those slices and scatter the results back.

use std::collections::{BTreeSet, HashMap};

use crate::error::PipelineError;
use crate::table::{Cell, Table};
use crate::types::{
    cumulative_column, trials_since_column, BAG_TYPE, COLOR_MATCH, COLOR_MATCH_FLAG,
    CUMULATIVE_COLOR_AS_ILLEGAL, CUMULATIVE_COLOR_AS_LEGAL, DAY, ILLEGAL1_COLOR, ILLEGAL1_NAME,
    ILLEGAL_ITEMS, LAST_COLOR_MATCH_TRIAL, TARGET_PRESENT, TRIAL_NUMBER, TRIAL_RESULT, USER_ID,
};

/// Event columns that get trials-since and cumulative counters
pub const RECENCY_EVENTS: [&str; 3] = [ILLEGAL1_NAME, TARGET_PRESENT, BAG_TYPE];

/// Events whose trials-since column feeds the lookback projector
pub const LOOKBACK_EVENTS: [&str; 4] = [ILLEGAL1_NAME, TARGET_PRESENT, BAG_TYPE, COLOR_MATCH];

/// Recency state of one trial for one event column
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recency {
    /// Trial-number distance to the previous occurrence of the same value
    pub trials_since: Option<f64>,
    /// Occurrences of this value so far in the group, this trial included
    pub cumulative: u32,
}

impl Recency {
    const ABSENT: Recency = Recency {
        trials_since: None,
        cumulative: 0,
    };
}

/// Recency counters for one user/day group, trials in increasing trial order.
///
/// The first occurrence of a value has no trials-since and a count of 1; the
/// Nth occurrence has count N and the trial-number gap to occurrence N-1.
/// Trials with no value get no trials-since and a count of 0.
pub fn recency_for_group(values: &[Option<&str>], trial_numbers: &[Option<f64>]) -> Vec<Recency> {
    let mut last_seen: HashMap<&str, (Option<f64>, u32)> = HashMap::new();
    values
        .iter()
        .zip(trial_numbers)
        .map(|(value, trial)| {
            let Some(value) = *value else {
                return Recency::ABSENT;
            };
            match last_seen.get_mut(value) {
                Some((last, count)) => {
                    let trials_since = match (trial, *last) {
                        (Some(t), Some(l)) => Some(t - l),
                        _ => None,
                    };
                    *last = *trial;
                    *count += 1;
                    Recency {
                        trials_since,
                        cumulative: *count,
                    }
                }
                None => {
                    last_seen.insert(value, (*trial, 1));
                    Recency {
                        trials_since: None,
                        cumulative: 1,
                    }
                }
            }
        })
        .collect()
}

/// User/day groups with rows sorted by trial number (missing numbers last)
fn user_day_groups(table: &Table) -> Result<Vec<Vec<usize>>, PipelineError> {
    let trial_numbers = table.numbers(TRIAL_NUMBER)?;
    let mut groups: Vec<Vec<usize>> = table
        .groups(&[USER_ID, DAY])?
        .into_iter()
        .map(|g| g.rows)
        .collect();
    for rows in &mut groups {
        rows.sort_by(|a, b| match (trial_numbers[*a], trial_numbers[*b]) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }
    Ok(groups)
}

/// Add `TrialsSinceLast_<event>_ByDay` and `Cumulative_<event>_ByDay`
pub fn add_recency_columns(table: &mut Table, event: &str) -> Result<(), PipelineError> {
    let values = table.labels(event)?;
    let trial_numbers = table.numbers(TRIAL_NUMBER)?;

    let mut output = vec![Recency::ABSENT; table.n_rows()];
    for rows in user_day_groups(table)? {
        let group_values: Vec<Option<&str>> = rows.iter().map(|&r| values[r].as_deref()).collect();
        let group_trials: Vec<Option<f64>> = rows.iter().map(|&r| trial_numbers[r]).collect();
        for (row, recency) in rows.iter().zip(recency_for_group(&group_values, &group_trials)) {
            output[*row] = recency;
        }
    }

    table.set_numbers(
        &trials_since_column(event),
        output.iter().map(|r| r.trials_since).collect(),
    )?;
    table.set_column(
        &cumulative_column(event),
        output
            .iter()
            .map(|r| Cell::Number(f64::from(r.cumulative)))
            .collect(),
    )?;
    Ok(())
}

/// Colour columns of the target (illegal) and distractor (legal) item slots
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColorColumns {
    pub illegal: Vec<String>,
    pub legal: Vec<String>,
}

impl ColorColumns {
    /// Find slot colour columns by name, ignoring colour-derived columns
    pub fn discover(names: &[String]) -> Self {
        let derived = [
            COLOR_MATCH_FLAG,
            LAST_COLOR_MATCH_TRIAL,
            CUMULATIVE_COLOR_AS_ILLEGAL,
            CUMULATIVE_COLOR_AS_LEGAL,
        ];
        let mut columns = ColorColumns::default();
        for name in names {
            if !name.contains("Color")
                || derived.contains(&name.as_str())
                || name.contains(COLOR_MATCH)
            {
                continue;
            }
            if name.contains("Illegal") {
                columns.illegal.push(name.clone());
            } else if name.contains("Legal") {
                columns.legal.push(name.clone());
            }
        }
        columns
    }
}

/// Colours shown on one trial
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColorTrial {
    pub trial_number: Option<f64>,
    /// Colour of the first target item
    pub target_color: Option<String>,
    pub illegal: BTreeSet<String>,
    pub legal: BTreeSet<String>,
}

/// Colour-match state of one trial
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatch {
    /// A target colour is also a distractor colour on this trial
    pub flag: bool,
    /// This trial's number when `flag` is set
    pub last_match_trial: Option<f64>,
    /// Trials since the most recent match at or before this trial
    pub trials_since_match: Option<f64>,
    /// Trials so far showing this trial's target colour on a target
    pub target_color_as_illegal: u32,
    /// Trials so far showing this trial's target colour on a distractor
    pub target_color_as_legal: u32,
}

/// Colour-match tracker for one user/day group, trials in trial order
pub fn color_match_for_group(trials: &[ColorTrial]) -> Vec<ColorMatch> {
    let mut last_match: Option<f64> = None;
    let mut exposure: HashMap<&str, (u32, u32)> = HashMap::new();

    trials
        .iter()
        .map(|trial| {
            for color in &trial.illegal {
                exposure.entry(color.as_str()).or_default().0 += 1;
            }
            for color in &trial.legal {
                exposure.entry(color.as_str()).or_default().1 += 1;
            }
            let (as_illegal, as_legal) = trial
                .target_color
                .as_deref()
                .and_then(|c| exposure.get(c).copied())
                .unwrap_or_default();

            let flag = !trial.illegal.is_disjoint(&trial.legal);
            if flag && trial.trial_number.is_some() {
                last_match = trial.trial_number;
            }
            let trials_since_match = match (trial.trial_number, last_match) {
                (Some(t), Some(l)) => Some(t - l),
                _ => None,
            };

            ColorMatch {
                flag,
                last_match_trial: if flag { trial.trial_number } else { None },
                trials_since_match,
                target_color_as_illegal: as_illegal,
                target_color_as_legal: as_legal,
            }
        })
        .collect()
}

fn color_set(columns: &[Vec<Option<String>>], row: usize) -> BTreeSet<String> {
    columns.iter().filter_map(|c| c[row].clone()).collect()
}

/// Add the colour-match flag, last match trial, trials since last match and
/// target-colour exposure counters
pub fn add_color_match_columns(
    table: &mut Table,
    colors: &ColorColumns,
) -> Result<(), PipelineError> {
    let illegal = colors
        .illegal
        .iter()
        .map(|c| table.labels(c))
        .collect::<Result<Vec<_>, _>>()?;
    let legal = colors
        .legal
        .iter()
        .map(|c| table.labels(c))
        .collect::<Result<Vec<_>, _>>()?;
    let target_colors = if table.has_column(ILLEGAL1_COLOR) {
        table.labels(ILLEGAL1_COLOR)?
    } else {
        vec![None; table.n_rows()]
    };
    let trial_numbers = table.numbers(TRIAL_NUMBER)?;

    let n = table.n_rows();
    let mut flags = vec![Cell::flag(false); n];
    let mut last_match = vec![None; n];
    let mut since = vec![None; n];
    let mut as_illegal = vec![Cell::Number(0.0); n];
    let mut as_legal = vec![Cell::Number(0.0); n];

    for rows in user_day_groups(table)? {
        let trials: Vec<ColorTrial> = rows
            .iter()
            .map(|&r| ColorTrial {
                trial_number: trial_numbers[r],
                target_color: target_colors[r].clone(),
                illegal: color_set(&illegal, r),
                legal: color_set(&legal, r),
            })
            .collect();
        for (&row, state) in rows.iter().zip(color_match_for_group(&trials)) {
            flags[row] = Cell::flag(state.flag);
            last_match[row] = state.last_match_trial;
            since[row] = state.trials_since_match;
            as_illegal[row] = Cell::Number(f64::from(state.target_color_as_illegal));
            as_legal[row] = Cell::Number(f64::from(state.target_color_as_legal));
        }
    }

    table.set_numbers(LAST_COLOR_MATCH_TRIAL, last_match)?;
    table.set_numbers(&trials_since_column(COLOR_MATCH), since)?;
    table.set_column(CUMULATIVE_COLOR_AS_LEGAL, as_legal)?;
    table.set_column(CUMULATIVE_COLOR_AS_ILLEGAL, as_illegal)?;
    table.set_column(COLOR_MATCH_FLAG, flags)?;
    Ok(())
}

/// Row positions referenced by trials-since values, counted back from each
/// row's global position. Missing values and positions outside the table
/// give `None`.
pub fn lookback_rows(trials_since: &[Option<f64>]) -> Vec<Option<usize>> {
    let len = trials_since.len() as f64;
    trials_since
        .iter()
        .enumerate()
        .map(|(row, since)| {
            let target = (row as f64 - (*since)?).trunc();
            (target >= 0.0 && target < len).then_some(target as usize)
        })
        .collect()
}

pub fn last_result_column(event: &str) -> String {
    format!("Last_TrialResult_for_{event}")
}

pub fn last_illegal_items_column(event: &str) -> String {
    format!("Last_IllegalItems_for_{event}")
}

/// Copy `TrialResult` and `IllegalItems` from the row `TrialsSinceLast_<event>_ByDay`
/// positions earlier in the table
pub fn project_lookback(table: &mut Table, event: &str) -> Result<(), PipelineError> {
    let since = table.numbers(&trials_since_column(event))?;
    let targets = lookback_rows(&since);

    let results = table.column(TRIAL_RESULT)?;
    let items = table.column(ILLEGAL_ITEMS)?;
    let last_result: Vec<Cell> = targets
        .iter()
        .map(|t| t.map_or(Cell::Missing, |r| results[r].clone()))
        .collect();
    let last_items: Vec<Cell> = targets
        .iter()
        .map(|t| t.map_or(Cell::Missing, |r| items[r].clone()))
        .collect();

    table.set_column(&last_result_column(event), last_result)?;
    table.set_column(&last_illegal_items_column(event), last_items)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn trials(n: usize) -> Vec<Option<f64>> {
        (1..=n).map(|t| Some(t as f64)).collect()
    }

    #[test]
    fn test_first_occurrence() {
        let out = recency_for_group(&[Some("KNIFE")], &trials(1));
        assert_eq!(
            out,
            vec![Recency {
                trials_since: None,
                cumulative: 1
            }]
        );
    }

    #[test]
    fn test_nth_occurrence_gap_and_count() {
        let values = [Some("A"), Some("B"), Some("A"), None, Some("A"), Some("B")];
        let out = recency_for_group(&values, &trials(6));

        let since: Vec<Option<f64>> = out.iter().map(|r| r.trials_since).collect();
        let counts: Vec<u32> = out.iter().map(|r| r.cumulative).collect();
        assert_eq!(since, vec![None, None, Some(2.0), None, Some(2.0), Some(4.0)]);
        assert_eq!(counts, vec![1, 1, 2, 0, 3, 2]);
    }

    #[test]
    fn test_missing_trial_number_propagates() {
        let values = [Some("A"), Some("A"), Some("A")];
        let numbers = [Some(1.0), None, Some(3.0)];
        let out = recency_for_group(&values, &numbers);
        assert_eq!(out[1].trials_since, None);
        assert_eq!(out[2].trials_since, None);
        assert_eq!(out[2].cumulative, 3);
    }

    fn day_table() -> Table {
        Table::from_csv_reader(
            "UserId,Day,TrialNumber,Illegal1Name,IllegalItems,TrialResult\n\
             u1,1,1,KNIFE,1,Hit\n\
             u1,1,2,GUN,1,Miss\n\
             u1,1,3,KNIFE,1,Hit\n\
             u1,2,4,KNIFE,1,Miss\n\
             u1,2,5,KNIFE,1,Hit\n\
             u2,1,1,KNIFE,1,Hit\n"
                .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_counters_reset_per_day_and_user() {
        let mut table = day_table();
        add_recency_columns(&mut table, ILLEGAL1_NAME).unwrap();

        assert_eq!(
            table.numbers("TrialsSinceLast_Illegal1Name_ByDay").unwrap(),
            vec![None, None, Some(2.0), None, Some(1.0), None]
        );
        assert_eq!(
            table.numbers("Cumulative_Illegal1Name_ByDay").unwrap(),
            vec![Some(1.0), Some(1.0), Some(2.0), Some(1.0), Some(2.0), Some(1.0)]
        );
    }

    #[test]
    fn test_group_scanned_in_trial_order() {
        // Rows out of trial order within the group
        let mut table = Table::from_csv_reader(
            "UserId,Day,TrialNumber,Type\nu,1,3,BACKPACK\nu,1,1,BACKPACK\n".as_bytes(),
        )
        .unwrap();
        add_recency_columns(&mut table, BAG_TYPE).unwrap();
        assert_eq!(
            table.numbers("TrialsSinceLast_Type_ByDay").unwrap(),
            vec![Some(2.0), None]
        );
        assert_eq!(
            table.numbers("Cumulative_Type_ByDay").unwrap(),
            vec![Some(2.0), Some(1.0)]
        );
    }

    #[test]
    fn test_lookback_rows() {
        let since = [None, Some(1.0), Some(5.0), Some(0.0), Some(2.0)];
        assert_eq!(
            lookback_rows(&since),
            vec![None, Some(0), None, Some(3), Some(2)]
        );
    }

    #[test]
    fn test_project_lookback() {
        let mut table = day_table();
        add_recency_columns(&mut table, ILLEGAL1_NAME).unwrap();
        project_lookback(&mut table, ILLEGAL1_NAME).unwrap();

        let last = table.labels("Last_TrialResult_for_Illegal1Name").unwrap();
        assert_eq!(
            last,
            vec![
                None,
                None,
                Some("Hit".to_string()),
                None,
                Some("Miss".to_string()),
                None
            ]
        );
        assert_eq!(
            table.numbers("Last_IllegalItems_for_Illegal1Name").unwrap()[2],
            Some(1.0)
        );
    }

    #[test]
    fn test_discover_color_columns() {
        let names: Vec<String> = [
            "Illegal1Color",
            "Illegal2Color",
            "Legal1Color",
            "Legal2Color",
            "Illegal1Name",
            "Cumulative_Illegal1Color_AsLegal",
            "TrialsSinceLast_ColorMatch_ByDay",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let columns = ColorColumns::discover(&names);
        assert_eq!(columns.illegal, vec!["Illegal1Color", "Illegal2Color"]);
        assert_eq!(columns.legal, vec!["Legal1Color", "Legal2Color"]);
    }

    fn color_trial(n: f64, target: &str, illegal: &[&str], legal: &[&str]) -> ColorTrial {
        ColorTrial {
            trial_number: Some(n),
            target_color: Some(target.to_string()),
            illegal: illegal.iter().map(|s| s.to_string()).collect(),
            legal: legal.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_color_match_tracking() {
        let trials = vec![
            color_trial(1.0, "red", &["red"], &["blue"]),
            color_trial(2.0, "red", &["red"], &["red", "green"]),
            color_trial(3.0, "blue", &["blue"], &["green"]),
            color_trial(4.0, "green", &["green"], &["green"]),
            color_trial(5.0, "red", &["red"], &["blue"]),
        ];
        let out = color_match_for_group(&trials);

        let flags: Vec<bool> = out.iter().map(|m| m.flag).collect();
        assert_eq!(flags, vec![false, true, false, true, false]);

        let since: Vec<Option<f64>> = out.iter().map(|m| m.trials_since_match).collect();
        assert_eq!(since, vec![None, Some(0.0), Some(1.0), Some(0.0), Some(1.0)]);

        let last: Vec<Option<f64>> = out.iter().map(|m| m.last_match_trial).collect();
        assert_eq!(last, vec![None, Some(2.0), None, Some(4.0), None]);

        // red: target on trials 1, 2, 5; distractor on trial 2
        assert_eq!(out[4].target_color_as_illegal, 3);
        assert_eq!(out[4].target_color_as_legal, 1);
        // blue at trial 3: distractor once before, target once
        assert_eq!(out[2].target_color_as_illegal, 1);
        assert_eq!(out[2].target_color_as_legal, 1);
    }

    #[test]
    fn test_color_match_columns_on_table() {
        let mut table = Table::from_csv_reader(
            "UserId,Day,TrialNumber,Illegal1Color,Legal1Color,Legal2Color\n\
             u,1,1,red,blue,\n\
             u,1,2,red,red,\n\
             u,1,3,blue,green,\n\
             u,2,4,blue,green,\n"
                .as_bytes(),
        )
        .unwrap();
        let colors = ColorColumns::discover(table.column_names());
        add_color_match_columns(&mut table, &colors).unwrap();

        assert_eq!(
            table.labels(COLOR_MATCH_FLAG).unwrap(),
            vec![
                Some("False".to_string()),
                Some("True".to_string()),
                Some("False".to_string()),
                Some("False".to_string())
            ]
        );
        assert_eq!(
            table.numbers("TrialsSinceLast_ColorMatch_ByDay").unwrap(),
            vec![None, Some(0.0), Some(1.0), None]
        );
        assert_eq!(
            table.numbers(CUMULATIVE_COLOR_AS_ILLEGAL).unwrap(),
            vec![Some(1.0), Some(2.0), Some(1.0), Some(1.0)]
        );
    }
}
