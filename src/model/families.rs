//! Model families
//!
//! A family is one full model plus the reduced models compared against it.

use std::collections::HashMap;

use super::design::{full_factorial, ModelSpec, Term};
use super::FitError;
use crate::table::{sort_labels, Table};
use crate::types::{
    cumulative_prob_column, trials_since_column, AVG_HIT_RT, AVG_HIT_RT_CATEGORY,
    DIFFICULTY_CATEGORY, DIFFICULTY_SCORE, ILLEGAL1_NAME, LEGAL_ITEMS, PLANE,
    PREVIOUS_TARGET_COND_MATCH, RT, TARGET_PRESENT, TRIAL_NUMBER, USER_ID,
};

#[derive(Debug, Clone)]
pub struct ModelFamily {
    pub full: ModelSpec,
    pub reduced: Vec<ModelSpec>,
}

/// Targets ordered by their first listed difficulty score, easiest first.
/// Targets without a score go last; ties keep name order.
pub fn difficulty_order(table: &Table) -> Result<Vec<String>, FitError> {
    let names = table
        .labels(ILLEGAL1_NAME)
        .map_err(|_| FitError::MissingColumn(ILLEGAL1_NAME.to_string()))?;
    let scores = table
        .numbers(DIFFICULTY_SCORE)
        .map_err(|_| FitError::MissingColumn(DIFFICULTY_SCORE.to_string()))?;

    let mut first_score: HashMap<String, Option<f64>> = HashMap::new();
    for (name, score) in names.iter().zip(&scores) {
        let Some(name) = name else { continue };
        let entry = first_score.entry(name.clone()).or_insert(None);
        if entry.is_none() {
            *entry = *score;
        }
    }

    let mut targets: Vec<String> = first_score.keys().cloned().collect();
    sort_labels(&mut targets);
    targets.sort_by(|a, b| match (first_score[a], first_score[b]) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    Ok(targets)
}

fn without(full: &ModelSpec, name: &str, labels: &[&Term]) -> ModelSpec {
    let labels: Vec<String> = labels.iter().map(|t| t.to_string()).collect();
    full.without(name, &labels)
}

/// Raw trial-history factors: the full model, five group-wise reductions and
/// one leave-one-term-out model per term
pub fn raw_factor_family(table: &Table) -> Result<ModelFamily, FitError> {
    let trial = Term::categorical(TRIAL_NUMBER);
    let since_target = Term::categorical(&trials_since_column(ILLEGAL1_NAME));
    let since_present = Term::categorical(&trials_since_column(TARGET_PRESENT));
    let set_size = Term::categorical(LEGAL_ITEMS);
    let target = Term::categorical_in_order(ILLEGAL1_NAME, difficulty_order(table)?);
    let individual = Term::continuous(AVG_HIT_RT);
    let exposure_target = Term::continuous(&cumulative_prob_column(ILLEGAL1_NAME));
    let exposure_present = Term::continuous(&cumulative_prob_column(TARGET_PRESENT));

    let terms = vec![
        trial.clone(),
        since_target.clone(),
        since_present.clone(),
        set_size.clone(),
        target.clone(),
        individual.clone(),
        exposure_target.clone(),
        exposure_present.clone(),
    ];
    let full = ModelSpec::new("Full Model", RT, terms.clone(), USER_ID);

    let mut reduced = vec![
        without(&full, "Without Individual Differences", &[&individual]),
        without(
            &full,
            "Without Trial History",
            &[
                &trial,
                &since_target,
                &since_present,
                &exposure_target,
                &exposure_present,
            ],
        ),
        without(
            &full,
            "Without Recent Exposure Features",
            &[&since_target, &since_present],
        ),
        without(
            &full,
            "Without Cumulative Exposure Features",
            &[&exposure_target, &exposure_present],
        ),
        without(&full, "Without Stimulus Features", &[&set_size, &target]),
    ];
    for term in &terms {
        reduced.push(without(&full, &format!("Without {term}"), &[term]));
    }

    Ok(ModelFamily { full, reduced })
}

/// Binary splits: the four-way factorial, main effects only, and the
/// factorial of each three-factor subset
pub fn binary_factor_family() -> ModelFamily {
    let factors = vec![
        Term::categorical(AVG_HIT_RT_CATEGORY),
        Term::continuous(PREVIOUS_TARGET_COND_MATCH),
        Term::categorical(DIFFICULTY_CATEGORY),
        Term::categorical(PLANE),
    ];
    let full = ModelSpec::new("Full Model", RT, full_factorial(&factors), USER_ID);

    let mut reduced = vec![ModelSpec::new(
        "Without Interactions",
        RT,
        factors.clone(),
        USER_ID,
    )];
    for (i, dropped) in factors.iter().enumerate() {
        let rest: Vec<Term> = factors
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, t)| t.clone())
            .collect();
        reduced.push(ModelSpec::new(
            &format!("Without {dropped}"),
            RT,
            full_factorial(&rest),
            USER_ID,
        ));
    }

    ModelFamily { full, reduced }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn difficulty_table() -> Table {
        Table::from_csv_reader(
            "Illegal1Name,Difficulty_Score\n\
             KNIFE,0.7\n\
             PISTOL,0.1\n\
             KNIFE,0.2\n\
             LIGHTER,\n\
             GRENADE,0.5\n"
                .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_difficulty_order() {
        assert_eq!(
            difficulty_order(&difficulty_table()).unwrap(),
            vec!["PISTOL", "GRENADE", "KNIFE", "LIGHTER"]
        );
    }

    #[test]
    fn test_raw_family_shape() {
        let family = raw_factor_family(&difficulty_table()).unwrap();
        assert_eq!(family.full.terms.len(), 8);
        assert_eq!(family.reduced.len(), 13);
        assert_eq!(
            family.reduced[1].formula(),
            "RT ~ C(LegalItems) + C(Illegal1Name) + avg_hit_RT + (1|UserId)"
        );
        assert_eq!(family.reduced[5].name, "Without C(TrialNumber)");
        assert!(family.reduced.iter().all(|m| m.terms.len() < 8));
    }

    #[test]
    fn test_binary_family_shape() {
        let family = binary_factor_family();
        assert_eq!(family.full.terms.len(), 15);
        let names: Vec<&str> = family.reduced.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Without Interactions",
                "Without C(avg_hit_RT_Category)",
                "Without PreviousTargetCondMatch",
                "Without C(Difficulty_Category)",
                "Without C(Plane)",
            ]
        );
        assert_eq!(family.reduced[0].terms.len(), 4);
        assert!(family.reduced[1..].iter().all(|m| m.terms.len() == 7));
    }
}
