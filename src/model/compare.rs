//! Nested model comparison

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use super::lmm::FittedModel;
use super::FitError;

/// `−2 llf + ln(n) k`
pub fn bic(model: &FittedModel) -> f64 {
    -2.0 * model.llf + (model.n_obs as f64).ln() * model.k as f64
}

/// `−2 llf + 2k`
pub fn aic(model: &FittedModel) -> f64 {
    -2.0 * model.llf + 2.0 * model.k as f64
}

/// Likelihood-ratio test of a reduced model against the full model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub name: String,
    pub formula: String,
    pub lr_stat: f64,
    pub df: usize,
    pub p_value: f64,
    pub llf: f64,
    pub bic: f64,
    pub aic: f64,
}

/// `LR = 2 (llf_full − llf_reduced)` against `χ²` with the parameter-count
/// difference as degrees of freedom
pub fn likelihood_ratio_test(
    full: &FittedModel,
    reduced: &FittedModel,
) -> Result<Comparison, FitError> {
    let df = full.k as i64 - reduced.k as i64;
    if df <= 0 {
        return Err(FitError::InvalidDegreesOfFreedom(df));
    }
    let lr_stat = 2.0 * (full.llf - reduced.llf);
    let chi2 = ChiSquared::new(df as f64).map_err(|e| FitError::Distribution(e.to_string()))?;

    Ok(Comparison {
        name: reduced.name.clone(),
        formula: reduced.formula.clone(),
        lr_stat,
        df: df as usize,
        p_value: chi2.sf(lr_stat),
        llf: reduced.llf,
        bic: bic(reduced),
        aic: aic(reduced),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FitMethod;

    fn model(name: &str, llf: f64, k: usize) -> FittedModel {
        FittedModel {
            name: name.to_string(),
            formula: format!("RT ~ {name}"),
            method: FitMethod::Reml,
            params: Vec::new(),
            group_var: 1.0,
            scale: 1.0,
            llf,
            k,
            n_obs: 100,
            n_groups: 10,
            min_group_size: 10,
            max_group_size: 10,
            mean_group_size: 10.0,
            boundary: false,
            random_effects: Vec::new(),
            rows: Vec::new(),
            fitted: Vec::new(),
            residuals: Vec::new(),
        }
    }

    #[test]
    fn test_information_criteria() {
        let m = model("m", -50.0, 3);
        assert!((bic(&m) - (100.0 + 100f64.ln() * 3.0)).abs() < 1e-12);
        assert!((aic(&m) - 106.0).abs() < 1e-12);
    }

    #[test]
    fn test_lrt_one_df() {
        let full = model("full", -100.0, 4);
        let reduced = model("reduced", -101.92072, 3);
        let c = likelihood_ratio_test(&full, &reduced).unwrap();
        assert_eq!(c.df, 1);
        assert!((c.lr_stat - 3.84144).abs() < 1e-9);
        // 3.841459 is the 95% quantile of χ²(1)
        assert!((c.p_value - 0.05).abs() < 1e-4);
    }

    #[test]
    fn test_non_positive_df_rejected() {
        let full = model("full", -100.0, 3);
        let same = model("same", -100.0, 3);
        assert!(matches!(
            likelihood_ratio_test(&full, &same),
            Err(FitError::InvalidDegreesOfFreedom(0))
        ));
    }
}
