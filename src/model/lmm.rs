//! Random-intercept linear mixed model
//!
//! `y = Xβ + u_g + ε` with `u_g ~ N(0, σ_u²)` per group and
//! `ε ~ N(0, σ²)`. With `γ = σ_u² / σ²` the marginal covariance of a group
//! of size `n_g` is `σ² (I + γ J)`, whose inverse and determinant have
//! closed forms:
//!
//! ```text
//! (I + γJ)⁻¹ = I − γ / (1 + n_g γ) J        |I + γJ| = 1 + n_g γ
//! ```
//!
//! β and σ² are profiled out, leaving a one-dimensional likelihood in γ
//! that is maximized on the log scale, with the boundary `γ = 0` checked
//! separately.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::f64::consts::PI;

use super::design::{build_design, Design, ModelSpec};
use super::linalg::{dot, Cholesky, Matrix};
use super::{FitError, FitMethod};
use crate::table::Table;

const LOG_GAMMA_MIN: f64 = -20.0;
const LOG_GAMMA_MAX: f64 = 10.0;
const GOLDEN_TOLERANCE: f64 = 1e-8;
const GOLDEN_MAX_ITER: usize = 200;
const BOUNDARY_TOLERANCE: f64 = 1e-9;

/// One fixed-effect estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub name: String,
    pub coef: f64,
    pub std_err: f64,
    pub z: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// Predicted random intercept of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomEffect {
    pub group: String,
    pub intercept: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    pub name: String,
    pub formula: String,
    pub method: FitMethod,
    pub params: Vec<Estimate>,
    /// Random-intercept variance σ_u²
    pub group_var: f64,
    /// Residual variance σ²
    pub scale: f64,
    pub llf: f64,
    /// Estimated parameters: fixed effects plus the group variance
    pub k: usize,
    pub n_obs: usize,
    pub n_groups: usize,
    pub min_group_size: usize,
    pub max_group_size: usize,
    pub mean_group_size: f64,
    /// True when the group variance sits on the zero boundary
    pub boundary: bool,
    pub random_effects: Vec<RandomEffect>,
    /// Source table rows the model was fitted on
    #[serde(skip)]
    pub rows: Vec<usize>,
    /// Fixed part plus predicted random intercept
    #[serde(skip)]
    pub fitted: Vec<f64>,
    #[serde(skip)]
    pub residuals: Vec<f64>,
}

/// Likelihood ingredients that do not depend on γ
struct Sufficient {
    n: usize,
    p: usize,
    xtx: Matrix,
    xty: Vec<f64>,
    yty: f64,
    group_sizes: Vec<f64>,
    group_x_sums: Vec<Vec<f64>>,
    group_y_sums: Vec<f64>,
}

impl Sufficient {
    fn new(design: &Design) -> Self {
        let p = design.n_params();
        let g = design.n_groups();
        let mut xtx = Matrix::zeros(p);
        let mut xty = vec![0.0; p];
        let mut yty = 0.0;
        let mut group_sizes = vec![0.0; g];
        let mut group_x_sums = vec![vec![0.0; p]; g];
        let mut group_y_sums = vec![0.0; g];

        for ((row, &y), &group) in design.x.iter().zip(&design.response).zip(&design.groups) {
            xtx.add_outer(row, 1.0);
            for j in 0..p {
                xty[j] += row[j] * y;
                group_x_sums[group][j] += row[j];
            }
            yty += y * y;
            group_sizes[group] += 1.0;
            group_y_sums[group] += y;
        }

        Self {
            n: design.n_obs(),
            p,
            xtx,
            xty,
            yty,
            group_sizes,
            group_x_sums,
            group_y_sums,
        }
    }

    /// Profiled log-likelihood at a variance ratio
    fn evaluate(&self, gamma: f64, method: FitMethod) -> Result<Profile, FitError> {
        let mut a = self.xtx.clone();
        let mut b = self.xty.clone();
        let mut quadratic = self.yty;
        let mut log_det_v = 0.0;

        for ((n_g, s_g), t_g) in self
            .group_sizes
            .iter()
            .zip(&self.group_x_sums)
            .zip(&self.group_y_sums)
        {
            let c = gamma / (1.0 + n_g * gamma);
            a.add_outer(s_g, -c);
            for (bj, sj) in b.iter_mut().zip(s_g) {
                *bj -= c * sj * t_g;
            }
            quadratic -= c * t_g * t_g;
            log_det_v += (n_g * gamma).ln_1p();
        }

        let chol = Cholesky::new(&a)?;
        let beta = chol.solve(&b);
        let residual_ss = quadratic - dot(&b, &beta);
        if residual_ss.is_nan() || residual_ss <= 0.0 {
            return Err(FitError::NonFiniteLikelihood);
        }

        let dof = match method {
            FitMethod::Ml => self.n as f64,
            FitMethod::Reml => (self.n - self.p) as f64,
        };
        let scale = residual_ss / dof;
        let mut deviance = dof * (2.0 * PI * scale).ln() + log_det_v + dof;
        if method == FitMethod::Reml {
            deviance += chol.log_det();
        }
        let llf = -0.5 * deviance;
        if !llf.is_finite() {
            return Err(FitError::NonFiniteLikelihood);
        }

        Ok(Profile {
            gamma,
            beta,
            chol,
            scale,
            llf,
        })
    }
}

struct Profile {
    gamma: f64,
    beta: Vec<f64>,
    chol: Cholesky,
    scale: f64,
    llf: f64,
}

/// Maximize the profiled likelihood over `ln γ`: a coarse grid locates the
/// bracket, golden-section search refines it, and the result is compared
/// with the `γ = 0` boundary.
fn maximize(suff: &Sufficient, method: FitMethod) -> Result<(Profile, bool), FitError> {
    let boundary = suff.evaluate(0.0, method)?;
    let objective = |theta: f64| -> f64 {
        suff.evaluate(theta.exp(), method)
            .map_or(f64::NEG_INFINITY, |p| p.llf)
    };

    let steps = (LOG_GAMMA_MAX - LOG_GAMMA_MIN) as usize;
    let grid: Vec<f64> = (0..=steps).map(|i| LOG_GAMMA_MIN + i as f64).collect();
    let values: Vec<f64> = grid.iter().map(|&t| objective(t)).collect();
    let best = values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i);

    let mut lo = grid[best.saturating_sub(1)];
    let mut hi = grid[(best + 1).min(steps)];
    let ratio = (5.0_f64.sqrt() - 1.0) / 2.0;
    let mut x1 = hi - ratio * (hi - lo);
    let mut x2 = lo + ratio * (hi - lo);
    let mut f1 = objective(x1);
    let mut f2 = objective(x2);
    for _ in 0..GOLDEN_MAX_ITER {
        if hi - lo < GOLDEN_TOLERANCE {
            break;
        }
        if f1 < f2 {
            lo = x1;
            x1 = x2;
            f1 = f2;
            x2 = lo + ratio * (hi - lo);
            f2 = objective(x2);
        } else {
            hi = x2;
            x2 = x1;
            f2 = f1;
            x1 = hi - ratio * (hi - lo);
            f1 = objective(x1);
        }
    }

    // an interior optimum has to beat the boundary by more than rounding
    let interior = suff.evaluate(((lo + hi) / 2.0).exp(), method);
    match interior {
        Ok(profile) if profile.llf > boundary.llf + BOUNDARY_TOLERANCE => Ok((profile, false)),
        _ => Ok((boundary, true)),
    }
}

/// Fit a model to the complete rows of a table
pub fn fit(table: &Table, spec: &ModelSpec, method: FitMethod) -> Result<FittedModel, FitError> {
    let design = build_design(table, spec)?;
    fit_design(&design, spec, method)
}

pub fn fit_design(
    design: &Design,
    spec: &ModelSpec,
    method: FitMethod,
) -> Result<FittedModel, FitError> {
    let (n, p) = (design.n_obs(), design.n_params());
    if n == 0 {
        return Err(FitError::NoObservations);
    }
    if n <= p {
        return Err(FitError::TooFewObservations {
            n_obs: n,
            n_params: p,
        });
    }

    let suff = Sufficient::new(design);
    let (profile, boundary) = maximize(&suff, method)?;
    tracing::debug!(
        model = %spec.name,
        gamma = profile.gamma,
        llf = profile.llf,
        boundary,
        "profiled likelihood maximized"
    );

    let normal = Normal::new(0.0, 1.0).map_err(|e| FitError::Distribution(e.to_string()))?;
    let critical = normal.inverse_cdf(0.975);
    let covariance = profile.chol.inverse();
    let params: Vec<Estimate> = design
        .names
        .iter()
        .zip(&profile.beta)
        .enumerate()
        .map(|(j, (name, &coef))| {
            let std_err = (profile.scale * covariance.get(j, j)).sqrt();
            let z = coef / std_err;
            Estimate {
                name: name.clone(),
                coef,
                std_err,
                z,
                p_value: 2.0 * normal.sf(z.abs()),
                ci_lower: coef - critical * std_err,
                ci_upper: coef + critical * std_err,
            }
        })
        .collect();

    let fixed: Vec<f64> = design.x.iter().map(|row| dot(row, &profile.beta)).collect();
    let mut residual_sums = vec![0.0; design.n_groups()];
    for ((y, f), &g) in design.response.iter().zip(&fixed).zip(&design.groups) {
        residual_sums[g] += y - f;
    }
    let shrunk: Vec<f64> = residual_sums
        .iter()
        .zip(&suff.group_sizes)
        .map(|(sum, n_g)| profile.gamma / (1.0 + n_g * profile.gamma) * sum)
        .collect();
    let fitted: Vec<f64> = fixed
        .iter()
        .zip(&design.groups)
        .map(|(f, &g)| f + shrunk[g])
        .collect();
    let residuals: Vec<f64> = design
        .response
        .iter()
        .zip(&fitted)
        .map(|(y, f)| y - f)
        .collect();

    let sizes = &suff.group_sizes;
    Ok(FittedModel {
        name: spec.name.clone(),
        formula: spec.formula(),
        method,
        params,
        group_var: profile.gamma * profile.scale,
        scale: profile.scale,
        llf: profile.llf,
        k: p + 1,
        n_obs: n,
        n_groups: design.n_groups(),
        min_group_size: sizes.iter().fold(f64::INFINITY, |m, &s| m.min(s)) as usize,
        max_group_size: sizes.iter().fold(0.0_f64, |m, &s| m.max(s)) as usize,
        mean_group_size: n as f64 / design.n_groups() as f64,
        boundary,
        random_effects: design
            .group_labels
            .iter()
            .zip(&shrunk)
            .map(|(group, &intercept)| RandomEffect {
                group: group.clone(),
                intercept,
            })
            .collect(),
        rows: design.rows.clone(),
        fitted,
        residuals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::design::Term;

    fn balanced() -> Table {
        let mut csv = String::from("UserId,RT\n");
        for (user, values) in [
            ("g1", [1.0, 2.0, 3.0, 4.0]),
            ("g2", [5.0, 6.0, 7.0, 8.0]),
            ("g3", [10.0, 11.0, 12.0, 13.0]),
        ] {
            for v in values {
                csv.push_str(&format!("{user},{v}\n"));
            }
        }
        Table::from_csv_reader(csv.as_bytes()).unwrap()
    }

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * b.abs().max(1.0)
    }

    #[test]
    fn test_balanced_reml_matches_anova() {
        let spec = ModelSpec::new("intercept", "RT", vec![], "UserId");
        let model = fit(&balanced(), &spec, FitMethod::Reml).unwrap();

        // σ² = MSW = 15/9, σ_u² = (MSB − MSW) / 4
        let msw = 15.0 / 9.0;
        let msb = 4.0 * (18.0 + 7.0 / 9.0 + 1.0 / 9.0 + 21.0 + 7.0 / 9.0) / 2.0;
        assert!(close(model.scale, msw, 1e-5), "scale {}", model.scale);
        assert!(close(model.group_var, (msb - msw) / 4.0, 1e-5), "group var {}", model.group_var);
        assert!(close(model.params[0].coef, 20.5 / 3.0, 1e-9));
        assert_eq!(model.k, 2);
        assert_eq!(model.n_groups, 3);
        assert!(!model.boundary);
    }

    #[test]
    fn test_fitted_plus_residual_is_response() {
        let spec = ModelSpec::new("intercept", "RT", vec![], "UserId");
        let model = fit(&balanced(), &spec, FitMethod::Ml).unwrap();
        let table = balanced();
        let rt = table.numbers("RT").unwrap();
        for ((f, r), y) in model.fitted.iter().zip(&model.residuals).zip(&rt) {
            assert!(close(f + r, y.unwrap(), 1e-12));
        }
        // group effects shrink towards zero and sum to zero in a balanced design
        let total: f64 = model.random_effects.iter().map(|e| e.intercept).sum();
        assert!(total.abs() < 1e-9);
    }

    #[test]
    fn test_optimum_beats_other_ratios() {
        let mut csv = String::from("UserId,RT,x\n");
        for i in 0..40 {
            let user = i % 5;
            let x = (i as f64) * 0.5;
            let noise = ((i * 37) % 11) as f64 * 0.3 - 1.5;
            let y = 2.0 + 3.0 * x + user as f64 * 2.0 + noise;
            csv.push_str(&format!("u{user},{y},{x}\n"));
        }
        let table = Table::from_csv_reader(csv.as_bytes()).unwrap();
        let spec = ModelSpec::new("slope", "RT", vec![Term::continuous("x")], "UserId");

        for method in [FitMethod::Ml, FitMethod::Reml] {
            let model = fit(&table, &spec, method).unwrap();
            let design = build_design(&table, &spec).unwrap();
            let suff = Sufficient::new(&design);
            for gamma in [0.0, 0.01, 0.1, 1.0, 10.0, 100.0] {
                let other = suff.evaluate(gamma, method).unwrap();
                assert!(other.llf <= model.llf + 1e-9);
            }
            assert!(close(model.params[1].coef, 3.0, 0.05));
            assert!(model.params[1].p_value < 1e-6);
            assert_eq!(model.k, 3);
        }
    }

    #[test]
    fn test_no_group_variation_hits_boundary() {
        let mut csv = String::from("UserId,RT\n");
        for user in ["a", "b", "c"] {
            for v in [1.0, 2.0, 3.0] {
                csv.push_str(&format!("{user},{v}\n"));
            }
        }
        let table = Table::from_csv_reader(csv.as_bytes()).unwrap();
        let spec = ModelSpec::new("intercept", "RT", vec![], "UserId");
        let model = fit(&table, &spec, FitMethod::Reml).unwrap();
        assert!(model.boundary);
        assert_eq!(model.group_var, 0.0);
    }

    #[test]
    fn test_too_few_observations() {
        let table = Table::from_csv_reader("UserId,RT,x\na,1,1\nb,2,3\n".as_bytes()).unwrap();
        let spec = ModelSpec::new("m", "RT", vec![Term::continuous("x")], "UserId");
        assert!(matches!(
            fit(&table, &spec, FitMethod::Reml),
            Err(FitError::TooFewObservations { n_obs: 2, n_params: 2 })
        ));
    }
}
