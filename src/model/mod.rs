//! Mixed-model fitting and comparison
//!
//! A linear mixed model with one random intercept per user, fitted by
//! restricted or full maximum likelihood. Model families are declared as
//! typed term lists; every reduced model is compared against the family's
//! full model with a likelihood-ratio test and information criteria.
//!
//! # Architecture
//!
//! ```text
//! ModelSpec ──► design ──► lmm (profiled likelihood, linalg) ──► FittedModel
//!                                                                   │
//!                          compare (LRT, BIC, AIC) ◄────────────────┘
//!                                   │
//!                                   ▼
//!                         artifact (summary text, JSON)
//! ```

pub mod artifact;
pub mod compare;
pub mod design;
pub mod families;
pub mod linalg;
pub mod lmm;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use artifact::{ArtifactEncoder, ModelArtifacts, ModelFailure};
pub use compare::{aic, bic, likelihood_ratio_test, Comparison};
pub use design::{full_factorial, Design, Levels, ModelSpec, Term};
pub use families::{binary_factor_family, raw_factor_family, ModelFamily};
pub use lmm::{fit, Estimate, FittedModel};

/// Likelihood the variance parameters are estimated under
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMethod {
    #[default]
    Reml,
    Ml,
}

impl fmt::Display for FitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitMethod::Reml => f.write_str("REML"),
            FitMethod::Ml => f.write_str("ML"),
        }
    }
}

/// Failure of a single model; siblings are unaffected
#[derive(Debug, Error)]
pub enum FitError {
    #[error("Missing model column: {0}")]
    MissingColumn(String),

    #[error("Level {level:?} of {column} is not in the declared level order")]
    UnknownLevel { column: String, level: String },

    #[error("No complete rows to fit")]
    NoObservations,

    #[error("{n_obs} observations cannot identify {n_params} fixed effects")]
    TooFewObservations { n_obs: usize, n_params: usize },

    #[error("Normal equations are singular or not positive definite")]
    Singular,

    #[error("Log-likelihood is not finite")]
    NonFiniteLikelihood,

    #[error("Comparison needs a positive parameter difference, got {0}")]
    InvalidDegreesOfFreedom(i64),

    #[error("Distribution error: {0}")]
    Distribution(String),
}
