//! Bagscan - trial pipeline for bag-scanning visual search data
//!
//! Bagscan turns a raw per-trial log into model-ready tables and mixed-model
//! comparisons through a staged pipeline: eligibility → outcome labels →
//! recency features → cohort filtering → model families.
//!
//! Each stage reads a complete CSV table and writes complete CSV tables, so
//! any stage can be rerun on its own. Every exclusion is recorded in a
//! decision log next to the stage outputs.
//!
//! ## Modules
//!
//! - **Data stages**: [`eligibility`], [`outcome`], [`recency`], [`cohort`]
//!   with [`metrics`] and [`features`]
//! - **Models**: [`model`] fits random-intercept mixed models and compares
//!   nested model families
//! - **Orchestration**: [`pipeline`] runs stages against [`config::PathConfig`]

pub mod cohort;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod features;
pub mod metrics;
pub mod model;
pub mod outcome;
pub mod pipeline;
pub mod recency;
pub mod report;
pub mod table;
pub mod types;

pub use config::{PathConfig, StudyConfig};
pub use error::PipelineError;
pub use model::{FitError, FitMethod};
pub use pipeline::{
    run_all, run_binary_factor_models, run_cohort, run_prep, run_raw_factor_models, run_recency,
    StageReport,
};
pub use report::DecisionLog;
pub use table::{Cell, Table};
pub use types::TableCounts;

/// Crate version embedded in model artifacts
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for model artifacts
pub const PRODUCER_NAME: &str = "bagscan";
