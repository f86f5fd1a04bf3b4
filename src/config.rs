//! Pipeline configuration
//!
//! Two layers: [`PathConfig`] (where tables are read from and written to,
//! taken from the environment) and [`StudyConfig`] (the study's inclusion
//! rules and constants, optionally overridden from a JSON file).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::model::FitMethod;

/// Environment variable selecting the raw data directory
pub const DATA_PATH_ENV: &str = "DATA_PATH";
/// Environment variable selecting the output directory
pub const OUTPUT_PATH_ENV: &str = "OUTPUT_PATH";
/// Environment variable overriding a stage's input file name
pub const INPUT_FILE_ENV: &str = "INPUT_FILE";

pub const DEFAULT_DATA_PATH: &str = "./data";
pub const DEFAULT_OUTPUT_PATH: &str = "./output";

// Stage handoff files
pub const RAW_TRIALS_FILE: &str = "wColor_Honolulu_sandboxId_1-5.csv";
pub const PREPARED_FILE: &str = "df_HNL_1-5.csv";
pub const RECENCY_FILE: &str = "df_HNL_1-5_recent_occurrence.csv";
pub const INDIVIDUAL_METRICS_FILE: &str = "individual_metrics.csv";
pub const DIFFICULTY_FILE: &str = "target_difficulty_omnibus_lme.csv";
pub const FEATURES_FILE: &str = "df_HNL1_all_final.csv";
pub const MODEL_INPUT_FILE: &str = "df_HNL1_hits_final_cleaned_for_LME.csv";
pub const FITTED_RESIDUALS_FILE: &str = "df_HNL1_3factors_LME_fitted_values_residuals.csv";

// Model artifacts
pub const RAW_MODEL_SUMMARY_FILE: &str = "omnibus_full_model_summary.txt";
pub const RAW_MODEL_FILE: &str = "omnibus_full_model.json";
pub const RAW_MODEL_RESULTS_FILE: &str = "omnibus_full_model_results.json";
pub const RAW_MODEL_LOG_FILE: &str = "omnibus_lme_model_analysis_log.txt";
pub const BINARY_MODEL_SUMMARY_FILE: &str = "omnibus_binary_model_summary.txt";
pub const BINARY_MODEL_FILE: &str = "omnibus_binary_model.json";
pub const BINARY_MODEL_RESULTS_FILE: &str = "omnibus_binary_model_results.json";
pub const BINARY_MODEL_LOG_FILE: &str = "omnibus_lme_median_split_lrt_log.txt";

// Timestamped decision-log prefixes
pub const PREP_LOG_PREFIX: &str = "prep_log";
pub const RECENCY_LOG_PREFIX: &str = "recency_log";
pub const COHORT_LOG_PREFIX: &str = "filtering_log";

/// Input/output locations for one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Replaces the default input file name of whichever stage is run
    pub input_file: Option<String>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_PATH),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_PATH),
            input_file: None,
        }
    }
}

impl PathConfig {
    pub fn new(data_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            output_dir: output_dir.into(),
            input_file: None,
        }
    }

    /// Read `DATA_PATH`, `OUTPUT_PATH` and `INPUT_FILE`
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            data_dir: var(DATA_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH)),
            output_dir: var(OUTPUT_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_PATH)),
            input_file: var(INPUT_FILE_ENV),
        }
    }

    pub fn with_input_file(mut self, name: impl Into<String>) -> Self {
        self.input_file = Some(name.into());
        self
    }

    /// Input path of a stage: the override if set, else `default` under `dir`
    pub fn input_in(&self, dir: &Path, default: &str) -> PathBuf {
        dir.join(self.input_file.as_deref().unwrap_or(default))
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }
}

/// Study inclusion rules and constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    /// Day whose trial count is checked against `expected_day1_trials`
    pub baseline_day: i64,
    /// Day whose trial count is checked against `expected_day2_trials`
    pub test_day: i64,
    pub expected_day1_trials: usize,
    pub expected_day2_trials: usize,

    /// RT values that indicate a logging fault; users with any are dropped
    pub rt_sentinels: Vec<f64>,
    /// RT at or below this is nulled
    pub rt_min_exclusive: f64,
    /// RT above this is nulled
    pub rt_max_inclusive: f64,

    /// Days kept by the cohort stage
    pub analysis_days: Vec<i64>,
    /// Day the per-user performance summaries are computed from
    pub metrics_day: i64,
    /// Day the modelled trials come from
    pub feature_day: i64,
    /// Device upgrades a user may have active on every trial
    pub allowed_upgrades_mask: i64,
    /// Bag types common enough to keep
    pub common_bag_types: Vec<i64>,
    /// How many of the most frequent targets are candidates
    pub top_target_count: usize,
    /// Trials with `LegalItems` at or below this are dropped
    pub min_set_size_exclusive: f64,
    /// `LegalItems` above this is a "high" set size
    pub set_size_high_threshold: f64,
    /// Trials after this number fall in the second block
    pub block_split_trial: f64,

    pub fit_method: FitMethod,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            baseline_day: 1,
            test_day: 2,
            expected_day1_trials: 24,
            expected_day2_trials: 36,
            rt_sentinels: vec![0.0, 1.0],
            rt_min_exclusive: 250.0,
            rt_max_inclusive: 10_000.0,
            analysis_days: vec![1, 2],
            metrics_day: 2,
            feature_day: 1,
            allowed_upgrades_mask: 8 | 16 | 2048,
            common_bag_types: vec![1, 2, 3, 4],
            top_target_count: 10,
            min_set_size_exclusive: 4.0,
            set_size_high_threshold: 7.0,
            block_split_trial: 12.0,
            fit_method: FitMethod::Reml,
        }
    }
}

impl StudyConfig {
    /// Load overrides from a JSON file; absent fields keep their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::MissingFile(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path)?;
        let config: StudyConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.rt_min_exclusive >= self.rt_max_inclusive {
            return Err(PipelineError::InvalidConfig(format!(
                "RT range is empty: ({}, {}]",
                self.rt_min_exclusive, self.rt_max_inclusive
            )));
        }
        if self.common_bag_types.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "common_bag_types must not be empty".to_string(),
            ));
        }
        if self.top_target_count == 0 {
            return Err(PipelineError::InvalidConfig(
                "top_target_count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_study_constants() {
        let config = StudyConfig::default();
        assert_eq!(config.expected_day1_trials, 24);
        assert_eq!(config.expected_day2_trials, 36);
        assert_eq!(config.allowed_upgrades_mask, 2072);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: StudyConfig =
            serde_json::from_str(r#"{"expected_day1_trials": 20, "fit_method": "ml"}"#).unwrap();
        assert_eq!(config.expected_day1_trials, 20);
        assert_eq!(config.expected_day2_trials, 36);
        assert_eq!(config.fit_method, FitMethod::Ml);
    }

    #[test]
    fn test_invalid_rt_range() {
        let config = StudyConfig {
            rt_min_exclusive: 500.0,
            rt_max_inclusive: 100.0,
            ..StudyConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_input_override() {
        let paths = PathConfig::new("/data", "/out").with_input_file("custom.csv");
        assert_eq!(
            paths.input_in(&paths.output_dir, RECENCY_FILE),
            PathBuf::from("/out/custom.csv")
        );
        assert_eq!(paths.output(PREPARED_FILE), PathBuf::from("/out/df_HNL_1-5.csv"));
    }

    #[test]
    fn test_missing_study_file() {
        let result = StudyConfig::from_json_file(Path::new("/nonexistent/study.json"));
        assert!(matches!(result, Err(PipelineError::MissingFile(_))));
    }
}
