//! Pipeline orchestration
//!
//! Each stage reads one complete table from disk, transforms it in memory
//! and writes complete tables back, so stages can be rerun independently:
//!
//! 1. [`run_prep`] - eligibility, outcome labels, response times
//! 2. [`run_recency`] - recency, colour-match and lookback features
//! 3. [`run_cohort`] - cohort filter chain and analysis features
//! 4. [`run_raw_factor_models`] / [`run_binary_factor_models`] - model
//!    families and their comparisons
//!
//! Every stage persists its decision log next to its outputs.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::cohort::build_cohort;
use crate::config::{
    PathConfig, StudyConfig, BINARY_MODEL_FILE, BINARY_MODEL_LOG_FILE, BINARY_MODEL_RESULTS_FILE,
    BINARY_MODEL_SUMMARY_FILE, COHORT_LOG_PREFIX, DIFFICULTY_FILE, FEATURES_FILE,
    FITTED_RESIDUALS_FILE, INDIVIDUAL_METRICS_FILE, MODEL_INPUT_FILE, PREPARED_FILE,
    PREP_LOG_PREFIX, RAW_MODEL_FILE, RAW_MODEL_LOG_FILE, RAW_MODEL_RESULTS_FILE,
    RAW_MODEL_SUMMARY_FILE, RAW_TRIALS_FILE, RECENCY_FILE, RECENCY_LOG_PREFIX,
};
use crate::eligibility::{drop_replays, filter_by_trial_counts};
use crate::error::PipelineError;
use crate::model::{
    bic, binary_factor_family, fit, likelihood_ratio_test, raw_factor_family, ArtifactEncoder,
    Comparison, FitMethod, FittedModel, Levels, ModelFailure, ModelFamily, Term,
};
use crate::outcome::{
    add_log_rt, assign_trial_numbers, categorize_target_condition, drop_sentinel_rt_users,
    label_outcomes, null_out_of_range_rt, select_response_times, summarize,
};
use crate::recency::{
    add_color_match_columns, add_recency_columns, project_lookback, ColorColumns,
    LOOKBACK_EVENTS, RECENCY_EVENTS,
};
use crate::report::{timestamped_log_name, DecisionLog};
use crate::table::Table;
use crate::types::{
    TableCounts, BAG_TYPE, DAY, FIRST_LEGAL_TAP_TIME, FITTED_VALUES, ILLEGAL1_MARK_TIME,
    ILLEGAL1_NAME, ILLEGAL_ITEMS, ILLEGAL_ITEMS_MARKED, LEGAL_ITEMS_MARKED, REPLAY, RESIDUALS,
    TIME_IN_SCANNER, TRIAL_NUMBER, TRIAL_RESULT, UNIQUE_TAPS, USER_ID,
};

/// Columns the prep stage reads from the raw trial log
const RAW_COLUMNS: [&str; 10] = [
    USER_ID,
    DAY,
    REPLAY,
    ILLEGAL_ITEMS,
    ILLEGAL_ITEMS_MARKED,
    LEGAL_ITEMS_MARKED,
    UNIQUE_TAPS,
    ILLEGAL1_MARK_TIME,
    TIME_IN_SCANNER,
    FIRST_LEGAL_TAP_TIME,
];

/// What one stage read and wrote
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    pub input: PathBuf,
    pub outputs: Vec<PathBuf>,
    pub log: PathBuf,
    /// Rows and users of the stage's main output table
    pub counts: TableCounts,
}

fn load(path: &Path) -> Result<Table, PipelineError> {
    let table = Table::read_csv(path)?;
    if table.is_empty() {
        return Err(PipelineError::EmptyTable(path.display().to_string()));
    }
    tracing::debug!(path = %path.display(), rows = table.n_rows(), "table loaded");
    Ok(table)
}

/// Eligibility filters, outcome labels and response-time cleanup
pub fn run_prep(paths: &PathConfig, study: &StudyConfig) -> Result<StageReport, PipelineError> {
    let _span = tracing::info_span!("prep").entered();
    let input = paths.input_in(&paths.data_dir, RAW_TRIALS_FILE);
    let mut log = DecisionLog::new("prep");

    let mut table = load(&input)?;
    table.require(&RAW_COLUMNS)?;
    log.counts("Loaded raw trials", table.counts()?);

    let replays = drop_replays(&mut table)?;
    log.info(format!("Removed {replays} replayed trials."));
    filter_by_trial_counts(&mut table, study, &mut log)?;
    log.counts("After trial-count filter", table.counts()?);

    categorize_target_condition(&mut table)?;
    assign_trial_numbers(&mut table)?;
    label_outcomes(&mut table)?;
    select_response_times(&mut table)?;

    drop_sentinel_rt_users(&mut table, study, &mut log)?;
    let nulled = null_out_of_range_rt(&mut table, study)?;
    log.info(format!(
        "Set {nulled} RT values outside ({}, {}] to missing.",
        study.rt_min_exclusive, study.rt_max_inclusive
    ));
    add_log_rt(&mut table)?;

    let summary = summarize(&table)?;
    log.info(format!("Number of NaN RTs: {}", summary.missing_rt));
    log.info(format!("Total number of trials: {}", summary.trials));
    log.info(format!("Total number of users: {}", summary.users));
    log.info(format!("Number of hits: {}", summary.hits));
    log.info(format!(
        "Number of correct rejections: {}",
        summary.correct_rejections
    ));
    log.info(format!("Overall accuracy: {:.4}", summary.accuracy));

    std::fs::create_dir_all(&paths.output_dir)?;
    let output = paths.output(PREPARED_FILE);
    table.write_csv(&output)?;
    let log_path = paths.output(&timestamped_log_name(PREP_LOG_PREFIX));
    log.write_to(&log_path)?;

    Ok(StageReport {
        stage: "prep",
        input,
        outputs: vec![output],
        log: log_path,
        counts: table.counts()?,
    })
}

/// Recency counters, colour-match tracking and lookback projections
pub fn run_recency(paths: &PathConfig, _study: &StudyConfig) -> Result<StageReport, PipelineError> {
    let _span = tracing::info_span!("recency").entered();
    let input = paths.input_in(&paths.output_dir, PREPARED_FILE);
    let mut log = DecisionLog::new("recency");

    let mut table = load(&input)?;
    table.require(&[
        USER_ID,
        DAY,
        TRIAL_NUMBER,
        TRIAL_RESULT,
        ILLEGAL_ITEMS,
        ILLEGAL1_NAME,
        BAG_TYPE,
    ])?;
    log.counts("Loaded prepared trials", table.counts()?);

    // discovered before any colour-derived column exists
    let colors = ColorColumns::discover(table.column_names());
    log.info(format!(
        "Colour columns: illegal [{}], legal [{}].",
        colors.illegal.join(", "),
        colors.legal.join(", ")
    ));

    for event in RECENCY_EVENTS {
        add_recency_columns(&mut table, event)?;
    }
    add_color_match_columns(&mut table, &colors)?;
    for event in LOOKBACK_EVENTS {
        project_lookback(&mut table, event)?;
    }
    log.info(format!(
        "Added recency features for {} and lookback projections for {}.",
        RECENCY_EVENTS.join(", "),
        LOOKBACK_EVENTS.join(", ")
    ));

    let output = paths.output(RECENCY_FILE);
    table.write_csv(&output)?;
    let log_path = paths.output(&timestamped_log_name(RECENCY_LOG_PREFIX));
    log.write_to(&log_path)?;

    Ok(StageReport {
        stage: "recency",
        input,
        outputs: vec![output],
        log: log_path,
        counts: table.counts()?,
    })
}

/// Cohort filter chain. Writes the individual metrics, the feature table and
/// the model-ready table.
pub fn run_cohort(paths: &PathConfig, study: &StudyConfig) -> Result<StageReport, PipelineError> {
    let _span = tracing::info_span!("cohort").entered();
    let input = paths.input_in(&paths.output_dir, RECENCY_FILE);
    let mut log = DecisionLog::new("cohort");

    let table = load(&input)?;
    let difficulty = load(&paths.output(DIFFICULTY_FILE))?;
    let cohort = build_cohort(table, &difficulty, study, &mut log)?;

    let metrics_path = paths.output(INDIVIDUAL_METRICS_FILE);
    cohort.metrics.write_csv(&metrics_path)?;
    log.info(format!("Saved individual metrics to '{INDIVIDUAL_METRICS_FILE}'."));

    let features_path = paths.output(FEATURES_FILE);
    cohort.features.write_csv(&features_path)?;
    log.info(format!(
        "Saved intermediate table, before hit filtering and NA removal, to '{FEATURES_FILE}'."
    ));

    let model_input_path = paths.output(MODEL_INPUT_FILE);
    cohort.model_input.write_csv(&model_input_path)?;
    log.info(format!("Saved final cleaned table to '{MODEL_INPUT_FILE}'."));

    let log_path = paths.output(&timestamped_log_name(COHORT_LOG_PREFIX));
    log.write_to(&log_path)?;

    Ok(StageReport {
        stage: "cohort",
        input,
        outputs: vec![metrics_path, features_path, model_input_path],
        log: log_path,
        counts: cohort.model_input.counts()?,
    })
}

/// Full model of a family with every comparison that could be made
struct FamilyFit {
    full: FittedModel,
    comparisons: Vec<Comparison>,
    failures: Vec<ModelFailure>,
}

/// Fit the full model, then each reduced model in isolation. A reduced model
/// that fails to fit or compare is logged and skipped.
fn fit_family(
    table: &Table,
    family: &ModelFamily,
    method: FitMethod,
    log: &mut DecisionLog,
) -> Result<FamilyFit, PipelineError> {
    log.info(format!("Fitting full model ({method}): {}", family.full.formula()));
    let full = match fit(table, &family.full, method) {
        Ok(model) => model,
        Err(source) => {
            log.error(format!("Critical error with full model setup: {source}"));
            return Err(PipelineError::ModelFit {
                name: family.full.name.clone(),
                source,
            });
        }
    };
    log.info(format!(
        "Full model: llf={:.4}, k={}, n={}, groups={}, BIC={:.4}",
        full.llf,
        full.k,
        full.n_obs,
        full.n_groups,
        bic(&full)
    ));

    let mut comparisons = Vec::new();
    let mut failures = Vec::new();
    for spec in &family.reduced {
        let compared = fit(table, spec, method)
            .map_err(|e| format!("Error fitting model '{}': {e}", spec.name))
            .and_then(|reduced| {
                likelihood_ratio_test(&full, &reduced)
                    .map_err(|e| format!("Error comparing model '{}': {e}", spec.name))
            });
        match compared {
            Ok(c) => {
                log.info(format!(
                    "LRT for {}: Stat={:.4}, df={}, p-value={:.6}; BIC: {:.4}",
                    c.name, c.lr_stat, c.df, c.p_value, c.bic
                ));
                comparisons.push(c);
            }
            Err(message) => {
                log.error(message.clone());
                failures.push(ModelFailure {
                    name: spec.name.clone(),
                    error: message,
                });
            }
        }
    }

    Ok(FamilyFit {
        full,
        comparisons,
        failures,
    })
}

/// Fitted values and residuals aligned to the table; rows left out of the
/// fit stay missing
fn append_fit_columns(table: &mut Table, model: &FittedModel) -> Result<(), PipelineError> {
    let mut fitted = vec![None; table.n_rows()];
    let mut residuals = vec![None; table.n_rows()];
    for ((&row, &f), &r) in model.rows.iter().zip(&model.fitted).zip(&model.residuals) {
        fitted[row] = Some(f);
        residuals[row] = Some(r);
    }
    table.set_numbers(FITTED_VALUES, fitted)?;
    table.set_numbers(RESIDUALS, residuals)
}

struct ArtifactPaths {
    summary: PathBuf,
    model: PathBuf,
    results: PathBuf,
}

fn run_family(
    stage: &'static str,
    table: &Table,
    family: &ModelFamily,
    study: &StudyConfig,
    log: &mut DecisionLog,
    log_path: &Path,
    artifacts: &ArtifactPaths,
) -> Result<FittedModel, PipelineError> {
    let fitted = match fit_family(table, family, study.fit_method, log) {
        Ok(fitted) => fitted,
        Err(e) => {
            log.write_to(log_path)?;
            return Err(e);
        }
    };

    let encoder = ArtifactEncoder::new();
    tracing::debug!(stage, instance_id = encoder.instance_id(), "writing model artifacts");
    encoder
        .encode(&family.full, &fitted.full, fitted.comparisons, fitted.failures)
        .write(&artifacts.summary, &artifacts.model, &artifacts.results)?;
    Ok(fitted.full)
}

/// Raw trial-history factor models
pub fn run_raw_factor_models(
    paths: &PathConfig,
    study: &StudyConfig,
) -> Result<StageReport, PipelineError> {
    let _span = tracing::info_span!("raw_factor_models").entered();
    let input = paths.input_in(&paths.output_dir, MODEL_INPUT_FILE);
    let log_path = paths.output(RAW_MODEL_LOG_FILE);
    let mut log = DecisionLog::new("raw_factor_models");

    let mut table = load(&input)?;
    log.counts("Loaded model input", table.counts()?);
    let family = match raw_factor_family(&table) {
        Ok(family) => family,
        Err(source) => {
            log.error(format!("Critical error with full model setup: {source}"));
            log.write_to(&log_path)?;
            return Err(PipelineError::ModelFit {
                name: "Full Model".to_string(),
                source,
            });
        }
    };
    if let Some(Term::Categorical {
        levels: Levels::Explicit(order),
        ..
    }) = family.full.terms.iter().find(|t| t.columns() == [ILLEGAL1_NAME])
    {
        log.info(format!("Target difficulty order: {}", order.join(", ")));
    }

    let artifacts = ArtifactPaths {
        summary: paths.output(RAW_MODEL_SUMMARY_FILE),
        model: paths.output(RAW_MODEL_FILE),
        results: paths.output(RAW_MODEL_RESULTS_FILE),
    };
    let full = run_family(
        "raw_factor_models",
        &table,
        &family,
        study,
        &mut log,
        &log_path,
        &artifacts,
    )?;

    append_fit_columns(&mut table, &full)?;
    let residuals_path = paths.output(FITTED_RESIDUALS_FILE);
    table.write_csv(&residuals_path)?;
    log.info(format!(
        "Saved fitted values and residuals to '{FITTED_RESIDUALS_FILE}'."
    ));
    log.write_to(&log_path)?;

    Ok(StageReport {
        stage: "raw_factor_models",
        input,
        outputs: vec![
            artifacts.summary,
            artifacts.model,
            artifacts.results,
            residuals_path,
        ],
        log: log_path,
        counts: table.counts()?,
    })
}

/// Binary split factor models
pub fn run_binary_factor_models(
    paths: &PathConfig,
    study: &StudyConfig,
) -> Result<StageReport, PipelineError> {
    let _span = tracing::info_span!("binary_factor_models").entered();
    let input = paths.input_in(&paths.output_dir, MODEL_INPUT_FILE);
    let log_path = paths.output(BINARY_MODEL_LOG_FILE);
    let mut log = DecisionLog::new("binary_factor_models");

    let table = load(&input)?;
    log.counts("Loaded model input", table.counts()?);

    let family = binary_factor_family();
    let artifacts = ArtifactPaths {
        summary: paths.output(BINARY_MODEL_SUMMARY_FILE),
        model: paths.output(BINARY_MODEL_FILE),
        results: paths.output(BINARY_MODEL_RESULTS_FILE),
    };
    run_family(
        "binary_factor_models",
        &table,
        &family,
        study,
        &mut log,
        &log_path,
        &artifacts,
    )?;
    log.write_to(&log_path)?;

    Ok(StageReport {
        stage: "binary_factor_models",
        input,
        outputs: vec![artifacts.summary, artifacts.model, artifacts.results],
        log: log_path,
        counts: table.counts()?,
    })
}

/// Every stage in order. An input-file override applies to the first stage
/// only; later stages read their predecessor's output.
pub fn run_all(paths: &PathConfig, study: &StudyConfig) -> Result<Vec<StageReport>, PipelineError> {
    let chained = PathConfig {
        input_file: None,
        ..paths.clone()
    };
    Ok(vec![
        run_prep(paths, study)?,
        run_recency(&chained, study)?,
        run_cohort(&chained, study)?,
        run_raw_factor_models(&chained, study)?,
        run_binary_factor_models(&chained, study)?,
    ])
}
