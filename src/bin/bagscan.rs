//! Bagscan CLI - run pipeline stages from the command line
//!
//! Commands:
//! - prep, recency, cohort: data stages
//! - raw-models, binary-models: model families
//! - all: every stage in order
//! - check: report configuration and which stage inputs exist

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use bagscan::config::{
    PathConfig, StudyConfig, DATA_PATH_ENV, DEFAULT_DATA_PATH, DEFAULT_OUTPUT_PATH,
    DIFFICULTY_FILE, INPUT_FILE_ENV, MODEL_INPUT_FILE, OUTPUT_PATH_ENV, PREPARED_FILE,
    RAW_TRIALS_FILE, RECENCY_FILE,
};
use bagscan::{pipeline, PipelineError, StageReport, VERSION};
use tracing_subscriber::EnvFilter;

/// Bagscan - bag-scanning trial pipeline
#[derive(Parser)]
#[command(name = "bagscan")]
#[command(version = VERSION)]
#[command(about = "Label, filter and model bag-scanning trial data", long_about = None)]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,

    /// Study constants as JSON; omitted fields keep their defaults
    #[arg(long, global = true)]
    study_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PathArgs {
    /// Directory holding the raw trial log
    #[arg(long, global = true, env = DATA_PATH_ENV, default_value = DEFAULT_DATA_PATH)]
    data_path: PathBuf,

    /// Directory for every stage output
    #[arg(long, global = true, env = OUTPUT_PATH_ENV, default_value = DEFAULT_OUTPUT_PATH)]
    output_path: PathBuf,

    /// Input file name replacing the stage's default
    #[arg(long, global = true, env = INPUT_FILE_ENV)]
    input_file: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Eligibility, outcome labels and response times
    Prep,
    /// Recency, colour-match and lookback features
    Recency,
    /// Cohort filters, individual metrics and analysis features
    Cohort,
    /// Raw trial-history factor models
    RawModels,
    /// Binary split factor models
    BinaryModels,
    /// Every stage in order
    All,
    /// Report configuration and which stage inputs exist
    Check,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn run(cli: Cli) -> Result<(), PipelineError> {
    let paths = PathConfig {
        data_dir: cli.paths.data_path,
        output_dir: cli.paths.output_path,
        input_file: cli.paths.input_file.filter(|f| !f.is_empty()),
    };
    let study = match &cli.study_config {
        Some(path) => StudyConfig::from_json_file(path)?,
        None => StudyConfig::default(),
    };
    study.validate()?;

    let reports = match cli.command {
        Commands::Prep => vec![pipeline::run_prep(&paths, &study)?],
        Commands::Recency => vec![pipeline::run_recency(&paths, &study)?],
        Commands::Cohort => vec![pipeline::run_cohort(&paths, &study)?],
        Commands::RawModels => vec![pipeline::run_raw_factor_models(&paths, &study)?],
        Commands::BinaryModels => vec![pipeline::run_binary_factor_models(&paths, &study)?],
        Commands::All => pipeline::run_all(&paths, &study)?,
        Commands::Check => return cmd_check(&paths, &study),
    };
    print_reports(&reports)
}

fn print_reports(reports: &[StageReport]) -> Result<(), PipelineError> {
    for report in reports {
        println!("{}", serde_json::to_string(report)?);
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct InputCheck {
    stage: &'static str,
    path: PathBuf,
    exists: bool,
}

fn cmd_check(paths: &PathConfig, study: &StudyConfig) -> Result<(), PipelineError> {
    let inputs = [
        ("prep", paths.input_in(&paths.data_dir, RAW_TRIALS_FILE)),
        ("recency", paths.input_in(&paths.output_dir, PREPARED_FILE)),
        ("cohort", paths.input_in(&paths.output_dir, RECENCY_FILE)),
        ("cohort", paths.output(DIFFICULTY_FILE)),
        ("models", paths.input_in(&paths.output_dir, MODEL_INPUT_FILE)),
    ];
    let checks: Vec<InputCheck> = inputs
        .into_iter()
        .map(|(stage, path)| InputCheck {
            stage,
            exists: path.exists(),
            path,
        })
        .collect();

    let report = serde_json::json!({
        "version": VERSION,
        "data_path": paths.data_dir,
        "output_path": paths.output_dir,
        "input_file": paths.input_file,
        "fit_method": study.fit_method,
        "inputs": checks,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<PipelineError> for CliError {
    fn from(e: PipelineError) -> Self {
        let (code, hint) = match &e {
            PipelineError::Io(_) => ("IO_ERROR", Some("Check file paths and permissions")),
            PipelineError::Csv(_) => ("CSV_ERROR", Some("Check the input is well-formed CSV")),
            PipelineError::JsonError(_) => ("JSON_ERROR", Some("Check JSON syntax")),
            PipelineError::MissingFile(_) => (
                "MISSING_FILE",
                Some("Run the previous stage or set --data-path / --output-path"),
            ),
            PipelineError::MissingColumn(_) | PipelineError::ColumnLength { .. } => {
                ("SCHEMA_ERROR", Some("Ensure the input came from the previous stage"))
            }
            PipelineError::InvalidConfig(_) => {
                ("CONFIG_ERROR", Some("Check the --study-config file"))
            }
            PipelineError::EmptyTable(_) => ("EMPTY_TABLE", None),
            PipelineError::ModelFit { .. } => (
                "MODEL_FIT_ERROR",
                Some("See the model analysis log in the output directory"),
            ),
        };
        CliError {
            code: code.to_string(),
            message: e.to_string(),
            hint: hint.map(str::to_string),
        }
    }
}
