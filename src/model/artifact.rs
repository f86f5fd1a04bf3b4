//! Model artifacts
//!
//! Encodes a fitted model into a plain-text summary, a model description
//! document and a results document. Both JSON documents carry producer and
//! provenance metadata.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use uuid::Uuid;

use super::compare::{aic, bic, Comparison};
use super::design::ModelSpec;
use super::lmm::FittedModel;
use super::FitMethod;
use crate::error::PipelineError;
use crate::{PRODUCER_NAME, VERSION};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub name: String,
    pub version: String,
    pub instance_id: String,
}

/// What was fitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescription {
    pub producer: Producer,
    pub computed_at_utc: String,
    pub name: String,
    pub formula: String,
    pub method: FitMethod,
    pub response: String,
    pub group: String,
    pub terms: Vec<String>,
    pub param_names: Vec<String>,
}

/// A model that could not be fitted or compared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFailure {
    pub name: String,
    pub error: String,
}

/// What came out of the fit, with every comparison against it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResults {
    pub producer: Producer,
    pub computed_at_utc: String,
    pub model: FittedModel,
    pub bic: f64,
    pub aic: f64,
    pub comparisons: Vec<Comparison>,
    pub failures: Vec<ModelFailure>,
}

#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub summary: String,
    pub description: ModelDescription,
    pub results: ModelResults,
}

impl ModelArtifacts {
    /// Write the summary and both JSON documents
    pub fn write(
        &self,
        summary_path: &Path,
        model_path: &Path,
        results_path: &Path,
    ) -> Result<(), PipelineError> {
        std::fs::write(summary_path, &self.summary)?;
        std::fs::write(model_path, serde_json::to_string_pretty(&self.description)?)?;
        std::fs::write(results_path, serde_json::to_string_pretty(&self.results)?)?;
        Ok(())
    }
}

/// Artifact encoder with a per-run instance ID
pub struct ArtifactEncoder {
    instance_id: String,
}

impl Default for ArtifactEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactEncoder {
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_instance_id(instance_id: String) -> Self {
        Self { instance_id }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn producer(&self) -> Producer {
        Producer {
            name: PRODUCER_NAME.to_string(),
            version: VERSION.to_string(),
            instance_id: self.instance_id.clone(),
        }
    }

    pub fn encode(
        &self,
        spec: &ModelSpec,
        model: &FittedModel,
        comparisons: Vec<Comparison>,
        failures: Vec<ModelFailure>,
    ) -> ModelArtifacts {
        let computed_at_utc = Utc::now().to_rfc3339();
        let description = ModelDescription {
            producer: self.producer(),
            computed_at_utc: computed_at_utc.clone(),
            name: spec.name.clone(),
            formula: spec.formula(),
            method: model.method,
            response: spec.response.clone(),
            group: spec.group.clone(),
            terms: spec.term_labels(),
            param_names: model.params.iter().map(|p| p.name.clone()).collect(),
        };
        let results = ModelResults {
            producer: self.producer(),
            computed_at_utc,
            model: model.clone(),
            bic: bic(model),
            aic: aic(model),
            comparisons,
            failures,
        };
        ModelArtifacts {
            summary: render_summary(model),
            description,
            results,
        }
    }
}

/// Regression table in the usual mixed-model summary layout
pub fn render_summary(model: &FittedModel) -> String {
    let name_width = model
        .params
        .iter()
        .map(|p| p.name.len())
        .chain(std::iter::once("Group Var".len()))
        .max()
        .unwrap_or(0);
    let width = name_width + 58;
    let heavy = "=".repeat(width);
    let light = "-".repeat(width);
    let response = model.formula.split(" ~ ").next().unwrap_or_default();

    let mut out = String::new();
    let _ = writeln!(out, "{:^width$}", "Mixed Linear Model Regression Results");
    let _ = writeln!(out, "{heavy}");
    let rows = [
        ("Model:", "MixedLM".to_string(), "Dependent Variable:", response.to_string()),
        ("No. Observations:", model.n_obs.to_string(), "Method:", model.method.to_string()),
        ("No. Groups:", model.n_groups.to_string(), "Scale:", format!("{:.4}", model.scale)),
        (
            "Min. group size:",
            model.min_group_size.to_string(),
            "Log-Likelihood:",
            format!("{:.4}", model.llf),
        ),
        (
            "Max. group size:",
            model.max_group_size.to_string(),
            "Group variance at boundary:",
            if model.boundary { "Yes" } else { "No" }.to_string(),
        ),
        (
            "Mean group size:",
            format!("{:.1}", model.mean_group_size),
            "",
            String::new(),
        ),
    ];
    for (l1, v1, l2, v2) in rows {
        let _ = writeln!(out, "{l1:<18}{v1:<16}{l2:<28}{v2}");
    }
    let _ = writeln!(out, "{light}");
    let _ = writeln!(
        out,
        "{:<name_width$} {:>10} {:>9} {:>8} {:>6} {:>10} {:>10}",
        "", "Coef.", "Std.Err.", "z", "P>|z|", "[0.025", "0.975]"
    );
    let _ = writeln!(out, "{light}");
    for p in &model.params {
        let _ = writeln!(
            out,
            "{:<name_width$} {:>10.3} {:>9.3} {:>8.3} {:>6.3} {:>10.3} {:>10.3}",
            p.name, p.coef, p.std_err, p.z, p.p_value, p.ci_lower, p.ci_upper
        );
    }
    let _ = writeln!(out, "{:<name_width$} {:>10.3}", "Group Var", model.group_var);
    let _ = writeln!(out, "{heavy}");
    let _ = writeln!(out, "Formula: {}", model.formula);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::lmm::Estimate;

    fn sample_model() -> FittedModel {
        FittedModel {
            name: "Full Model".to_string(),
            formula: "RT ~ avg_hit_RT + (1|UserId)".to_string(),
            method: FitMethod::Reml,
            params: vec![
                Estimate {
                    name: "Intercept".to_string(),
                    coef: 512.25,
                    std_err: 10.0,
                    z: 51.225,
                    p_value: 0.0,
                    ci_lower: 492.65,
                    ci_upper: 531.85,
                },
                Estimate {
                    name: "avg_hit_RT".to_string(),
                    coef: 0.5,
                    std_err: 0.1,
                    z: 5.0,
                    p_value: 0.0,
                    ci_lower: 0.3,
                    ci_upper: 0.7,
                },
            ],
            group_var: 100.0,
            scale: 2500.0,
            llf: -1234.5,
            k: 3,
            n_obs: 240,
            n_groups: 10,
            min_group_size: 24,
            max_group_size: 24,
            mean_group_size: 24.0,
            boundary: false,
            random_effects: Vec::new(),
            rows: vec![0, 1],
            fitted: vec![1.0, 2.0],
            residuals: vec![0.0, 0.0],
        }
    }

    #[test]
    fn test_summary_lists_every_parameter() {
        let summary = render_summary(&sample_model());
        assert!(summary.contains("Mixed Linear Model Regression Results"));
        assert!(summary.contains("Dependent Variable:"));
        assert!(summary.contains("REML"));
        assert!(summary.contains("avg_hit_RT"));
        assert!(summary.contains("512.250"));
        assert!(summary.contains("Group Var"));
        assert!(summary.ends_with("Formula: RT ~ avg_hit_RT + (1|UserId)\n"));
    }

    #[test]
    fn test_encode_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = ArtifactEncoder::with_instance_id("run-1".to_string());
        let spec = crate::model::ModelSpec::new(
            "Full Model",
            "RT",
            vec![crate::model::Term::continuous("avg_hit_RT")],
            "UserId",
        );
        let artifacts = encoder.encode(
            &spec,
            &sample_model(),
            Vec::new(),
            vec![ModelFailure {
                name: "Without avg_hit_RT".to_string(),
                error: "Normal equations are singular or not positive definite".to_string(),
            }],
        );
        assert_eq!(artifacts.description.param_names, vec!["Intercept", "avg_hit_RT"]);
        assert_eq!(artifacts.results.producer.instance_id, "run-1");

        let (summary, model, results) = (
            dir.path().join("summary.txt"),
            dir.path().join("model.json"),
            dir.path().join("results.json"),
        );
        artifacts.write(&summary, &model, &results).unwrap();

        let reread: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&results).unwrap()).unwrap();
        assert_eq!(reread["model"]["n_obs"], 240);
        assert_eq!(reread["failures"][0]["name"], "Without avg_hit_RT");
        // per-row vectors stay out of the results document
        assert!(reread["model"].get("fitted").is_none());
        let description: ModelDescription =
            serde_json::from_str(&std::fs::read_to_string(&model).unwrap()).unwrap();
        assert_eq!(description.method, FitMethod::Reml);
    }
}
