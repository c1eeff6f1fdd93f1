//! Phase 1: domain analysis.
//!
//! One reasoning call breaks the subject into research subdomains. The run
//! then stops at `phase_1_complete` until an operator confirms which
//! subdomains to research.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::errors::JobError;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::parse::parse_json;
use crate::pipeline::prompts;
use crate::store::{Phase, RunStatus, RunUpdate};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subdomain {
    pub name: String,
    #[serde(default)]
    pub colloquial: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub subdomains: Vec<Subdomain>,
    #[serde(default)]
    pub critical_variables: Vec<Value>,
    #[serde(default)]
    pub baseline_definition: Option<Value>,
    #[serde(default)]
    pub risk_factors: Vec<Value>,
    /// Set when the response could not be used and the single-unit
    /// fallback was substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DomainAnalysis {
    /// Conservative plan: research the subject as one unit.
    pub fn fallback(subject: &str, error: String) -> Self {
        Self {
            summary: subject.to_string(),
            subdomains: vec![Subdomain {
                name: subject.to_string(),
                colloquial: None,
                priority: Some("high".into()),
            }],
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Parse the reasoning response, falling back to a single unit named after
/// the subject when it is unusable.
pub fn analyse(raw: &str, subject: &str) -> DomainAnalysis {
    match parse_json::<DomainAnalysis>(raw) {
        Ok(mut analysis) => {
            analysis.subdomains.retain(|s| !s.name.trim().is_empty());
            if analysis.subdomains.is_empty() {
                DomainAnalysis::fallback(subject, "response listed no subdomains".into())
            } else {
                analysis
            }
        }
        Err(e) => DomainAnalysis::fallback(subject, e.to_string()),
    }
}

/// Candidate unit names recorded by phase 1, in order, without duplicates.
pub fn subdomain_names(phase_results: &Map<String, Value>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let listed = phase_results
        .get(Phase::DomainAnalysis.key())
        .and_then(|a| a.get("subdomains"))
        .and_then(|s| s.as_array());
    for entry in listed.into_iter().flatten() {
        if let Some(name) = entry.get("name").and_then(|n| n.as_str()) {
            let name = name.trim();
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

pub async fn run(ctx: &PipelineContext, run_id: i64) -> Result<(), JobError> {
    let Some(run) = ctx.begin_phase(run_id, Phase::DomainAnalysis).await? else {
        return Ok(());
    };

    let raw = ctx.invoke_json(&prompts::domain_analysis(&run)).await?;
    let analysis = analyse(&raw, &run.subject);
    if let Some(error) = &analysis.error {
        warn!(run_id, error = %error, "domain analysis fell back to a single unit");
    }
    let subdomains = analysis.subdomains.len();
    let result = serde_json::to_value(&analysis).map_err(|e| JobError::Fatal(e.to_string()))?;

    ctx.records
        .finish_phase(
            run_id,
            RunUpdate::status(RunStatus::PhaseComplete)
                .with_phase(Phase::DomainAnalysis.number())
                .with_result(Phase::DomainAnalysis, result),
            None,
        )
        .await?;
    info!(run_id, subdomains, "domain analysis complete, awaiting confirmation");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_analyse_reads_subdomains() {
        let raw = r#"{"summary": "Pharmacy demand", "subdomains": [
            {"name": "regulation", "colloquial": "rules", "priority": "high"},
            {"name": "climate"}
        ], "critical_variables": ["stock level", {"name": "price"}]}"#;
        let analysis = analyse(raw, "pharmacy");
        assert!(analysis.error.is_none());
        assert_eq!(analysis.subdomains.len(), 2);
        assert_eq!(analysis.subdomains[0].colloquial.as_deref(), Some("rules"));
        assert_eq!(analysis.critical_variables.len(), 2);
    }

    #[test]
    fn test_analyse_falls_back_on_garbage() {
        let analysis = analyse("the model refused", "Pharmacy demand");
        assert_eq!(analysis.subdomains.len(), 1);
        assert_eq!(analysis.subdomains[0].name, "Pharmacy demand");
        assert!(analysis.error.is_some());
    }

    #[test]
    fn test_analyse_falls_back_when_no_named_subdomains() {
        let analysis = analyse(r#"{"summary": "x", "subdomains": [{"name": "  "}]}"#, "s");
        assert_eq!(analysis.subdomains[0].name, "s");
        assert_eq!(
            analysis.error.as_deref(),
            Some("response listed no subdomains")
        );
    }

    #[test]
    fn test_subdomain_names_dedupes_in_order() {
        let mut results = Map::new();
        results.insert(
            "domain_analysis".into(),
            json!({"subdomains": [{"name": "b"}, {"name": "a"}, {"name": "b"}, {"other": 1}]}),
        );
        assert_eq!(subdomain_names(&results), vec!["b", "a"]);
        assert!(subdomain_names(&Map::new()).is_empty());
    }
}
