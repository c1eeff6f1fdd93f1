//! Phase 7: synthesis and the dashboard.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::assessment;
use super::credibility;
use super::research::number;
use crate::errors::JobError;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::parse::parse_json;
use crate::pipeline::prompts;
use crate::store::{BuildVerdict, Phase, Run, RunStatus, RunUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelVerdict {
    Valid,
    NotReliableYet,
}

impl ModelVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "VALID",
            Self::NotReliableYet => "NOT_RELIABLE_YET",
        }
    }
}

/// A proposed `VALID` stands only with a usable build and at least one
/// Alpha or Beta signal.
pub fn accept_verdict(proposed: ModelVerdict, build: Option<BuildVerdict>, strong_signals: u64) -> ModelVerdict {
    let backed = build.is_some_and(|b| b.is_usable()) && strong_signals > 0;
    if proposed == ModelVerdict::Valid && backed {
        ModelVerdict::Valid
    } else {
        ModelVerdict::NotReliableYet
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSynthesis {
    #[serde(default)]
    hypotheses: Vec<Value>,
    #[serde(default)]
    verdict: Option<String>,
    #[serde(default)]
    next_actions: Vec<Value>,
    #[serde(default)]
    missing_data: Vec<Value>,
}

/// Hypotheses with confidence held under the cap.
fn capped_hypotheses(hypotheses: Vec<Value>, cap: f64) -> Vec<Value> {
    hypotheses
        .into_iter()
        .map(|mut h| {
            if let Some(confidence) = number(h.get("confidence"))
                && let Some(obj) = h.as_object_mut()
            {
                obj.insert("confidence".into(), json!(confidence.clamp(0.0, cap)));
            }
            h
        })
        .collect()
}

/// Evidence handed to the synthesis prompt: the earlier phase outputs that
/// matter, without the bulky research payloads.
fn evidence(run: &Run) -> Value {
    let pick = |phase: Phase| run.phase_results.get(phase.key()).cloned().unwrap_or(Value::Null);
    json!({
        "domain": pick(Phase::DomainAnalysis).get("summary").cloned(),
        "gate": run.gate_status,
        "build_verdict": run.build_verdict,
        "confidence_cap": run.confidence_cap,
        "patterns": pick(Phase::PatternDetection),
        "backtesting": pick(Phase::Backtesting),
    })
}

/// Dashboard computed from the stored run; no reasoning involved.
pub fn dashboard(run: &Run, verdict: ModelVerdict, hypotheses: usize) -> Value {
    let patterns = run.phase_results.get(Phase::PatternDetection.key());
    json!({
        "subject": run.subject,
        "model_verdict": verdict.as_str(),
        "build_verdict": run.build_verdict,
        "gate_status": run.gate_status,
        "confidence_cap": run.confidence_cap,
        "layers": patterns.and_then(|p| p.get("layers")).cloned().unwrap_or_else(|| json!([])),
        "signals_total": patterns.and_then(|p| p.get("signals_total")).cloned().unwrap_or(json!(0)),
        "credibility": patterns
            .and_then(|p| p.get("credibility"))
            .and_then(|c| c.get("counts"))
            .cloned()
            .unwrap_or(Value::Null),
        "hypotheses": hypotheses,
        "sources_found": run.sources_found,
        "data_points": run.data_points,
        "variables_found": run.variables_found,
        "coverage_pct": run.coverage_pct,
    })
}

pub async fn run(ctx: &PipelineContext, run_id: i64) -> Result<(), JobError> {
    let Some(run) = ctx.begin_phase(run_id, Phase::Synthesis).await? else {
        return Ok(());
    };
    let cap = assessment::cap_of(&run);
    let raw = ctx.invoke_json(&prompts::synthesis(&run, &evidence(&run))).await?;
    let (parsed, error) = match parse_json::<RawSynthesis>(&raw) {
        Ok(parsed) => (parsed, None),
        Err(e) => {
            warn!(run_id, error = %e, "synthesis response unusable, recording no hypotheses");
            (RawSynthesis::default(), Some(e.to_string()))
        }
    };

    let proposed = match parsed.verdict.as_deref().map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("VALID") => ModelVerdict::Valid,
        _ => ModelVerdict::NotReliableYet,
    };
    let strong = credibility::strong_signal_count(run.phase_results.get(Phase::PatternDetection.key()));
    let verdict = accept_verdict(proposed, run.build_verdict, strong);
    if proposed != verdict {
        info!(run_id, strong, build = ?run.build_verdict, "proposed VALID verdict not backed, downgraded");
    }

    let hypotheses = capped_hypotheses(parsed.hypotheses, cap);
    let board = dashboard(&run, verdict, hypotheses.len());
    let mut result = json!({
        "hypotheses": hypotheses,
        "proposed_verdict": proposed.as_str(),
        "verdict": verdict.as_str(),
        "next_actions": parsed.next_actions,
        "missing_data": parsed.missing_data,
    });
    if let Some(error) = error {
        result["error"] = Value::String(error);
    }

    let update = RunUpdate {
        model_verdict: Some(verdict.as_str().to_string()),
        dashboard: Some(board),
        ..RunUpdate::status(RunStatus::Completed)
    }
    .with_phase(Phase::Synthesis.number())
    .with_result(Phase::Synthesis, result);
    ctx.records.finish_phase(run_id, update, None).await?;
    info!(run_id, verdict = verdict.as_str(), "run completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_needs_usable_build_and_strong_signal() {
        use BuildVerdict::*;
        use ModelVerdict::*;
        assert_eq!(accept_verdict(Valid, Some(GoodEnough), 1), Valid);
        assert_eq!(accept_verdict(Valid, Some(ProductionReady), 0), NotReliableYet);
        assert_eq!(accept_verdict(Valid, Some(Degraded), 3), NotReliableYet);
        assert_eq!(accept_verdict(Valid, None, 3), NotReliableYet);
        assert_eq!(accept_verdict(NotReliableYet, Some(ProductionReady), 3), NotReliableYet);
    }

    #[test]
    fn test_hypotheses_are_capped() {
        let capped = capped_hypotheses(
            vec![
                json!({"statement": "a", "confidence": 0.95}),
                json!({"statement": "b"}),
            ],
            0.6,
        );
        assert_eq!(capped[0]["confidence"], 0.6);
        assert!(capped[1].get("confidence").is_none());
    }
}
