//! Phase 5: pattern detection, followed by the credibility step.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::assessment;
use super::credibility;
use super::research::{number, text};
use crate::errors::{JobError, ParseError};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::parse::parse_json;
use crate::pipeline::prompts::{self, SIGNAL_LAYERS};
use crate::store::{JobType, NewJob, NewSignal, Phase, RunStatus, RunUpdate};

#[derive(Debug, Deserialize)]
struct RawLayers {
    #[serde(default)]
    layers: Vec<Value>,
}

/// Layer names indexed 1..=5; unknown ids keep whatever name was sent.
fn layer_name(layer_id: i64, sent: Option<String>) -> String {
    usize::try_from(layer_id - 1)
        .ok()
        .and_then(|i| SIGNAL_LAYERS.get(i))
        .map(|s| s.to_string())
        .or(sent)
        .unwrap_or_else(|| format!("layer_{}", layer_id))
}

/// Flatten the layered response into signals with confidence clamped to `cap`.
pub fn parse_signals(raw: &str, cap: f64) -> Result<Vec<NewSignal>, ParseError> {
    let parsed: RawLayers = parse_json(raw)?;
    let mut signals = Vec::new();
    for (position, layer) in parsed.layers.iter().enumerate() {
        let layer_id = number(layer.get("layer_id"))
            .map(|n| n as i64)
            .unwrap_or(position as i64 + 1);
        let layer_name = layer_name(layer_id, text(layer.get("layer_name")));
        let entries = layer.get("signals").and_then(|s| s.as_array());
        for entry in entries.into_iter().flatten() {
            let Some(name) = text(entry.get("name")) else {
                continue;
            };
            signals.push(NewSignal {
                layer_id,
                layer_name: layer_name.clone(),
                name,
                description: text(entry.get("description")).unwrap_or_default(),
                confidence: number(entry.get("confidence"))
                    .unwrap_or(0.0)
                    .clamp(0.0, cap),
                impact: text(entry.get("impact")).unwrap_or_else(|| "unknown".into()),
                trend: text(entry.get("trend")).unwrap_or_else(|| "unknown".into()),
                devil_advocate: text(entry.get("devil_advocate")),
                data_source: text(entry.get("data_source")),
            });
        }
    }
    Ok(signals)
}

fn layers_summary(signals: &[NewSignal]) -> Vec<Value> {
    let mut by_layer: BTreeMap<i64, (String, usize, f64)> = BTreeMap::new();
    for signal in signals {
        let entry = by_layer
            .entry(signal.layer_id)
            .or_insert_with(|| (signal.layer_name.clone(), 0, 0.0));
        entry.1 += 1;
        entry.2 = entry.2.max(signal.confidence);
    }
    by_layer
        .into_iter()
        .map(|(id, (name, count, top))| {
            json!({ "layer_id": id, "layer_name": name, "signals": count, "max_confidence": top })
        })
        .collect()
}

pub async fn run(ctx: &PipelineContext, run_id: i64) -> Result<(), JobError> {
    let Some(run) = ctx.begin_phase(run_id, Phase::PatternDetection).await? else {
        return Ok(());
    };
    let cap = assessment::cap_of(&run);
    let variables = ctx.db.call(move |db| db.list_variable_names(run_id)).await?;
    let prompt = prompts::pattern_detection(
        &run,
        run.phase_results.get(Phase::DomainAnalysis.key()),
        &variables,
        cap,
    );
    let raw = ctx.invoke_json(&prompt).await?;
    let (signals, error) = match parse_signals(&raw, cap) {
        Ok(signals) => (signals, None),
        Err(e) => {
            warn!(run_id, error = %e, "pattern detection response unusable, recording no signals");
            (Vec::new(), Some(e.to_string()))
        }
    };
    let layers = layers_summary(&signals);

    let stored = ctx
        .db
        .call(move |db| db.replace_signals(run_id, &signals, Utc::now()))
        .await?;
    let credibility = credibility::assess(ctx, &run, &stored).await;

    let mut result = json!({
        "confidence_cap": cap,
        "signals_total": stored.len(),
        "layers": layers,
        "credibility": credibility,
    });
    if let Some(error) = error {
        result["error"] = Value::String(error);
    }

    ctx.records
        .finish_phase(
            run_id,
            RunUpdate::status(RunStatus::PhaseComplete)
                .with_phase(Phase::PatternDetection.number())
                .with_result(Phase::PatternDetection, result),
            Some(NewJob::phase(run_id, JobType::Backtesting)),
        )
        .await?;
    info!(run_id, signals = stored.len(), "pattern detection complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signals_clamps_to_cap() {
        let raw = r#"{"layers": [
            {"layer_id": 1, "signals": [
                {"name": "flu season", "confidence": 0.95, "devil_advocate": "mild winters"},
                {"description": "nameless"}
            ]},
            {"layer_id": 3, "layer_name": "whatever", "signals": [{"name": "stock outs", "confidence": "0.4"}]}
        ]}"#;
        let signals = parse_signals(raw, 0.7).unwrap();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].confidence, 0.7);
        assert_eq!(signals[0].layer_name, SIGNAL_LAYERS[0]);
        assert_eq!(signals[0].devil_advocate.as_deref(), Some("mild winters"));
        assert_eq!(signals[1].confidence, 0.4);
        assert_eq!(signals[1].layer_name, SIGNAL_LAYERS[2]);
    }

    #[test]
    fn test_unknown_layer_keeps_sent_name() {
        let raw = r#"{"layers": [{"layer_id": 9, "layer_name": "extra", "signals": [{"name": "x"}]}]}"#;
        let signals = parse_signals(raw, 1.0).unwrap();
        assert_eq!(signals[0].layer_name, "extra");
        assert_eq!(signals[0].impact, "unknown");
    }

    #[test]
    fn test_layers_summary_groups() {
        let raw = r#"{"layers": [{"layer_id": 2, "signals": [{"name": "a", "confidence": 0.3}, {"name": "b", "confidence": 0.5}]}]}"#;
        let summary = layers_summary(&parse_signals(raw, 1.0).unwrap());
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0]["signals"], 2);
        assert_eq!(summary[0]["max_confidence"], 0.5);
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(parse_signals("no layers today", 0.7).is_err());
    }
}
