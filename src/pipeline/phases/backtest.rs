//! Phase 6: backtesting estimates and the economic impact step.
//!
//! Both are reasoning-service estimates and are stored as advisory. The
//! economic step picks sector parameters from the routing rule table.

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::errors::JobError;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::parse::parse_json;
use crate::pipeline::prompts;
use crate::pipeline::routing::{Routed, Sector, sector_table};
use crate::store::{JobType, NewJob, Phase, Run, RunStatus, RunUpdate, SignalRecord};

pub const DISCLAIMER: &str =
    "Estimated by the reasoning service from public information; not computed from historical data.";

/// Backtest response parsed loosely; anything unusable becomes `{"error"}`.
pub fn backtest_result(raw: &str) -> Value {
    match parse_json::<Value>(raw) {
        Ok(Value::Object(mut map)) => {
            map.insert("advisory".into(), Value::Bool(true));
            map.insert("disclaimer".into(), Value::String(DISCLAIMER.into()));
            Value::Object(map)
        }
        Ok(_) => json!({ "error": "backtest response is not an object", "advisory": true }),
        Err(e) => json!({ "error": e.to_string(), "advisory": true }),
    }
}

async fn backtest(ctx: &PipelineContext, run: &Run, signals: &[SignalRecord]) -> Result<Value, JobError> {
    if signals.is_empty() {
        return Ok(json!({
            "advisory": true,
            "disclaimer": DISCLAIMER,
            "skipped": "no signals to backtest",
        }));
    }
    let raw = ctx.invoke_json(&prompts::backtesting(run, signals)).await?;
    Ok(backtest_result(&raw))
}

async fn economic_impact(ctx: &PipelineContext, run: &Run, routed: &Routed<Sector>) -> Value {
    let params = routed.category.params();
    let params_value = json!(params);
    let sector = json!(routed.category);
    let sector_name = sector.as_str().unwrap_or("generic").to_string();

    let estimate = match ctx
        .invoke_json(&prompts::economic_impact(run, &sector_name, &params_value))
        .await
    {
        Ok(raw) => match parse_json::<Value>(&raw) {
            Ok(estimate) => estimate,
            Err(e) => {
                warn!(run_id = run.id, error = %e, "economic impact response unusable");
                json!({ "error": e.to_string() })
            }
        },
        Err(e) => {
            warn!(run_id = run.id, error = %e, "economic impact step failed");
            json!({ "error": e.to_string() })
        }
    };
    json!({
        "sector": sector,
        "routing": { "rule": routed.rule, "confidence": routed.confidence },
        "parameters": params_value,
        "estimate": estimate,
        "advisory": true,
    })
}

pub async fn run(ctx: &PipelineContext, run_id: i64) -> Result<(), JobError> {
    let Some(run) = ctx.begin_phase(run_id, Phase::Backtesting).await? else {
        return Ok(());
    };
    let signals = ctx.db.call(move |db| db.list_signals(run_id)).await?;
    let backtest = backtest(ctx, &run, &signals).await?;

    let routed = sector_table()?.route(&run.subject);
    let economic = economic_impact(ctx, &run, &routed).await;

    let mut result = backtest;
    result["economic_impact"] = economic;

    ctx.records
        .finish_phase(
            run_id,
            RunUpdate::status(RunStatus::PhaseComplete)
                .with_phase(Phase::Backtesting.number())
                .with_result(Phase::Backtesting, result),
            Some(NewJob::phase(run_id, JobType::Synthesis)),
        )
        .await?;
    info!(run_id, sector = ?routed.category, "backtesting complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtest_result_is_marked_advisory() {
        let value = backtest_result(r#"{"metrics": {"win_rate": 0.7}}"#);
        assert_eq!(value["advisory"], true);
        assert_eq!(value["disclaimer"], DISCLAIMER);
        assert_eq!(value["metrics"]["win_rate"], 0.7);
    }

    #[test]
    fn test_backtest_result_error_fallback() {
        let value = backtest_result("I cannot do that");
        assert!(value["error"].is_string());
        assert_eq!(value["advisory"], true);
    }
}
