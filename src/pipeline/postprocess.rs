//! Post-processing chain that closes phase 2.
//!
//! Every chain step runs once per included unit, addressed by a dense chain
//! index (`step_index * units + unit_index`) and executed in order, one job
//! per index. Each job writes one artifact row. The job after the last index
//! finalizes: it computes the build verdict from measurable counts and hands
//! the run to the quality gate, or back to `completed` when the chain ran as
//! a repair.

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::context::PipelineContext;
use super::events::RunEvent;
use super::fanout::FanoutPlan;
use super::parse::parse_json;
use super::prompts;
use super::run_record::{apply_update, store_error};
use crate::errors::{JobError, PipelineError};
use crate::settings::BuildSettings;
use crate::store::{
    BuildVerdict, ChainStep, JobType, NewJob, Phase, PipelineDb, Run, RunStatus, RunUpdate,
    UnitStatus,
};

/// Terminal verdict of the knowledge build.
pub fn build_verdict(
    completed_fraction: f64,
    chunks: i64,
    usable_artifacts: i64,
    settings: &BuildSettings,
) -> BuildVerdict {
    if completed_fraction < settings.degraded_below_fraction {
        BuildVerdict::Degraded
    } else if chunks >= settings.production_ready_chunks && usable_artifacts > 0 {
        BuildVerdict::ProductionReady
    } else if chunks >= settings.good_enough_chunks {
        BuildVerdict::GoodEnough
    } else {
        BuildVerdict::Incomplete
    }
}

/// Whether a run is somewhere the chain may execute: finishing phase 2, or
/// re-entered by the recovery guard after completion.
fn chain_allowed(run: &Run) -> bool {
    run.status == RunStatus::Running
        && ((run.current_phase == Phase::SourceDiscovery.number()
            && !run.has_phase_result(Phase::SourceDiscovery))
            || run.has_phase_result(Phase::Synthesis))
}

async fn chain_run(ctx: &PipelineContext, run_id: i64) -> Result<Option<Run>, PipelineError> {
    let run = match ctx.records.get(run_id).await {
        Ok(run) => run,
        Err(PipelineError::RunNotFound { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    if !chain_allowed(&run) {
        debug!(run_id, label = %run.status_label(), "run is not post-processing, skipping chain step");
        return Ok(None);
    }
    Ok(Some(run))
}

/// Locally computed quality summary of one unit.
fn unit_quality(db: &PipelineDb, run_id: i64, unit_index: usize, subdomain: &str, levels: usize) -> anyhow::Result<Value> {
    let units = db.list_units(run_id)?;
    let mine = units.iter().filter(|u| u.subdomain == subdomain);
    let completed = mine.clone().filter(|u| u.status == UnitStatus::Completed).count();
    let failed = mine.filter(|u| u.status == UnitStatus::Failed).count();
    let chunks = db.count_chunks(run_id, Some(subdomain))?;
    let usable = db
        .list_artifacts(run_id)?
        .iter()
        .filter(|a| a.unit_index as usize == unit_index && a.is_usable())
        .count();
    let score = if levels == 0 {
        0.0
    } else {
        ((completed as f64 / levels as f64) * 100.0).round() / 100.0
    };
    Ok(json!({
        "levels_completed": completed,
        "levels_failed": failed,
        "chunks": chunks,
        "usable_artifacts": usable,
        "score": score,
    }))
}

/// Artifact content and error flag for one reasoning-backed step.
async fn reasoning_step(
    ctx: &PipelineContext,
    run: &Run,
    step: ChainStep,
    subdomain: &str,
) -> Result<(Value, bool), JobError> {
    let (run_id, owned_subdomain) = (run.id, subdomain.to_string());
    let limit = ctx.settings.fanout.chunks_per_prompt;
    let chunks = ctx
        .db
        .call(move |db| db.list_chunks(run_id, &owned_subdomain, limit))
        .await?;
    if chunks.is_empty() {
        return Ok((json!({ "error": "no chunks recorded for this unit" }), true));
    }
    let Some(prompt) = prompts::chain_step(run, step, subdomain, &chunks) else {
        return Ok((json!({ "error": "step has no prompt" }), true));
    };
    match ctx.invoke_json(&prompt).await {
        Ok(raw) => match parse_json::<Value>(&raw) {
            Ok(content) => Ok((content, false)),
            Err(e) => {
                warn!(run_id, step = step.as_str(), subdomain, error = %e, "chain step response unusable");
                Ok((json!({ "error": e.to_string() }), true))
            }
        },
        Err(e) if e.is_transient() => Err(e.into()),
        Err(e) => {
            warn!(run_id, step = step.as_str(), subdomain, error = %e, "chain step failed");
            Ok((json!({ "error": e.to_string() }), true))
        }
    }
}

/// Execute chain index `chain_index`, or finalize when it is one past the
/// last step.
pub async fn run_chain_step(ctx: &PipelineContext, run_id: i64, chain_index: usize) -> Result<(), JobError> {
    let Some(run) = chain_run(ctx, run_id).await? else {
        return Ok(());
    };
    let plan = ctx.plan_for(&run);
    if chain_index == plan.chain_len() {
        return finalize(ctx, &run, &plan).await;
    }
    let Some((step, unit_index, subdomain)) = plan.chain_coordinates(chain_index) else {
        warn!(run_id, chain_index, len = plan.chain_len(), "chain index out of range, ignoring");
        return Ok(());
    };

    let existing = ctx
        .db
        .call(move |db| db.get_artifact(run_id, step, unit_index))
        .await?;
    if existing.is_some() {
        debug!(run_id, chain_index, "chain step already recorded, advancing");
        ctx.db
            .call(move |db| db.enqueue_job(&NewJob::chain(run_id, chain_index + 1), Utc::now()))
            .await?;
        return Ok(());
    }

    let (content, is_error) = if step == ChainStep::Quality {
        let (name, levels) = (subdomain.to_string(), plan.levels.len());
        let content = ctx
            .db
            .call(move |db| unit_quality(db, run_id, unit_index, &name, levels))
            .await?;
        (content, false)
    } else {
        reasoning_step(ctx, &run, step, subdomain).await?
    };
    record_step(ctx, run_id, chain_index, step, unit_index, subdomain, content, is_error).await
}

#[allow(clippy::too_many_arguments)]
async fn record_step(
    ctx: &PipelineContext,
    run_id: i64,
    chain_index: usize,
    step: ChainStep,
    unit_index: usize,
    subdomain: &str,
    content: Value,
    is_error: bool,
) -> Result<(), JobError> {
    let name = subdomain.to_string();
    ctx.db
        .call(move |db| {
            let now = Utc::now();
            db.upsert_artifact(run_id, step, unit_index, &name, &content, is_error, now)?;
            db.enqueue_job(&NewJob::chain(run_id, chain_index + 1), now)?;
            Ok(())
        })
        .await?;
    ctx.events.emit(&RunEvent::ChainStepFinished {
        run_id,
        chain_index,
        step: step.as_str().to_string(),
        is_error,
    });
    debug!(run_id, chain_index, step = step.as_str(), subdomain, is_error, "chain step recorded");
    Ok(())
}

/// Record an error artifact for a chain step whose job gave up, and keep
/// the chain moving.
pub async fn abandon_chain_step(
    ctx: &PipelineContext,
    run_id: i64,
    chain_index: usize,
    error: &str,
) -> Result<(), JobError> {
    let Some(run) = chain_run(ctx, run_id).await? else {
        return Ok(());
    };
    let plan = ctx.plan_for(&run);
    let Some((step, unit_index, subdomain)) = plan.chain_coordinates(chain_index) else {
        return Ok(());
    };
    record_step(
        ctx,
        run_id,
        chain_index,
        step,
        unit_index,
        subdomain,
        json!({ "error": error }),
        true,
    )
    .await
}

async fn finalize(ctx: &PipelineContext, run: &Run, plan: &FanoutPlan) -> Result<(), JobError> {
    let run_id = run.id;
    let repairing = run.has_phase_result(Phase::Synthesis);
    let total = plan.total_batches();
    let units = plan.units.len();
    let settings = ctx.settings.build.clone();

    let (verdict, summary) = ctx
        .db
        .call(move |db| {
            let completed = db.completed_batch_indices(run_id)?.len();
            let chunks = db.count_chunks(run_id, None)?;
            let artifacts = db.list_artifacts(run_id)?;
            let usable = db.count_usable_artifacts(run_id)?;
            let errors = artifacts.iter().filter(|a| a.is_error).count();
            let fraction = if total == 0 { 0.0 } else { completed as f64 / total as f64 };
            let verdict = build_verdict(fraction, chunks, usable, &settings);
            let summary = json!({
                "build_verdict": verdict,
                "units": units,
                "batches_total": total,
                "batches_completed": completed,
                "completed_fraction": (fraction * 1000.0).round() / 1000.0,
                "chunks": chunks,
                "usable_artifacts": usable,
                "error_artifacts": errors,
            });
            db.insert_quality_check(run_id, "build", verdict.as_str(), fraction, &summary, Utc::now())?;
            Ok((verdict, summary))
        })
        .await?;

    let update = RunUpdate {
        build_verdict: Some(verdict),
        ..Default::default()
    };
    if repairing {
        ctx.records
            .finish_phase(run_id, RunUpdate { status: Some(RunStatus::Completed), ..update }, None)
            .await?;
    } else {
        ctx.records
            .finish_phase(
                run_id,
                RunUpdate { status: Some(RunStatus::PhaseComplete), ..update }
                    .with_phase(Phase::SourceDiscovery.number())
                    .with_result(Phase::SourceDiscovery, summary),
                Some(NewJob::phase(run_id, JobType::QualityGate)),
            )
            .await?;
    }
    ctx.events.emit(&RunEvent::BuildFinalized { run_id, verdict });
    info!(run_id, verdict = verdict.as_str(), repairing, "knowledge build finalized");
    Ok(())
}

/// Recovery guard: a `completed` run without a single usable artifact is
/// moved back to `running` and the chain re-entered from its first step.
/// Returns whether a repair was started.
pub async fn recover_completed(ctx: &PipelineContext, run_id: i64) -> Result<bool, PipelineError> {
    let repaired = ctx
        .db
        .call(move |db| {
            let Some(run) = db.get_run(run_id)? else {
                return Ok(false);
            };
            if run.status != RunStatus::Completed
                || db.count_usable_artifacts(run_id)? > 0
                || db.has_active_job(run_id, JobType::PostProcess)?
            {
                return Ok(false);
            }
            db.delete_artifacts(run_id)?;
            apply_update(
                db,
                run_id,
                &RunUpdate::status(RunStatus::Running),
                Some(&NewJob::chain(run_id, 0)),
            )?;
            Ok(true)
        })
        .await
        .map_err(store_error)?;
    if repaired {
        warn!(run_id, "completed run has no usable artifacts, re-entering post-processing");
        let run = ctx.records.get(run_id).await?;
        ctx.records.announce(&run);
    }
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_verdict_thresholds() {
        let s = BuildSettings::default();
        assert_eq!(build_verdict(0.4, 500, 10, &s), BuildVerdict::Degraded);
        assert_eq!(build_verdict(0.5, 50, 1, &s), BuildVerdict::ProductionReady);
        assert_eq!(build_verdict(1.0, 50, 0, &s), BuildVerdict::GoodEnough);
        assert_eq!(build_verdict(1.0, 20, 0, &s), BuildVerdict::GoodEnough);
        assert_eq!(build_verdict(1.0, 19, 5, &s), BuildVerdict::Incomplete);
    }

    #[test]
    fn test_unit_quality_counts_levels() -> anyhow::Result<()> {
        use crate::store::{BatchOutput, NewChunk, NewRun};
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(
            &NewRun {
                user_id: "u".into(),
                subject: "s".into(),
                ..Default::default()
            },
            Utc::now(),
        )?;
        let output = BatchOutput {
            chunks: vec![NewChunk {
                content: "c".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        db.start_unit(run.id, 0, "a", "x", Utc::now())?;
        db.record_batch_output(run.id, 0, "a", &output, Utc::now())?;
        db.fail_unit(run.id, 1, "a", "y", "boom", Utc::now())?;

        let quality = unit_quality(&db, run.id, 0, "a", 2)?;
        assert_eq!(quality["levels_completed"], 1);
        assert_eq!(quality["levels_failed"], 1);
        assert_eq!(quality["chunks"], 1);
        assert_eq!(quality["score"], 0.5);
        Ok(())
    }
}
