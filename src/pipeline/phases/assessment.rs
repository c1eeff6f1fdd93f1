//! Phase 4: data assessment. No reasoning call; the confidence cap follows
//! from what the operator supplied and how the gate went.

use serde_json::json;
use tracing::info;

use crate::errors::JobError;
use crate::pipeline::context::PipelineContext;
use crate::store::{GateStatus, JobType, NewJob, Phase, Run, RunStatus, RunUpdate};

pub fn confidence_cap(has_datasets: bool, gate: Option<GateStatus>) -> f64 {
    if has_datasets {
        1.0
    } else if gate == Some(GateStatus::PassConditional) {
        0.6
    } else {
        0.7
    }
}

/// Cap recorded for a run, falling back to the conservative default when
/// the assessment has not run.
pub fn cap_of(run: &Run) -> f64 {
    run.confidence_cap
        .unwrap_or_else(|| confidence_cap(!run.user_datasets.is_empty(), run.gate_status))
}

pub async fn run(ctx: &PipelineContext, run_id: i64) -> Result<(), JobError> {
    let Some(run) = ctx.begin_phase(run_id, Phase::DataAssessment).await? else {
        return Ok(());
    };
    let has_datasets = !run.user_datasets.is_empty();
    let cap = confidence_cap(has_datasets, run.gate_status);
    let result = json!({
        "confidence_cap": cap,
        "user_datasets": run.user_datasets,
        "gate_status": run.gate_status,
        "mode": if has_datasets { "user_data" } else { "public_sources" },
    });

    let update = RunUpdate {
        confidence_cap: Some(cap),
        ..RunUpdate::status(RunStatus::PhaseComplete)
    }
    .with_phase(Phase::DataAssessment.number())
    .with_result(Phase::DataAssessment, result);
    ctx.records
        .finish_phase(run_id, update, Some(NewJob::phase(run_id, JobType::PatternDetection)))
        .await?;
    info!(run_id, cap, "data assessment complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datasets_lift_the_cap() {
        assert_eq!(confidence_cap(true, Some(GateStatus::PassConditional)), 1.0);
        assert_eq!(confidence_cap(false, Some(GateStatus::PassConditional)), 0.6);
        assert_eq!(confidence_cap(false, Some(GateStatus::Pass)), 0.7);
        assert_eq!(confidence_cap(false, None), 0.7);
    }
}
