//! Batch fan-out controller for phase 2.
//!
//! The included subdomains (units) × research levels form a dense grid of
//! batches addressed by `unit_index * levels + level_index`. Batches run one
//! at a time in index order: each finished batch enqueues the next index,
//! and the last one hands over to the post-processing chain. Progress is
//! durable in `unit_runs`, so resume can restart from the lowest index that
//! has not completed.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::context::PipelineContext;
use super::events::RunEvent;
use super::phases::{domain, research};
use super::prompts;
use crate::errors::{JobError, PipelineError};
use crate::store::{
    Adjustments, BatchOutput, ChainStep, NewJob, Phase, PipelineDb, Run, RunStatus, RunUpdate,
    UnitStatus,
};

/// Filter candidate units by confirmation adjustments. A unit is excluded
/// if and only if its adjustment sets `include = false`.
pub fn active_units(candidates: &[String], adjustments: Option<&Adjustments>) -> Vec<String> {
    candidates
        .iter()
        .filter(|name| {
            adjustments
                .and_then(|adj| adj.get(name.as_str()))
                .is_none_or(|adj| adj.include)
        })
        .cloned()
        .collect()
}

/// One cell of the fan-out grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCoordinates {
    pub batch_index: usize,
    pub unit_index: usize,
    pub level_index: usize,
    pub subdomain: String,
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutPlan {
    pub units: Vec<String>,
    pub levels: Vec<String>,
}

impl FanoutPlan {
    pub fn new(units: Vec<String>, levels: Vec<String>) -> Self {
        Self { units, levels }
    }

    /// Included units of a run against the configured levels.
    pub fn for_run(run: &Run, levels: &[String]) -> Self {
        let candidates = domain::subdomain_names(&run.phase_results);
        Self::new(
            active_units(&candidates, run.adjustments.as_ref()),
            levels.to_vec(),
        )
    }

    pub fn total_batches(&self) -> usize {
        self.units.len() * self.levels.len()
    }

    pub fn batch_index(&self, unit_index: usize, level_index: usize) -> usize {
        unit_index * self.levels.len() + level_index
    }

    pub fn coordinates(&self, batch_index: usize) -> Option<BatchCoordinates> {
        if batch_index >= self.total_batches() {
            return None;
        }
        let unit_index = batch_index / self.levels.len();
        let level_index = batch_index % self.levels.len();
        Some(BatchCoordinates {
            batch_index,
            unit_index,
            level_index,
            subdomain: self.units[unit_index].clone(),
            level: self.levels[level_index].clone(),
        })
    }

    /// Lowest batch index not in `completed`, if any.
    pub fn next_incomplete(&self, completed: &BTreeSet<usize>) -> Option<usize> {
        (0..self.total_batches()).find(|index| !completed.contains(index))
    }

    /// Post-processing runs every chain step once per unit.
    pub fn chain_len(&self) -> usize {
        ChainStep::ALL.len() * self.units.len()
    }

    /// `(step, unit_index, subdomain)` addressed by a chain index.
    pub fn chain_coordinates(&self, chain_index: usize) -> Option<(ChainStep, usize, &str)> {
        if chain_index >= self.chain_len() {
            return None;
        }
        let step = ChainStep::ALL[chain_index / self.units.len()];
        let unit_index = chain_index % self.units.len();
        Some((step, unit_index, self.units[unit_index].as_str()))
    }
}

/// What happens after a batch settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Batch(usize),
    Chain,
    AllFailed,
}

/// Enqueue the successor of `batch_index`: the next batch, or the chain
/// when this was the last one and anything completed.
pub fn continue_after(
    db: &PipelineDb,
    run_id: i64,
    total_batches: usize,
    batch_index: usize,
) -> anyhow::Result<Continuation> {
    let now = Utc::now();
    if batch_index + 1 < total_batches {
        db.enqueue_job(&NewJob::batch(run_id, batch_index + 1), now)?;
        return Ok(Continuation::Batch(batch_index + 1));
    }
    if db.completed_batch_indices(run_id)?.is_empty() {
        return Ok(Continuation::AllFailed);
    }
    db.enqueue_job(&NewJob::chain(run_id, 0), now)?;
    Ok(Continuation::Chain)
}

/// Load a run that is in the fan-out part of phase 2, or `None` when a
/// batch job for it should do nothing.
async fn fanout_run(ctx: &PipelineContext, run_id: i64) -> Result<Option<Run>, PipelineError> {
    let run = match ctx.records.get(run_id).await {
        Ok(run) => run,
        Err(PipelineError::RunNotFound { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    if run.status.is_terminal() {
        debug!(run_id, status = %run.status, "run is terminal, skipping batch");
        return Ok(None);
    }
    let in_fanout = run.status == RunStatus::Running
        && run.current_phase == Phase::SourceDiscovery.number()
        && !run.has_phase_result(Phase::SourceDiscovery);
    if !in_fanout {
        debug!(run_id, label = %run.status_label(), "run is not fanning out, skipping batch");
        return Ok(None);
    }
    Ok(Some(run))
}

/// Execute one research batch.
///
/// Transient reasoning failures propagate so the job is retried; any other
/// failure marks the unit `failed` and the fan-out moves on.
pub async fn run_batch(ctx: &PipelineContext, run_id: i64, batch_index: usize) -> Result<(), JobError> {
    let Some(run) = fanout_run(ctx, run_id).await? else {
        return Ok(());
    };
    let plan = ctx.plan_for(&run);
    let Some(coords) = plan.coordinates(batch_index) else {
        warn!(run_id, batch_index, total = plan.total_batches(), "batch index out of range, ignoring");
        return Ok(());
    };

    let unit = ctx
        .db
        .call(move |db| db.get_unit(run_id, batch_index))
        .await?;
    if unit.is_some_and(|u| u.status == UnitStatus::Completed) {
        debug!(run_id, batch_index, "batch already completed, advancing");
        let total = plan.total_batches();
        let next = ctx
            .db
            .call(move |db| continue_after(db, run_id, total, batch_index))
            .await?;
        return settle(ctx, run_id, next).await;
    }

    let (subdomain, level) = (coords.subdomain.clone(), coords.level.clone());
    ctx.db
        .call(move |db| db.start_unit(run_id, batch_index, &subdomain, &level, Utc::now()))
        .await?;
    info!(run_id, batch_index, subdomain = %coords.subdomain, level = %coords.level, "research batch started");

    let prompt = prompts::research_batch(
        &run,
        run.phase_results.get(Phase::DomainAnalysis.key()),
        &coords.subdomain,
        &coords.level,
    );
    let outcome = match ctx.invoke_json(&prompt).await {
        Ok(raw) => research::parse_batch_output(&raw)
            .map_err(|e| format!("malformed research response: {}", e)),
        Err(e) if e.is_transient() => return Err(e.into()),
        Err(e) => Err(e.to_string()),
    };
    finish_batch(ctx, run_id, &plan, coords, outcome).await
}

/// Mark a batch failed from outside its handler (dead-lettered or fatally
/// failed job) and keep the fan-out moving.
pub async fn abandon_batch(
    ctx: &PipelineContext,
    run_id: i64,
    batch_index: usize,
    error: &str,
) -> Result<(), JobError> {
    let Some(run) = fanout_run(ctx, run_id).await? else {
        return Ok(());
    };
    let plan = ctx.plan_for(&run);
    let Some(coords) = plan.coordinates(batch_index) else {
        return Ok(());
    };
    finish_batch(ctx, run_id, &plan, coords, Err(error.to_string())).await
}

async fn finish_batch(
    ctx: &PipelineContext,
    run_id: i64,
    plan: &FanoutPlan,
    coords: BatchCoordinates,
    outcome: Result<BatchOutput, String>,
) -> Result<(), JobError> {
    let total = plan.total_batches();
    let expected = ctx.settings.fanout.expected_chunks_per_batch;
    let batch_index = coords.batch_index;
    let success = outcome.is_ok();

    let next = ctx
        .db
        .call(move |db| {
            let now = Utc::now();
            match &outcome {
                Ok(output) => {
                    let (sources, chunks) = db.record_batch_output(
                        run_id,
                        batch_index,
                        &coords.subdomain,
                        output,
                        now,
                    )?;
                    info!(run_id, batch_index, sources, chunks, "research batch completed");
                }
                Err(error) => {
                    warn!(run_id, batch_index, error = %error, "research batch failed");
                    db.fail_unit(
                        run_id,
                        batch_index,
                        &coords.subdomain,
                        &coords.level,
                        error,
                        now,
                    )?;
                }
            }
            let counters = db.compute_counters(run_id, total, expected)?;
            db.update_run(
                run_id,
                &RunUpdate {
                    counters: Some(counters),
                    ..Default::default()
                },
                now,
            )?;
            continue_after(db, run_id, total, batch_index)
        })
        .await?;

    ctx.events.emit(&RunEvent::BatchFinished {
        run_id,
        batch_index,
        total_batches: total,
        success,
    });
    settle(ctx, run_id, next).await
}

async fn settle(ctx: &PipelineContext, run_id: i64, next: Continuation) -> Result<(), JobError> {
    match next {
        Continuation::Batch(index) => debug!(run_id, next = index, "next batch enqueued"),
        Continuation::Chain => info!(run_id, "fan-out finished, post-processing enqueued"),
        Continuation::AllFailed => {
            ctx.records.fail(run_id, "all research units failed").await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UnitAdjustment;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_active_units_excludes_only_explicit_false() {
        let candidates = names(&["a", "b", "c", "d"]);
        let mut adjustments = Adjustments::new();
        adjustments.insert("b".into(), UnitAdjustment { include: false });
        adjustments.insert("c".into(), UnitAdjustment { include: true });
        adjustments.insert("zzz".into(), UnitAdjustment { include: false });
        assert_eq!(
            active_units(&candidates, Some(&adjustments)),
            names(&["a", "c", "d"])
        );
        assert_eq!(active_units(&candidates, None), candidates);
    }

    #[test]
    fn test_total_batches_is_units_times_levels() {
        let plan = FanoutPlan::new(names(&["a", "b", "c"]), names(&["surface", "academic"]));
        assert_eq!(plan.total_batches(), 6);
        assert_eq!(plan.batch_index(2, 1), 5);
        let coords = plan.coordinates(3).unwrap();
        assert_eq!(coords.subdomain, "b");
        assert_eq!(coords.level, "academic");
        assert_eq!((coords.unit_index, coords.level_index), (1, 1));
        assert!(plan.coordinates(6).is_none());
    }

    #[test]
    fn test_every_index_maps_back_to_itself() {
        let plan = FanoutPlan::new(names(&["a", "b"]), names(&["x", "y", "z"]));
        for index in 0..plan.total_batches() {
            let c = plan.coordinates(index).unwrap();
            assert_eq!(plan.batch_index(c.unit_index, c.level_index), index);
        }
    }

    #[test]
    fn test_next_incomplete_never_skips_a_gap() {
        let plan = FanoutPlan::new(names(&["a", "b", "c"]), names(&["x", "y"]));
        let completed: BTreeSet<usize> = [0, 1, 2, 4, 5].into_iter().collect();
        assert_eq!(plan.next_incomplete(&completed), Some(3));
        let all: BTreeSet<usize> = (0..6).collect();
        assert_eq!(plan.next_incomplete(&all), None);
        assert_eq!(plan.next_incomplete(&BTreeSet::new()), Some(0));
    }

    #[test]
    fn test_empty_plan_has_no_batches() {
        let plan = FanoutPlan::new(vec![], names(&["x"]));
        assert_eq!(plan.total_batches(), 0);
        assert_eq!(plan.chain_len(), 0);
        assert!(plan.coordinates(0).is_none());
        assert!(plan.chain_coordinates(0).is_none());
    }

    #[test]
    fn test_chain_coordinates_step_major() {
        let plan = FanoutPlan::new(names(&["a", "b"]), names(&["x"]));
        assert_eq!(plan.chain_len(), 8);
        assert_eq!(
            plan.chain_coordinates(0),
            Some((ChainStep::KnowledgeGraph, 0, "a"))
        );
        assert_eq!(plan.chain_coordinates(3), Some((ChainStep::Taxonomy, 1, "b")));
        assert_eq!(plan.chain_coordinates(7), Some((ChainStep::Quality, 1, "b")));
        assert_eq!(plan.chain_coordinates(8), None);
    }

    #[test]
    fn test_continue_after_enqueues_next_then_chain() -> anyhow::Result<()> {
        use crate::store::{JobType, NewRun};
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(
            &NewRun {
                user_id: "u".into(),
                subject: "s".into(),
                ..Default::default()
            },
            Utc::now(),
        )?;
        assert_eq!(continue_after(&db, run.id, 2, 0)?, Continuation::Batch(1));
        // Nothing completed yet, so the last batch cannot hand over.
        assert_eq!(continue_after(&db, run.id, 2, 1)?, Continuation::AllFailed);

        db.start_unit(run.id, 0, "a", "x", Utc::now())?;
        db.record_batch_output(run.id, 0, "a", &BatchOutput::default(), Utc::now())?;
        assert_eq!(continue_after(&db, run.id, 2, 1)?, Continuation::Chain);
        let jobs = db.list_jobs(run.id)?;
        assert!(jobs.iter().any(|j| j.job_type == JobType::PostProcess));
        Ok(())
    }
}
