//! Operator-facing controller and the job handler behind the dispatcher.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::context::PipelineContext;
use super::events::RunEvent;
use super::fanout::{self, FanoutPlan};
use super::ingest;
use super::intent::{self, IntentRequest, TechnicalBrief};
use super::phases::{assessment, backtest, detection, domain, gate, synthesis};
use super::postprocess;
use super::query::{self, QueryAnswer};
use super::report;
use super::run_record::{apply_update, store_error};
use crate::dispatch::JobHandler;
use crate::errors::{JobError, PipelineError};
use crate::store::{
    Adjustments, Document, Job, JobType, NewDocument, NewJob, NewRun, Phase, PipelineDb,
    QueryRecord, Run, RunStatus, RunUpdate, RunView, UnitStatus,
};

/// What a resume call set in motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "index", rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// Fan-out restarts at this batch index.
    Batch(usize),
    /// Every batch completed; post-processing restarts at this chain index.
    Chain(usize),
    /// A whole-phase job was (re)enqueued.
    Phase(Phase),
    /// Phase 1 finished; the run waits for `confirm`.
    AwaitingConfirmation,
    AlreadyComplete,
    /// The recovery guard re-entered post-processing.
    Repaired,
    Terminal(RunStatus),
}

/// What status healing did for a run in phase 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanoutHeal {
    Nothing,
    Batch(usize),
    Chain,
    AllFailed,
}

fn in_fanout(run: &Run) -> bool {
    run.status == RunStatus::Running
        && run.current_phase == Phase::SourceDiscovery.number()
        && !run.has_phase_result(Phase::SourceDiscovery)
}

/// Move phase 2 forward when every unit is settled but nothing is queued.
fn heal_fanout(
    db: &PipelineDb,
    run_id: i64,
    plan: &FanoutPlan,
    orphan_after: TimeDelta,
    hard_fail_after: TimeDelta,
) -> anyhow::Result<FanoutHeal> {
    let now = Utc::now();
    let report = db.heal_stale_units(run_id, orphan_after, hard_fail_after, now)?;
    if !report.is_empty() {
        warn!(run_id, orphaned = report.orphaned, failed = report.failed, "healed stale units");
    }
    if db.has_active_job(run_id, JobType::ResearchBatch)? || db.has_active_job(run_id, JobType::PostProcess)? {
        return Ok(FanoutHeal::Nothing);
    }
    let settled: BTreeSet<usize> = db
        .list_units(run_id)?
        .iter()
        .filter(|u| u.status.is_settled())
        .map(|u| u.batch_index as usize)
        .collect();
    if let Some(first) = plan.next_incomplete(&settled) {
        db.enqueue_job(&NewJob::batch(run_id, first), now)?;
        return Ok(FanoutHeal::Batch(first));
    }
    if db.completed_batch_indices(run_id)?.is_empty() {
        return Ok(FanoutHeal::AllFailed);
    }
    db.enqueue_job(&NewJob::chain(run_id, 0), now)?;
    Ok(FanoutHeal::Chain)
}

/// Entry point for every run operation. Cloning shares the context.
#[derive(Clone)]
pub struct Pipeline {
    ctx: PipelineContext,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Create a run in `pending` and enqueue phase 1.
    pub async fn create(&self, new: NewRun) -> Result<Run, PipelineError> {
        let run = self
            .ctx
            .records
            .create(new, Some(NewJob::phase(0, JobType::DomainAnalysis)))
            .await?;
        info!(run_id = run.id, subject = %run.subject, "run created");
        Ok(run)
    }

    /// Store the adjustments, move the run into phase 2 and enqueue batch 0.
    pub async fn confirm(&self, run_id: i64, adjustments: Adjustments) -> Result<Run, PipelineError> {
        let levels = self.ctx.settings.fanout.levels.clone();
        let run = self
            .ctx
            .db
            .call(move |db| {
                let Some(mut run) = db.get_run(run_id)? else {
                    return Err(PipelineError::RunNotFound { id: run_id }.into());
                };
                if run.status != RunStatus::PhaseComplete
                    || run.current_phase != Phase::DomainAnalysis.number()
                {
                    return Err(PipelineError::NotAwaitingConfirmation {
                        id: run_id,
                        status: run.status_label(),
                    }
                    .into());
                }
                run.adjustments = Some(adjustments.clone());
                let plan = FanoutPlan::for_run(&run, &levels);
                if plan.total_batches() == 0 {
                    return Err(PipelineError::NoActiveUnits { id: run_id }.into());
                }
                let update = RunUpdate {
                    adjustments: Some(adjustments),
                    ..RunUpdate::status(RunStatus::Running)
                }
                .with_phase(Phase::SourceDiscovery.number());
                apply_update(db, run_id, &update, Some(&NewJob::batch(run_id, 0)))?
                    .ok_or_else(|| anyhow::Error::from(PipelineError::RunNotFound { id: run_id }))
            })
            .await
            .map_err(store_error)?;
        self.ctx.records.announce(&run);
        let plan = self.ctx.plan_for(&run);
        info!(
            run_id,
            units = plan.units.len(),
            batches = plan.total_batches(),
            "run confirmed, fan-out started"
        );
        Ok(run)
    }

    /// Orphan healing and the recovery guard. Runs before every status view,
    /// on resume and once per dispatcher pass.
    pub async fn heal(&self, run_id: i64) -> Result<(), PipelineError> {
        let run = self.ctx.records.get(run_id).await?;
        if run.status == RunStatus::Completed {
            postprocess::recover_completed(&self.ctx, run_id).await?;
            return Ok(());
        }
        if !in_fanout(&run) {
            return Ok(());
        }
        let plan = self.ctx.plan_for(&run);
        let (orphan_after, hard_fail_after) = (
            self.ctx.settings.fanout.orphan_after(),
            self.ctx.settings.fanout.hard_fail_after(),
        );
        let action = self
            .ctx
            .db
            .call(move |db| heal_fanout(db, run_id, &plan, orphan_after, hard_fail_after))
            .await
            .map_err(store_error)?;
        match action {
            FanoutHeal::Nothing => {}
            FanoutHeal::Batch(index) => info!(run_id, batch_index = index, "stalled fan-out re-enqueued"),
            FanoutHeal::Chain => info!(run_id, "settled fan-out handed to post-processing"),
            FanoutHeal::AllFailed => {
                self.ctx.records.fail(run_id, "all research units failed").await?;
            }
        }
        Ok(())
    }

    /// Healed snapshot of a run.
    pub async fn status(&self, run_id: i64) -> Result<RunView, PipelineError> {
        self.heal(run_id).await?;
        self.ctx
            .db
            .call(move |db| db.run_view(run_id))
            .await
            .map_err(store_error)?
            .ok_or(PipelineError::RunNotFound { id: run_id })
    }

    pub async fn list(&self, user_id: Option<String>, limit: usize) -> Result<Vec<Run>, PipelineError> {
        self.ctx
            .db
            .call(move |db| db.list_runs(user_id.as_deref(), limit))
            .await
            .map_err(store_error)
    }

    /// Restart a run from where its durable state says it stopped.
    ///
    /// Idempotent: the jobs it enqueues are deduplicated against active
    /// ones, completed batches are never re-run, and a finished run is only
    /// confirmed.
    pub async fn resume(&self, run_id: i64) -> Result<ResumeOutcome, PipelineError> {
        let mut run = self.ctx.records.get(run_id).await?;
        match run.status {
            RunStatus::Blocked | RunStatus::Cancelled => {
                return Ok(ResumeOutcome::Terminal(run.status));
            }
            RunStatus::Completed => {
                return Ok(if postprocess::recover_completed(&self.ctx, run_id).await? {
                    ResumeOutcome::Repaired
                } else {
                    ResumeOutcome::AlreadyComplete
                });
            }
            RunStatus::PhaseComplete if run.current_phase == Phase::DomainAnalysis.number() => {
                return Ok(ResumeOutcome::AwaitingConfirmation);
            }
            RunStatus::Failed => {
                info!(run_id, error = ?run.error_log, "resuming failed run");
                run = self
                    .ctx
                    .records
                    .update(run_id, RunUpdate::status(RunStatus::Running))
                    .await?
                    .ok_or(PipelineError::RunNotFound { id: run_id })?;
            }
            _ => {}
        }

        // Phase 2 proper, or a post-processing repair of a completed run.
        let fanout_or_chain = (run.has_phase_result(Phase::DomainAnalysis)
            && !run.has_phase_result(Phase::SourceDiscovery))
            || run.has_phase_result(Phase::Synthesis);
        let outcome = if fanout_or_chain {
            self.resume_fanout(&run).await?
        } else {
            let phase = Phase::ALL
                .into_iter()
                .find(|p| !run.has_phase_result(*p))
                .unwrap_or(Phase::Synthesis);
            if let Some(job_type) = JobType::for_phase(phase) {
                self.ctx
                    .db
                    .call(move |db| db.enqueue_job(&NewJob::phase(run_id, job_type), Utc::now()))
                    .await
                    .map_err(store_error)?;
            }
            ResumeOutcome::Phase(phase)
        };
        info!(run_id, outcome = ?outcome, "run resumed");
        Ok(outcome)
    }

    async fn resume_fanout(&self, run: &Run) -> Result<ResumeOutcome, PipelineError> {
        let run_id = run.id;
        let repairing = run.has_phase_result(Phase::SourceDiscovery);
        let plan = self.ctx.plan_for(run);
        let (orphan_after, hard_fail_after) = (
            self.ctx.settings.fanout.orphan_after(),
            self.ctx.settings.fanout.hard_fail_after(),
        );
        let (lock_timeout, policy) = (
            self.ctx.settings.jobs.lock_timeout(),
            self.ctx.settings.jobs.retry_policy(),
        );
        self.ctx
            .db
            .call(move |db| {
                let now = Utc::now();
                db.heal_stale_units(run_id, orphan_after, hard_fail_after, now)?;
                // Locks left by dead workers would otherwise absorb the
                // enqueue below through dedupe.
                db.recover_stale_run_jobs(run_id, lock_timeout, &policy, now)?;
                // A repair only re-runs the chain; research is settled.
                if !repairing {
                    let completed = db.completed_batch_indices(run_id)?;
                    if let Some(index) = plan.next_incomplete(&completed) {
                        let batch = NewJob::batch(run_id, index);
                        let healed = db
                            .get_unit(run_id, index)?
                            .is_some_and(|unit| unit.status != UnitStatus::Running);
                        if healed
                            && let Some(job) = db.release_held_job(
                                run_id,
                                batch.job_type,
                                &batch.dedupe_key,
                                &policy,
                                now,
                            )?
                        {
                            warn!(run_id, job_id = job.id, batch_index = index, "released lock of dead batch");
                        }
                        db.enqueue_job(&batch, now)?;
                        return Ok(ResumeOutcome::Batch(index));
                    }
                }
                let mut next = plan.chain_len();
                for index in 0..plan.chain_len() {
                    if let Some((step, unit_index, _)) = plan.chain_coordinates(index)
                        && db.get_artifact(run_id, step, unit_index)?.is_none()
                    {
                        next = index;
                        break;
                    }
                }
                db.enqueue_job(&NewJob::chain(run_id, next), now)?;
                Ok(ResumeOutcome::Chain(next))
            })
            .await
            .map_err(store_error)
    }

    pub async fn cancel(&self, run_id: i64) -> Result<Run, PipelineError> {
        let run = self
            .ctx
            .records
            .update(run_id, RunUpdate::status(RunStatus::Cancelled))
            .await?
            .ok_or(PipelineError::RunNotFound { id: run_id })?;
        info!(run_id, "run cancelled");
        Ok(run)
    }

    /// Requeue dead-lettered jobs. A run failed by those jobs goes back to
    /// `running` so the requeued work is not skipped.
    pub async fn retry_dlq(&self, run_id: i64) -> Result<usize, PipelineError> {
        let (count, reopened) = self
            .ctx
            .db
            .call(move |db| {
                let Some(run) = db.get_run(run_id)? else {
                    return Err(PipelineError::RunNotFound { id: run_id }.into());
                };
                let count = db.retry_dlq(run_id, Utc::now())?;
                let reopened = if count > 0 && run.status == RunStatus::Failed {
                    apply_update(db, run_id, &RunUpdate::status(RunStatus::Running), None)?
                } else {
                    None
                };
                Ok((count, reopened))
            })
            .await
            .map_err(store_error)?;
        if let Some(run) = reopened {
            self.ctx.records.announce(&run);
        }
        info!(run_id, count, "dead-lettered jobs requeued");
        Ok(count)
    }

    /// Delete DONE jobs finished more than `retention` ago (configured
    /// default when `None`).
    pub async fn purge(&self, run_id: i64, retention: Option<TimeDelta>) -> Result<usize, PipelineError> {
        self.ctx.records.get(run_id).await?;
        let older_than = Utc::now() - retention.unwrap_or_else(|| self.ctx.settings.jobs.done_retention());
        let purged = self
            .ctx
            .db
            .call(move |db| db.purge_done(run_id, older_than))
            .await
            .map_err(store_error)?;
        info!(run_id, purged, "done jobs purged");
        Ok(purged)
    }

    /// Markdown report of the healed run.
    pub async fn export(&self, run_id: i64) -> Result<String, PipelineError> {
        let view = self.status(run_id).await?;
        let (sources, signals) = self
            .ctx
            .db
            .call(move |db| Ok((db.list_sources(run_id)?, db.list_signals(run_id)?)))
            .await
            .map_err(store_error)?;
        Ok(report::render(&view, &sources, &signals))
    }

    /// Queue a document for ingestion into the run's knowledge base.
    pub async fn ingest(&self, run_id: i64, document: NewDocument) -> Result<Document, PipelineError> {
        ingest::submit(&self.ctx, run_id, document).await
    }

    pub async fn documents(&self, run_id: i64) -> Result<Vec<Document>, PipelineError> {
        self.ctx.records.get(run_id).await?;
        self.ctx
            .db
            .call(move |db| db.list_documents(run_id))
            .await
            .map_err(store_error)
    }

    /// Answer a question from the run's chunks and log it.
    pub async fn query(&self, run_id: i64, question: &str) -> Result<QueryAnswer, PipelineError> {
        query::answer(&self.ctx, run_id, question).await
    }

    /// Logged questions, newest first.
    pub async fn queries(&self, run_id: i64, limit: usize) -> Result<Vec<QueryRecord>, PipelineError> {
        self.ctx.records.get(run_id).await?;
        self.ctx
            .db
            .call(move |db| db.list_queries(run_id, limit))
            .await
            .map_err(store_error)
    }

    pub async fn translate_intent(&self, request: &IntentRequest) -> Result<TechnicalBrief, PipelineError> {
        intent::translate(&self.ctx, request).await
    }

    /// Give up on a job: keep a fan-out or chain moving, settle a document
    /// as failed, fail the run for a whole-phase job.
    async fn abandon(&self, job: &Job, error: &str) -> Result<(), JobError> {
        if job.job_type.is_ingest() {
            return ingest::abandon_document(&self.ctx, job, error).await;
        }
        match job.job_type {
            JobType::ResearchBatch => match job.payload_index("batch_index") {
                Some(index) => fanout::abandon_batch(&self.ctx, job.run_id, index, error).await,
                None => Ok(()),
            },
            JobType::PostProcess => match job.payload_index("chain_index") {
                Some(index) => postprocess::abandon_chain_step(&self.ctx, job.run_id, index, error).await,
                None => Ok(()),
            },
            other => {
                let message = format!("{} failed: {}", other.as_str(), error);
                self.ctx.records.fail(job.run_id, &message).await?;
                Ok(())
            }
        }
    }
}

fn payload_index(job: &Job, field: &str) -> Result<usize, JobError> {
    job.payload_index(field)
        .ok_or_else(|| JobError::Fatal(format!("{} job {} has no {}", job.job_type.as_str(), job.id, field)))
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let (ctx, run_id) = (&self.ctx, job.run_id);
        match job.job_type {
            JobType::DomainAnalysis => domain::run(ctx, run_id).await,
            JobType::ResearchBatch => fanout::run_batch(ctx, run_id, payload_index(job, "batch_index")?).await,
            JobType::PostProcess => {
                postprocess::run_chain_step(ctx, run_id, payload_index(job, "chain_index")?).await
            }
            JobType::QualityGate => gate::run(ctx, run_id).await,
            JobType::DataAssessment => assessment::run(ctx, run_id).await,
            JobType::PatternDetection => detection::run(ctx, run_id).await,
            JobType::Backtesting => backtest::run(ctx, run_id).await,
            JobType::Synthesis => synthesis::run(ctx, run_id).await,
            JobType::IngestExtract
            | JobType::IngestClean
            | JobType::IngestChunk
            | JobType::IngestScore
            | JobType::IngestStore => ingest::run_stage(ctx, job).await,
        }
    }

    async fn on_dead_letter(&self, job: &Job, error: &str) -> anyhow::Result<()> {
        self.ctx.events.emit(&RunEvent::JobDeadLettered {
            run_id: job.run_id,
            job_id: job.id,
            job_type: job.job_type.as_str().to_string(),
            error: error.to_string(),
        });
        Ok(self.abandon(job, error).await?)
    }

    async fn on_failed(&self, job: &Job, error: &str) -> anyhow::Result<()> {
        Ok(self.abandon(job, error).await?)
    }

    async fn maintain(&self) -> anyhow::Result<()> {
        let running = self
            .ctx
            .db
            .call(|db| db.run_ids_with_status(RunStatus::Running))
            .await?;
        for run_id in running {
            if let Err(e) = self.heal(run_id).await {
                warn!(run_id, error = %e, "healing pass failed");
            }
        }
        debug!("maintenance pass finished");
        Ok(())
    }
}
