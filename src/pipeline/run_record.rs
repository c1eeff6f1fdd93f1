//! Run record manager.
//!
//! All run mutation from pipeline code goes through [`RunRecords`]: status
//! changes are validated against the transition table while the database
//! mutex is held, and an update can carry the follow-up job so both land in
//! the same critical section.

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::events::{EventBus, RunEvent};
use crate::errors::PipelineError;
use crate::store::{DbHandle, NewJob, NewRun, Phase, PipelineDb, Run, RunStatus, RunUpdate};
use crate::util::truncate;

/// Longer reasoning error bodies are cut before landing in `error_log`.
const MAX_ERROR_LOG_CHARS: usize = 2_000;

/// Turn a store error back into the typed error it may carry.
pub fn store_error(err: anyhow::Error) -> PipelineError {
    match err.downcast::<PipelineError>() {
        Ok(typed) => typed,
        Err(other) => PipelineError::Database(other),
    }
}

/// Check the required creation parameters.
pub fn validate_new_run(new: &NewRun) -> Result<(), PipelineError> {
    if new.subject.trim().is_empty() {
        return Err(PipelineError::Validation("subject is required".into()));
    }
    if new.user_id.trim().is_empty() {
        return Err(PipelineError::Validation("user id is required".into()));
    }
    Ok(())
}

/// Apply `update` to run `id` and optionally enqueue `next`, on the caller's
/// connection. `Ok(None)` when the run does not exist.
pub fn apply_update(
    db: &PipelineDb,
    id: i64,
    update: &RunUpdate,
    next: Option<&NewJob>,
) -> anyhow::Result<Option<Run>> {
    let Some(current) = db.get_run(id)? else {
        return Ok(None);
    };
    if let Some(status) = update.status
        && !current.status.can_transition_to(status)
    {
        return Err(PipelineError::InvalidTransition {
            from: current.status_label(),
            to: status.as_str().to_string(),
        }
        .into());
    }
    let now = Utc::now();
    let updated = db.update_run(id, update, now)?;
    if let Some(job) = next {
        db.enqueue_job(job, now)?;
    }
    Ok(updated)
}

#[derive(Clone)]
pub struct RunRecords {
    db: DbHandle,
    events: EventBus,
}

impl RunRecords {
    pub fn new(db: DbHandle, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Validate and persist a new run in `pending`, enqueueing `first` with it.
    pub async fn create(&self, new: NewRun, first: Option<NewJob>) -> Result<Run, PipelineError> {
        validate_new_run(&new)?;
        let run = self
            .db
            .call(move |db| {
                let now = Utc::now();
                let run = db.create_run(&new, now)?;
                if let Some(mut job) = first {
                    job.run_id = run.id;
                    db.enqueue_job(&job, now)?;
                }
                Ok(run)
            })
            .await
            .map_err(store_error)?;
        self.events.emit(&RunEvent::RunCreated {
            run_id: run.id,
            subject: run.subject.clone(),
        });
        Ok(run)
    }

    pub async fn get(&self, id: i64) -> Result<Run, PipelineError> {
        self.db
            .call(move |db| db.get_run(id))
            .await
            .map_err(store_error)?
            .ok_or(PipelineError::RunNotFound { id })
    }

    /// Merge a partial update. A missing run is logged and ignored so a late
    /// or duplicate callback cannot take the pipeline down.
    pub async fn update(&self, id: i64, update: RunUpdate) -> Result<Option<Run>, PipelineError> {
        self.advance(id, update, None).await
    }

    /// [`update`](Self::update) plus an enqueue of the job that continues
    /// the run, both under one lock.
    pub async fn advance(
        &self,
        id: i64,
        update: RunUpdate,
        next: Option<NewJob>,
    ) -> Result<Option<Run>, PipelineError> {
        let (status_change, phase_done) = (update.status, update.phase_result.as_ref().map(|(p, _)| *p));
        let updated = self
            .db
            .call(move |db| apply_update(db, id, &update, next.as_ref()))
            .await
            .map_err(store_error)?;
        Ok(self.publish(id, status_change, phase_done, updated))
    }

    /// [`advance`](Self::advance) for a job handler closing its phase. When
    /// the run went terminal while the phase was running, the result and the
    /// follow-up job are dropped and `Ok(None)` is returned.
    pub async fn finish_phase(
        &self,
        id: i64,
        update: RunUpdate,
        next: Option<NewJob>,
    ) -> Result<Option<Run>, PipelineError> {
        let (status_change, phase_done) = (update.status, update.phase_result.as_ref().map(|(p, _)| *p));
        let outcome = self
            .db
            .call(move |db| match db.get_run(id)? {
                Some(run) if run.status.is_terminal() => Ok(Err(run.status)),
                _ => apply_update(db, id, &update, next.as_ref()).map(Ok),
            })
            .await
            .map_err(store_error)?;
        match outcome {
            Ok(updated) => Ok(self.publish(id, status_change, phase_done, updated)),
            Err(status) => {
                info!(run_id = id, %status, phase = ?phase_done, "run settled while its phase ran, result dropped");
                Ok(None)
            }
        }
    }

    fn publish(
        &self,
        id: i64,
        status_change: Option<RunStatus>,
        phase_done: Option<Phase>,
        updated: Option<Run>,
    ) -> Option<Run> {
        let Some(run) = updated else {
            warn!(run_id = id, "update for unknown run ignored");
            return None;
        };
        if status_change.is_some() {
            self.announce(&run);
        }
        if let Some(phase) = phase_done {
            self.events.emit(&RunEvent::PhaseCompleted {
                run_id: id,
                phase: phase.key().to_string(),
            });
        }
        Some(run)
    }

    /// Publish the current status of a run changed outside [`advance`](Self::advance).
    pub fn announce(&self, run: &Run) {
        debug!(run_id = run.id, status = %run.status_label(), "run status changed");
        self.events.emit(&RunEvent::RunStatusChanged {
            run_id: run.id,
            status: run.status,
            current_phase: run.current_phase,
            label: run.status_label(),
        });
    }

    /// Move a run to `failed` with an error log. Runs that can no longer
    /// fail (blocked, cancelled, completed) are left alone.
    pub async fn fail(&self, id: i64, error: &str) -> Result<Option<Run>, PipelineError> {
        let run = match self.get(id).await {
            Ok(run) => run,
            Err(PipelineError::RunNotFound { .. }) => {
                warn!(run_id = id, "cannot fail unknown run");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !run.status.can_transition_to(RunStatus::Failed) {
            debug!(run_id = id, status = %run.status, "run already settled, not failing it");
            return Ok(Some(run));
        }
        let error = truncate(error, MAX_ERROR_LOG_CHARS);
        warn!(run_id = id, error = %error, "run failed");
        self.update(id, RunUpdate::status(RunStatus::Failed).with_error(&error))
            .await
    }

    /// Full `phase_results` map; empty when no phase has completed.
    pub async fn get_phase_results(&self, id: i64) -> Result<Map<String, Value>, PipelineError> {
        self.db
            .call(move |db| db.get_phase_results(id))
            .await
            .map_err(store_error)?
            .ok_or(PipelineError::RunNotFound { id })
    }
}
