use std::sync::Arc;

use tracing::debug;

use super::events::EventBus;
use super::fanout::FanoutPlan;
use super::reasoning::{InvokeOptions, Prompt, ReasoningService};
use super::run_record::RunRecords;
use crate::errors::{PipelineError, ReasoningError};
use crate::settings::Settings;
use crate::store::{DbHandle, Phase, Run, RunStatus, RunUpdate};

/// Shared handles every phase and controller works with.
#[derive(Clone)]
pub struct PipelineContext {
    pub db: DbHandle,
    pub reasoning: Arc<dyn ReasoningService>,
    pub settings: Arc<Settings>,
    pub events: EventBus,
    pub records: RunRecords,
}

impl PipelineContext {
    pub fn new(
        db: DbHandle,
        reasoning: Arc<dyn ReasoningService>,
        settings: Arc<Settings>,
        events: EventBus,
    ) -> Self {
        let records = RunRecords::new(db.clone(), events.clone());
        Self {
            db,
            reasoning,
            settings,
            events,
            records,
        }
    }

    /// Invoke the reasoning service asking for a JSON object.
    pub async fn invoke_json(&self, prompt: &Prompt) -> Result<String, ReasoningError> {
        let options = InvokeOptions::json(
            self.settings.reasoning.max_tokens,
            self.settings.reasoning.temperature,
        );
        debug!(task = %prompt.task, "reasoning call");
        self.reasoning.invoke(prompt, &options).await
    }

    pub fn plan_for(&self, run: &Run) -> FanoutPlan {
        FanoutPlan::for_run(run, &self.settings.fanout.levels)
    }

    /// Load a run for a whole-phase job and mark it running in that phase.
    ///
    /// `None` when the job has nothing to do: the run is terminal, already
    /// holds this phase's result, or sits in an earlier phase than the job
    /// expects (a stale trigger).
    pub async fn begin_phase(&self, run_id: i64, phase: Phase) -> Result<Option<Run>, PipelineError> {
        let run = match self.records.get(run_id).await {
            Ok(run) => run,
            Err(PipelineError::RunNotFound { .. }) => {
                debug!(run_id, phase = %phase, "phase job for unknown run");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if run.status.is_terminal() {
            debug!(run_id, phase = %phase, status = %run.status, "run is terminal, skipping phase");
            return Ok(None);
        }
        if run.has_phase_result(phase) {
            debug!(run_id, phase = %phase, "phase already recorded, skipping");
            return Ok(None);
        }
        if let Some(previous) = Phase::from_number(phase.number() - 1)
            && !run.has_phase_result(previous)
        {
            debug!(run_id, phase = %phase, current = run.current_phase, "phase triggered out of order");
            return Ok(None);
        }
        if run.status == RunStatus::Running && run.current_phase == phase.number() {
            return Ok(Some(run));
        }
        Ok(self
            .records
            .update(
                run_id,
                RunUpdate::status(RunStatus::Running).with_phase(phase.number()),
            )
            .await?)
    }
}
