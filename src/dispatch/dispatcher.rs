use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{JobHandler, new_worker_id};
use crate::settings::JobSettings;
use crate::store::{DbHandle, FailureKind, Job, JobStatus, RetryPolicy};

/// What happened to one executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Retry,
    Failed,
    DeadLettered,
    /// The lock was recovered by someone else while the handler ran.
    LockLost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub processed: usize,
    pub done: usize,
    pub retried: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub recovered: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Done => self.done += 1,
            JobOutcome::Retry => self.retried += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::DeadLettered => self.dead_lettered += 1,
            JobOutcome::LockLost => {}
        }
    }
}

/// Polls the job table under one worker id.
pub struct Dispatcher {
    db: DbHandle,
    handler: Arc<dyn JobHandler>,
    worker_id: String,
    policy: RetryPolicy,
    lock_timeout: TimeDelta,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(db: DbHandle, handler: Arc<dyn JobHandler>, settings: &JobSettings) -> Self {
        Self {
            db,
            handler,
            worker_id: new_worker_id(),
            policy: settings.retry_policy(),
            lock_timeout: settings.lock_timeout(),
            poll_interval: settings.poll_interval(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Reset jobs whose lock outlived the timeout, then let the handler do
    /// its housekeeping. Returns how many jobs were recovered.
    pub async fn maintenance(&self) -> Result<usize> {
        let (timeout, policy) = (self.lock_timeout, self.policy);
        let recovered = self
            .db
            .call(move |db| db.recover_stale_jobs(timeout, &policy, Utc::now()))
            .await?;
        for job in &recovered {
            warn!(
                job_id = job.id,
                run_id = job.run_id,
                job_type = job.job_type.as_str(),
                status = job.status.as_str(),
                "recovered stale job"
            );
            if job.status == JobStatus::Dlq {
                let reason = job.last_error.clone().unwrap_or_default();
                if let Err(e) = self.handler.on_dead_letter(job, &reason).await {
                    error!(job_id = job.id, error = %e, "dead-letter hook failed");
                }
            }
        }
        self.handler.maintain().await?;
        Ok(recovered.len())
    }

    /// Claim and execute at most one job. `None` when nothing was eligible.
    pub async fn step(&self) -> Result<Option<JobOutcome>> {
        let worker = self.worker_id.clone();
        let mut claimed = self
            .db
            .call(move |db| db.claim_jobs(&worker, 1, Utc::now()))
            .await?;
        match claimed.pop() {
            Some(job) => Ok(Some(self.execute(job).await?)),
            None => Ok(None),
        }
    }

    async fn execute(&self, job: Job) -> Result<JobOutcome> {
        info!(
            job_id = job.id,
            run_id = job.run_id,
            job_type = job.job_type.as_str(),
            attempt = job.attempts,
            worker = %self.worker_id,
            "job claimed"
        );
        let result = self.handler.handle(&job).await;
        let (job_id, worker) = (job.id, self.worker_id.clone());

        let err = match result {
            Ok(()) => {
                let finished = self
                    .db
                    .call(move |db| db.complete_job(job_id, &worker, Utc::now()))
                    .await?;
                if !finished {
                    warn!(job_id, "job lock lost before completion");
                    return Ok(JobOutcome::LockLost);
                }
                debug!(job_id, "job done");
                return Ok(JobOutcome::Done);
            }
            Err(err) => err,
        };

        let kind = if err.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Fatal
        };
        let message = err.message().to_string();
        let policy = self.policy;
        let recorded = message.clone();
        let next = self
            .db
            .call(move |db| db.fail_job(job_id, &worker, kind, &recorded, &policy, Utc::now()))
            .await?;

        match next {
            Some(JobStatus::Retry) => {
                warn!(job_id, run_id = job.run_id, error = %message, "job failed, will retry");
                Ok(JobOutcome::Retry)
            }
            Some(JobStatus::Dlq) => {
                error!(job_id, run_id = job.run_id, error = %message, "job dead-lettered");
                if let Err(e) = self.handler.on_dead_letter(&job, &message).await {
                    error!(job_id, error = %e, "dead-letter hook failed");
                }
                Ok(JobOutcome::DeadLettered)
            }
            Some(_) => {
                error!(job_id, run_id = job.run_id, error = %message, "job failed");
                if let Err(e) = self.handler.on_failed(&job, &message).await {
                    error!(job_id, error = %e, "failure hook failed");
                }
                Ok(JobOutcome::Failed)
            }
            None => {
                warn!(job_id, "job lock lost before failure was recorded");
                Ok(JobOutcome::LockLost)
            }
        }
    }

    /// Process jobs until none is eligible or `max_jobs` have run.
    pub async fn drain(&self, max_jobs: usize) -> Result<DrainReport> {
        let mut report = DrainReport {
            recovered: self.maintenance().await?,
            ..Default::default()
        };
        while report.processed < max_jobs {
            match self.step().await? {
                Some(outcome) => report.record(outcome),
                None => break,
            }
        }
        info!(worker = %self.worker_id, processed = report.processed, "drain finished");
        Ok(report)
    }

    /// Poll until `shutdown` flips to true. Store errors are logged and the
    /// loop carries on after the poll interval.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.maintenance().await {
                error!(worker = %self.worker_id, error = %e, "maintenance pass failed");
            }
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match self.step().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        error!(worker = %self.worker_id, error = %e, "dispatch step failed");
                        break;
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker = %self.worker_id, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::JobError;
    use crate::store::{JobType, NewJob, NewRun, PipelineDb};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails every job with the configured error and records hook calls.
    #[derive(Default)]
    struct Recorder {
        fail_with: Option<fn() -> JobError>,
        handled: Mutex<Vec<i64>>,
        dead: Mutex<Vec<i64>>,
        failed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &Job) -> Result<(), JobError> {
            self.handled.lock().unwrap().push(job.id);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }

        async fn on_dead_letter(&self, job: &Job, _error: &str) -> anyhow::Result<()> {
            self.dead.lock().unwrap().push(job.id);
            Ok(())
        }

        async fn on_failed(&self, job: &Job, _error: &str) -> anyhow::Result<()> {
            self.failed.lock().unwrap().push(job.id);
            Ok(())
        }
    }

    fn settings() -> JobSettings {
        JobSettings {
            max_attempts: 2,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            ..JobSettings::default()
        }
    }

    async fn setup(handler: Arc<Recorder>) -> (Dispatcher, DbHandle, i64) {
        let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let run_id = db
            .call(|db| {
                let run = db.create_run(
                    &NewRun {
                        user_id: "u".into(),
                        subject: "s".into(),
                        ..Default::default()
                    },
                    Utc::now(),
                )?;
                db.enqueue_job(&NewJob::phase(run.id, JobType::DomainAnalysis), Utc::now())?;
                Ok(run.id)
            })
            .await
            .unwrap();
        (Dispatcher::new(db.clone(), handler, &settings()), db, run_id)
    }

    #[tokio::test]
    async fn test_drain_completes_jobs() {
        let handler = Arc::new(Recorder::default());
        let (dispatcher, db, run_id) = setup(handler.clone()).await;
        let report = dispatcher.drain(10).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.done, 1);
        let jobs = db.call(move |db| db.list_jobs(run_id)).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_transient_failures_end_in_dlq() {
        let handler = Arc::new(Recorder {
            fail_with: Some(|| JobError::Transient("rate limited".into())),
            ..Default::default()
        });
        let (dispatcher, db, run_id) = setup(handler.clone()).await;
        let report = dispatcher.drain(10).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(handler.handled.lock().unwrap().len(), 2);
        assert_eq!(handler.dead.lock().unwrap().len(), 1);
        let jobs = db.call(move |db| db.list_jobs(run_id)).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Dlq);
        assert_eq!(jobs[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_skips_retries() {
        let handler = Arc::new(Recorder {
            fail_with: Some(|| JobError::Fatal("bad credentials".into())),
            ..Default::default()
        });
        let (dispatcher, _, _) = setup(handler.clone()).await;
        let report = dispatcher.drain(10).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(handler.failed.lock().unwrap().len(), 1);
        assert!(handler.dead.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_respects_cap() {
        let handler = Arc::new(Recorder::default());
        let (dispatcher, db, run_id) = setup(handler.clone()).await;
        db.call(move |db| {
            for i in 0..4 {
                db.enqueue_job(&NewJob::batch(run_id, i), Utc::now())?;
            }
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(dispatcher.drain(3).await.unwrap().processed, 3);
        assert_eq!(dispatcher.drain(10).await.unwrap().processed, 2);
    }

    #[tokio::test]
    async fn test_stale_lock_is_recovered_and_rerun() {
        let handler = Arc::new(Recorder::default());
        let (dispatcher, db, run_id) = setup(handler.clone()).await;
        // Queued and claimed an hour ago by a worker that never came back.
        let claimed = db
            .call(move |db| {
                let long_ago = Utc::now() - TimeDelta::hours(1);
                db.enqueue_job(&NewJob::batch(run_id, 0), long_ago)?;
                db.claim_jobs("worker:deadbeef", 1, long_ago)
            })
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job_type, JobType::ResearchBatch);

        let report = dispatcher.drain(10).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.done, 2);
        let jobs = db.call(move |db| db.list_jobs(run_id)).await.unwrap();
        assert!(jobs.iter().all(|job| job.status == JobStatus::Done));
        let rerun = jobs.iter().find(|job| job.id == claimed[0].id).unwrap();
        assert_eq!(rerun.attempts, 2);
    }

    #[tokio::test]
    async fn test_run_forever_stops_on_shutdown() {
        let handler = Arc::new(Recorder::default());
        let (dispatcher, _, _) = setup(handler.clone()).await;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { dispatcher.run_forever(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(handler.handled.lock().unwrap().len(), 1);
    }
}
