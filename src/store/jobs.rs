//! Durable job queue on top of the pipeline database.
//!
//! Jobs move `PENDING → RUNNING → DONE`, or on failure to `RETRY` (with a
//! backoff `run_after`), `DLQ` once attempts run out, or `FAILED` for fatal
//! errors. Claims happen inside one transaction while the database mutex is
//! held, and every finishing update is guarded on `status = 'RUNNING' AND
//! locked_by = <worker>` so a worker whose lock was recovered cannot
//! overwrite the job's newer state.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{OptionalExtension, params};

use super::db::PipelineDb;
use super::models::*;
use crate::util::ts;

/// Attempt budget and exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff_base: TimeDelta,
    pub backoff_max: TimeDelta,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: TimeDelta::seconds(2),
            backoff_max: TimeDelta::seconds(60),
        }
    }
}

impl RetryPolicy {
    /// `min(max, base × 2^(attempts-1))`.
    pub fn delay_for(&self, attempts: i32) -> TimeDelta {
        let exp = (attempts.max(1) - 1).min(20) as u32;
        let factor = 1_i32 << exp;
        let delay = self
            .backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max);
        delay.min(self.backoff_max)
    }
}

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Fatal,
}

const JOB_COLUMNS: &str = "id, run_id, job_type, payload, dedupe_key, status, attempts, run_after, locked_by, locked_at, last_error, created_at, updated_at, finished_at";

impl PipelineDb {
    /// Insert a job unless an active one (`PENDING|RUNNING|RETRY`) with the
    /// same `(run_id, job_type, dedupe_key)` already exists. Returns the job
    /// and whether it was newly created.
    pub fn enqueue_job(&self, new: &NewJob, now: DateTime<Utc>) -> Result<(Job, bool)> {
        let existing = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM jobs
                     WHERE run_id = ?1 AND job_type = ?2 AND dedupe_key = ?3
                       AND status IN ('PENDING', 'RUNNING', 'RETRY')
                     ORDER BY id LIMIT 1",
                    JOB_COLUMNS
                ),
                params![new.run_id, new.job_type.as_str(), new.dedupe_key],
                JobRow::from_row,
            )
            .optional()
            .context("Failed to look up active job")?;
        if let Some(row) = existing {
            return Ok((row.into_job()?, false));
        }

        let stamp = ts(now);
        self.conn
            .execute(
                "INSERT INTO jobs (run_id, job_type, payload, dedupe_key, status, run_after, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, ?5, ?5)",
                params![
                    new.run_id,
                    new.job_type.as_str(),
                    new.payload.to_string(),
                    new.dedupe_key,
                    stamp
                ],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        let job = self.get_job(id)?.context("Job not found after insert")?;
        Ok((job, true))
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                JobRow::from_row,
            )
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_jobs(&self, run_id: i64) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE run_id = ?1 ORDER BY id",
                JOB_COLUMNS
            ))
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(params![run_id], JobRow::from_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// Atomically move up to `limit` eligible jobs to `RUNNING` under
    /// `worker_id`. Each claimed job's attempt counter is incremented.
    pub fn claim_jobs(&self, worker_id: &str, limit: usize, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let stamp = ts(now);
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin claim")?;

        let ids: Vec<i64> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM jobs
                     WHERE status IN ('PENDING', 'RETRY') AND run_after <= ?1
                     ORDER BY run_after, id
                     LIMIT ?2",
                )
                .context("Failed to prepare claim")?;
            let rows = stmt
                .query_map(params![stamp, limit as i64], |row| row.get(0))
                .context("Failed to select claimable jobs")?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()
                .context("Failed to read claimable job ids")?
        };

        let mut claimed_ids = Vec::with_capacity(ids.len());
        for id in ids {
            let updated = tx
                .execute(
                    "UPDATE jobs
                     SET status = 'RUNNING', locked_by = ?2, locked_at = ?3,
                         attempts = attempts + 1, updated_at = ?3
                     WHERE id = ?1 AND status IN ('PENDING', 'RETRY')",
                    params![id, worker_id, stamp],
                )
                .context("Failed to claim job")?;
            if updated == 1 {
                claimed_ids.push(id);
            }
        }
        tx.commit().context("Failed to commit claim")?;

        let mut jobs = Vec::with_capacity(claimed_ids.len());
        for id in claimed_ids {
            if let Some(job) = self.get_job(id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Mark a job `DONE`. Returns false when the lock was lost meanwhile.
    pub fn complete_job(&self, id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let stamp = ts(now);
        let updated = self
            .conn
            .execute(
                "UPDATE jobs
                 SET status = 'DONE', locked_by = NULL, locked_at = NULL,
                     updated_at = ?3, finished_at = ?3
                 WHERE id = ?1 AND status = 'RUNNING' AND locked_by = ?2",
                params![id, worker_id, stamp],
            )
            .context("Failed to complete job")?;
        Ok(updated == 1)
    }

    /// Record a failed attempt and pick the next state. Returns the new
    /// status, or `None` when the lock was lost meanwhile.
    pub fn fail_job(
        &self,
        id: i64,
        worker_id: &str,
        kind: FailureKind,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<JobStatus>> {
        let Some(job) = self.get_job(id)? else {
            return Ok(None);
        };
        if job.status != JobStatus::Running || job.locked_by.as_deref() != Some(worker_id) {
            return Ok(None);
        }

        let (next, run_after) = next_state(kind, job.attempts, policy, now);
        let stamp = ts(now);
        let finished = if next == JobStatus::Retry {
            None
        } else {
            Some(stamp.clone())
        };
        let updated = self
            .conn
            .execute(
                "UPDATE jobs
                 SET status = ?3, run_after = ?4, last_error = ?5, locked_by = NULL,
                     locked_at = NULL, updated_at = ?6, finished_at = ?7
                 WHERE id = ?1 AND status = 'RUNNING' AND locked_by = ?2",
                params![
                    id,
                    worker_id,
                    next.as_str(),
                    ts(run_after),
                    error,
                    stamp,
                    finished
                ],
            )
            .context("Failed to record job failure")?;
        Ok((updated == 1).then_some(next))
    }

    /// Treat every `RUNNING` job locked before `now - lock_timeout` as a
    /// failed attempt: `RETRY` immediately when attempts remain, else `DLQ`.
    /// Returns the recovered jobs with their new state.
    pub fn recover_stale_jobs(
        &self,
        lock_timeout: TimeDelta,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let stale = self.select_jobs(
            "status = 'RUNNING' AND locked_at < ?1",
            params![ts(now - lock_timeout)],
        )?;
        self.requeue_held(stale, policy, now)
    }

    /// Like [`PipelineDb::recover_stale_jobs`], restricted to one run.
    pub fn recover_stale_run_jobs(
        &self,
        run_id: i64,
        lock_timeout: TimeDelta,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let stale = self.select_jobs(
            "run_id = ?1 AND status = 'RUNNING' AND locked_at < ?2",
            params![run_id, ts(now - lock_timeout)],
        )?;
        self.requeue_held(stale, policy, now)
    }

    /// Take the lock away from the `RUNNING` job with this dedupe key,
    /// whatever its age. Used once the work it stands for is known dead.
    pub fn release_held_job(
        &self,
        run_id: i64,
        job_type: JobType,
        dedupe_key: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let held = self.select_jobs(
            "run_id = ?1 AND job_type = ?2 AND dedupe_key = ?3 AND status = 'RUNNING'",
            params![run_id, job_type.as_str(), dedupe_key],
        )?;
        Ok(self.requeue_held(held, policy, now)?.into_iter().next())
    }

    fn select_jobs(&self, filter: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE {} ORDER BY id",
                JOB_COLUMNS, filter
            ))
            .context("Failed to prepare job scan")?;
        let rows = stmt
            .query_map(params, JobRow::from_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// Count the held attempt as failed and unlock each job. The update is
    /// guarded on the lock seen at selection time.
    fn requeue_held(&self, held: Vec<Job>, policy: &RetryPolicy, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let stamp = ts(now);
        let mut recovered = Vec::new();
        for job in held {
            let next = if job.attempts >= policy.max_attempts {
                JobStatus::Dlq
            } else {
                JobStatus::Retry
            };
            let finished = (next == JobStatus::Dlq).then(|| stamp.clone());
            let updated = self
                .conn
                .execute(
                    "UPDATE jobs
                     SET status = ?2, run_after = ?3, locked_by = NULL, locked_at = NULL,
                         last_error = ?4, updated_at = ?3, finished_at = ?5
                     WHERE id = ?1 AND status = 'RUNNING' AND locked_at IS ?6",
                    params![
                        job.id,
                        next.as_str(),
                        stamp,
                        format!(
                            "lock held by {} expired",
                            job.locked_by.as_deref().unwrap_or("unknown worker")
                        ),
                        finished,
                        job.locked_at
                    ],
                )
                .context("Failed to recover stale job")?;
            if updated == 1
                && let Some(job) = self.get_job(job.id)?
            {
                recovered.push(job);
            }
        }
        Ok(recovered)
    }

    /// Requeue every dead-lettered job of a run with a fresh attempt budget.
    pub fn retry_dlq(&self, run_id: i64, now: DateTime<Utc>) -> Result<usize> {
        let stamp = ts(now);
        let updated = self
            .conn
            .execute(
                "UPDATE jobs
                 SET status = 'PENDING', attempts = 0, run_after = ?2, updated_at = ?2,
                     finished_at = NULL
                 WHERE run_id = ?1 AND status = 'DLQ'",
                params![run_id, stamp],
            )
            .context("Failed to requeue dead-lettered jobs")?;
        Ok(updated)
    }

    /// Delete `DONE` jobs of a run that finished before `older_than`.
    pub fn purge_done(&self, run_id: i64, older_than: DateTime<Utc>) -> Result<usize> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM jobs
                 WHERE run_id = ?1 AND status = 'DONE' AND COALESCE(finished_at, updated_at) < ?2",
                params![run_id, ts(older_than)],
            )
            .context("Failed to purge done jobs")?;
        Ok(deleted)
    }

    pub fn job_counts(&self, run_id: i64) -> Result<JobCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(1) FROM jobs WHERE run_id = ?1 GROUP BY status")
            .context("Failed to prepare job_counts")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to count jobs")?;
        let mut counts = JobCounts::default();
        for row in rows {
            let (status, count) = row.context("Failed to read job count row")?;
            let status = JobStatus::from_str(&status)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse job status")?;
            counts.add(status, count);
        }
        Ok(counts)
    }

    /// Whether a job of this type is still pending, running or waiting to retry.
    pub fn has_active_job(&self, run_id: i64, job_type: JobType) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(1) FROM jobs
                 WHERE run_id = ?1 AND job_type = ?2 AND status IN ('PENDING', 'RUNNING', 'RETRY')",
                params![run_id, job_type.as_str()],
                |row| row.get(0),
            )
            .context("Failed to check for active jobs")?;
        Ok(count > 0)
    }
}

/// Next status and `run_after` after a failed attempt.
fn next_state(
    kind: FailureKind,
    attempts: i32,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> (JobStatus, DateTime<Utc>) {
    match kind {
        FailureKind::Fatal => (JobStatus::Failed, now),
        FailureKind::Transient if attempts >= policy.max_attempts => (JobStatus::Dlq, now),
        FailureKind::Transient => (JobStatus::Retry, now + policy.delay_for(attempts)),
    }
}

/// Intermediate row struct for jobs.
struct JobRow {
    id: i64,
    run_id: i64,
    job_type: String,
    payload: String,
    dedupe_key: String,
    status: String,
    attempts: i32,
    run_after: String,
    locked_by: Option<String>,
    locked_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            job_type: row.get(2)?,
            payload: row.get(3)?,
            dedupe_key: row.get(4)?,
            status: row.get(5)?,
            attempts: row.get(6)?,
            run_after: row.get(7)?,
            locked_by: row.get(8)?,
            locked_at: row.get(9)?,
            last_error: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            finished_at: row.get(13)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let job_type = JobType::from_str(&self.job_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job type")?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let payload =
            serde_json::from_str(&self.payload).context("Failed to parse job payload JSON")?;
        Ok(Job {
            id: self.id,
            run_id: self.run_id,
            job_type,
            payload,
            dedupe_key: self.dedupe_key,
            status,
            attempts: self.attempts,
            run_after: self.run_after,
            locked_by: self.locked_by,
            locked_at: self.locked_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Result<(PipelineDb, i64)> {
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(
            &NewRun {
                user_id: "u".into(),
                subject: "s".into(),
                ..Default::default()
            },
            Utc::now(),
        )?;
        Ok((db, run.id))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base: TimeDelta::seconds(2),
            backoff_max: TimeDelta::seconds(10),
        };
        assert_eq!(policy.delay_for(1), TimeDelta::seconds(2));
        assert_eq!(policy.delay_for(2), TimeDelta::seconds(4));
        assert_eq!(policy.delay_for(3), TimeDelta::seconds(8));
        assert_eq!(policy.delay_for(4), TimeDelta::seconds(10));
        assert_eq!(policy.delay_for(60), TimeDelta::seconds(10));
    }

    #[test]
    fn test_enqueue_dedupes_active_jobs() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        let (first, created) = db.enqueue_job(&NewJob::batch(run_id, 0), now)?;
        assert!(created);
        let (second, created) = db.enqueue_job(&NewJob::batch(run_id, 0), now)?;
        assert!(!created);
        assert_eq!(first.id, second.id);

        let (_, created) = db.enqueue_job(&NewJob::batch(run_id, 1), now)?;
        assert!(created);
        assert_eq!(db.list_jobs(run_id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_enqueue_after_done_creates_new_job() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        let (job, _) = db.enqueue_job(&NewJob::phase(run_id, JobType::QualityGate), now)?;
        let claimed = db.claim_jobs("worker:a", 1, now)?;
        assert_eq!(claimed[0].id, job.id);
        assert!(db.complete_job(job.id, "worker:a", now)?);

        let (again, created) = db.enqueue_job(&NewJob::phase(run_id, JobType::QualityGate), now)?;
        assert!(created);
        assert_ne!(again.id, job.id);
        Ok(())
    }

    #[test]
    fn test_claim_is_exclusive() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        db.enqueue_job(&NewJob::batch(run_id, 0), now)?;
        let a = db.claim_jobs("worker:a", 5, now)?;
        let b = db.claim_jobs("worker:b", 5, now)?;
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert_eq!(a[0].status, JobStatus::Running);
        assert_eq!(a[0].attempts, 1);
        assert_eq!(a[0].locked_by.as_deref(), Some("worker:a"));
        Ok(())
    }

    #[test]
    fn test_claim_respects_run_after_and_order() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        db.enqueue_job(&NewJob::batch(run_id, 0), now)?;
        db.enqueue_job(&NewJob::batch(run_id, 1), now + TimeDelta::minutes(5))?;
        let claimed = db.claim_jobs("worker:a", 5, now)?;
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload_index("batch_index"), Some(0));
        Ok(())
    }

    #[test]
    fn test_transient_failure_retries_with_backoff_then_dlq() -> Result<()> {
        let (db, run_id) = setup()?;
        let policy = RetryPolicy::default();
        let mut now = Utc::now();
        let (job, _) = db.enqueue_job(&NewJob::batch(run_id, 0), now)?;

        for attempt in 1..=3 {
            let claimed = db.claim_jobs("worker:a", 1, now)?;
            assert_eq!(claimed.len(), 1, "attempt {} should be claimable", attempt);
            let status = db
                .fail_job(job.id, "worker:a", FailureKind::Transient, "timeout", &policy, now)?
                .unwrap();
            if attempt < 3 {
                assert_eq!(status, JobStatus::Retry);
                // Not claimable before the backoff elapses.
                assert!(db.claim_jobs("worker:a", 1, now)?.is_empty());
                now += policy.delay_for(attempt);
            } else {
                assert_eq!(status, JobStatus::Dlq);
            }
        }
        assert!(db.claim_jobs("worker:a", 1, now + TimeDelta::hours(1))?.is_empty());
        let stored = db.get_job(job.id)?.unwrap();
        assert_eq!(stored.status, JobStatus::Dlq);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
        Ok(())
    }

    #[test]
    fn test_fatal_failure_skips_retry() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        let (job, _) = db.enqueue_job(&NewJob::phase(run_id, JobType::Synthesis), now)?;
        db.claim_jobs("worker:a", 1, now)?;
        let status = db.fail_job(
            job.id,
            "worker:a",
            FailureKind::Fatal,
            "unauthorized",
            &RetryPolicy::default(),
            now,
        )?;
        assert_eq!(status, Some(JobStatus::Failed));
        Ok(())
    }

    #[test]
    fn test_lost_lock_cannot_complete() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        let (job, _) = db.enqueue_job(&NewJob::batch(run_id, 0), now)?;
        db.claim_jobs("worker:a", 1, now)?;
        assert!(!db.complete_job(job.id, "worker:b", now)?);
        assert!(
            db.fail_job(
                job.id,
                "worker:b",
                FailureKind::Transient,
                "x",
                &RetryPolicy::default(),
                now
            )?
            .is_none()
        );
        assert!(db.complete_job(job.id, "worker:a", now)?);
        Ok(())
    }

    #[test]
    fn test_recover_stale_jobs_retries_then_dead_letters() -> Result<()> {
        let (db, run_id) = setup()?;
        let policy = RetryPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        let timeout = TimeDelta::minutes(10);
        let start = Utc::now();
        let (job, _) = db.enqueue_job(&NewJob::batch(run_id, 3), start)?;
        db.claim_jobs("worker:dead", 1, start)?;

        // Fresh lock is left alone.
        assert!(db.recover_stale_jobs(timeout, &policy, start + TimeDelta::minutes(5))?.is_empty());

        let later = start + TimeDelta::minutes(11);
        let recovered = db.recover_stale_jobs(timeout, &policy, later)?;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, JobStatus::Retry);
        assert!(recovered[0].locked_by.is_none());

        db.claim_jobs("worker:dead", 1, later)?;
        let much_later = later + TimeDelta::minutes(11);
        let recovered = db.recover_stale_jobs(timeout, &policy, much_later)?;
        assert_eq!(recovered[0].id, job.id);
        assert_eq!(recovered[0].status, JobStatus::Dlq);
        Ok(())
    }

    #[test]
    fn test_stale_recovery_can_be_scoped_to_one_run() -> Result<()> {
        let (db, run_id) = setup()?;
        let other = db.create_run(
            &NewRun {
                user_id: "u".into(),
                subject: "other".into(),
                ..Default::default()
            },
            Utc::now(),
        )?;
        let start = Utc::now();
        db.enqueue_job(&NewJob::batch(run_id, 0), start)?;
        db.enqueue_job(&NewJob::batch(other.id, 0), start)?;
        assert_eq!(db.claim_jobs("worker:dead", 2, start)?.len(), 2);

        let later = start + TimeDelta::minutes(11);
        let recovered =
            db.recover_stale_run_jobs(run_id, TimeDelta::minutes(10), &RetryPolicy::default(), later)?;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].run_id, run_id);
        assert_eq!(db.job_counts(other.id)?.running, 1);
        Ok(())
    }

    #[test]
    fn test_release_held_job_ignores_lock_age() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        let (job, _) = db.enqueue_job(&NewJob::batch(run_id, 3), now)?;
        db.enqueue_job(&NewJob::batch(run_id, 4), now)?;
        db.claim_jobs("worker:dead", 2, now)?;

        let released = db
            .release_held_job(run_id, JobType::ResearchBatch, "batch:3", &RetryPolicy::default(), now)?
            .unwrap();
        assert_eq!(released.id, job.id);
        assert_eq!(released.status, JobStatus::Retry);
        assert!(released.locked_by.is_none());
        // Only the named job loses its lock.
        assert_eq!(db.job_counts(run_id)?.running, 1);

        // Enqueue now reuses the unlocked job and it is claimable at once.
        let (again, inserted) = db.enqueue_job(&NewJob::batch(run_id, 3), now)?;
        assert!(!inserted);
        assert_eq!(again.id, job.id);
        let claimed = db.claim_jobs("worker:b", 1, now)?;
        assert_eq!(claimed[0].id, job.id);
        assert!(
            db.release_held_job(run_id, JobType::ResearchBatch, "batch:9", &RetryPolicy::default(), now)?
                .is_none()
        );
        Ok(())
    }

    #[test]
    fn test_retry_dlq_resets_attempts() -> Result<()> {
        let (db, run_id) = setup()?;
        let policy = RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        };
        let now = Utc::now();
        let (job, _) = db.enqueue_job(&NewJob::batch(run_id, 0), now)?;
        db.claim_jobs("w", 1, now)?;
        db.fail_job(job.id, "w", FailureKind::Transient, "boom", &policy, now)?;
        assert_eq!(db.job_counts(run_id)?.dlq, 1);

        assert_eq!(db.retry_dlq(run_id, now)?, 1);
        let stored = db.get_job(job.id)?.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(db.retry_dlq(run_id, now)?, 0);
        Ok(())
    }

    #[test]
    fn test_purge_done_respects_retention() -> Result<()> {
        let (db, run_id) = setup()?;
        let old = Utc::now() - TimeDelta::hours(48);
        let (job, _) = db.enqueue_job(&NewJob::batch(run_id, 0), old)?;
        db.claim_jobs("w", 1, old)?;
        db.complete_job(job.id, "w", old)?;
        let recent = Utc::now();
        let (job2, _) = db.enqueue_job(&NewJob::batch(run_id, 1), recent)?;
        db.claim_jobs("w", 1, recent)?;
        db.complete_job(job2.id, "w", recent)?;

        let deleted = db.purge_done(run_id, recent - TimeDelta::hours(24))?;
        assert_eq!(deleted, 1);
        assert!(db.get_job(job.id)?.is_none());
        assert!(db.get_job(job2.id)?.is_some());
        Ok(())
    }

    #[test]
    fn test_job_counts_and_active_check() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        db.enqueue_job(&NewJob::batch(run_id, 0), now)?;
        db.enqueue_job(&NewJob::batch(run_id, 1), now)?;
        db.claim_jobs("w", 1, now)?;
        let counts = db.job_counts(run_id)?;
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.active(), 2);
        assert!(db.has_active_job(run_id, JobType::ResearchBatch)?);
        assert!(!db.has_active_job(run_id, JobType::PostProcess)?);
        Ok(())
    }
}
