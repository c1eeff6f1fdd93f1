//! Generic job dispatch: claim, execute, retry or dead-letter.
//!
//! Nothing here knows about pipeline phases. A [`JobHandler`] maps job types
//! to work and gets told when a job gives up for good.

pub mod dispatcher;
pub mod worker;

use async_trait::async_trait;

use crate::errors::JobError;
use crate::store::Job;

pub use dispatcher::{DrainReport, Dispatcher};
pub use worker::WorkerPool;

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one claimed job.
    async fn handle(&self, job: &Job) -> Result<(), JobError>;

    /// The job exhausted its retry budget and now sits in `DLQ`.
    async fn on_dead_letter(&self, _job: &Job, _error: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// The job failed fatally and was moved to `FAILED` without retries.
    async fn on_failed(&self, _job: &Job, _error: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Housekeeping run once per dispatcher pass, before claiming.
    async fn maintain(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// `worker:` plus the first 8 hex characters of a v4 uuid.
pub fn new_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker:{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_shape() {
        let id = new_worker_id();
        let hex = id.strip_prefix("worker:").unwrap();
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_worker_id(), id);
    }
}
