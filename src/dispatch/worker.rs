use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Dispatcher, JobHandler};
use crate::settings::JobSettings;
use crate::store::DbHandle;

/// Background dispatchers sharing one shutdown signal.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    worker_ids: Vec<String>,
}

impl WorkerPool {
    pub fn spawn(db: DbHandle, handler: Arc<dyn JobHandler>, settings: &JobSettings, count: usize) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(count);
        let mut worker_ids = Vec::with_capacity(count);
        for _ in 0..count {
            let dispatcher = Dispatcher::new(db.clone(), handler.clone(), settings);
            worker_ids.push(dispatcher.worker_id().to_string());
            let rx = rx.clone();
            handles.push(tokio::spawn(async move { dispatcher.run_forever(rx).await }));
        }
        info!(workers = count, "worker pool started");
        Self {
            shutdown,
            handles,
            worker_ids,
        }
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    /// Signal every worker and wait for the in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::JobError;
    use crate::store::{Job, PipelineDb};
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl JobHandler for Idle {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pool_spawns_distinct_workers_and_stops() {
        let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let pool = WorkerPool::spawn(db, Arc::new(Idle), &JobSettings::default(), 3);
        let ids = pool.worker_ids().to_vec();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| id.starts_with("worker:")));
        assert_ne!(ids[0], ids[1]);
        pool.shutdown().await;
    }
}
