//! Worker command: `phaseline work`.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use phaseline::config::Config;
use phaseline::dispatch::{Dispatcher, JobHandler};

pub async fn cmd_work(config: &Config, drain: bool, max_jobs: Option<usize>) -> Result<()> {
    let pipeline = config.pipeline()?;
    let db = pipeline.context().db.clone();
    let handler: Arc<dyn JobHandler> = Arc::new(pipeline);
    let dispatcher = Dispatcher::new(db, handler, &config.settings.jobs);

    if drain {
        let max_jobs = max_jobs.unwrap_or(config.settings.jobs.drain_max_jobs);
        let report = dispatcher.drain(max_jobs).await?;
        println!(
            "Processed {} job(s): {} done, {} retried, {} failed, {} dead-lettered ({} stale recovered)",
            report.processed,
            report.done,
            report.retried,
            report.failed,
            report.dead_lettered,
            report.recovered
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            // Dropping the sender would stop the worker.
            std::future::pending::<()>().await;
        }
        info!("shutdown requested, finishing the current job");
        let _ = shutdown_tx.send(true);
    });
    println!("Worker {} polling for jobs (Ctrl+C to stop)", dispatcher.worker_id());
    dispatcher.run_forever(shutdown_rx).await;
    Ok(())
}
