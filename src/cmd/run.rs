//! Run lifecycle commands: create, confirm, status, list, resume, cancel,
//! retry-dlq and purge.

use anyhow::Result;
use chrono::TimeDelta;
use console::style;

use phaseline::config::Config;
use phaseline::pipeline::ResumeOutcome;
use phaseline::store::{Adjustments, NewRun, RunView, UnitAdjustment, UnitStatus};

pub async fn cmd_create(config: &Config, new: NewRun) -> Result<()> {
    let pipeline = config.pipeline()?;
    let run = pipeline.create(new).await?;
    println!("Created run {}", style(run.id).bold());
    println!(
        "Domain analysis queued. Run '{}' to process it.",
        style("phaseline work --drain").cyan()
    );
    Ok(())
}

pub async fn cmd_confirm(config: &Config, run_id: i64, exclude: &[String]) -> Result<()> {
    let pipeline = config.pipeline()?;
    let adjustments: Adjustments = exclude
        .iter()
        .map(|name| (name.clone(), UnitAdjustment { include: false }))
        .collect();
    let run = pipeline.confirm(run_id, adjustments).await?;
    let plan = pipeline.context().plan_for(&run);
    println!(
        "Run {} confirmed: {} subdomains x {} levels = {} batches",
        run.id,
        plan.units.len(),
        plan.levels.len(),
        plan.total_batches()
    );
    if !exclude.is_empty() {
        println!("Excluded: {}", exclude.join(", "));
    }
    Ok(())
}

pub async fn cmd_status(config: &Config, run_id: i64, json: bool) -> Result<()> {
    let pipeline = config.pipeline()?;
    let view = pipeline.status(run_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_view(&view);
    }
    Ok(())
}

fn print_view(view: &RunView) {
    let run = &view.run;
    println!();
    println!("Run {}: {}", style(run.id).bold(), run.subject);
    println!("{}", "=".repeat(40));
    println!("Status:      {}", style(&view.status_label).cyan());
    println!("User:        {}", run.user_id);
    if let Some(geography) = &run.geography {
        println!("Geography:   {}", geography);
    }
    let phases: Vec<&str> = run.phase_results.keys().map(String::as_str).collect();
    println!(
        "Phases done: {}",
        if phases.is_empty() { "-".to_string() } else { phases.join(", ") }
    );
    println!(
        "Research:    {} sources, {} data points, {} variables, coverage {:.0}%",
        run.sources_found, run.data_points, run.variables_found, run.coverage_pct
    );

    if !view.units.is_empty() {
        let count = |status: UnitStatus| view.units.iter().filter(|u| u.status == status).count();
        println!(
            "Batches:     {} completed, {} failed, {} orphaned, {} running",
            count(UnitStatus::Completed),
            count(UnitStatus::Failed),
            count(UnitStatus::Orphaned),
            count(UnitStatus::Running)
        );
    }
    if let Some(gate) = run.gate_status {
        println!("Gate:        {}", gate.as_str());
    }
    if let Some(verdict) = run.build_verdict {
        println!("Build:       {}", verdict.as_str());
    }
    if let Some(verdict) = &run.model_verdict {
        println!("Verdict:     {}", verdict);
    }
    let jobs = &view.job_counts;
    println!(
        "Jobs:        {} pending, {} running, {} retry, {} done, {} failed, {} dlq",
        jobs.pending, jobs.running, jobs.retry, jobs.done, jobs.failed, jobs.dlq
    );
    if let Some(error) = &run.error_log {
        println!("Error:       {}", style(error).red());
    }
    println!();
}

pub async fn cmd_list(config: &Config, user: Option<String>, limit: usize) -> Result<()> {
    let pipeline = config.pipeline()?;
    let runs = pipeline.list(user, limit).await?;
    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }
    println!("{:<6} {:<22} {:<12} Subject", "Id", "Status", "User");
    println!("{:<6} {:<22} {:<12} -------", "------", "----------------------", "------------");
    for run in runs {
        println!(
            "{:<6} {:<22} {:<12} {}",
            run.id,
            run.status_label(),
            run.user_id,
            run.subject
        );
    }
    Ok(())
}

pub async fn cmd_resume(config: &Config, run_id: i64) -> Result<()> {
    let pipeline = config.pipeline()?;
    let message = match pipeline.resume(run_id).await? {
        ResumeOutcome::Batch(index) => format!("research restarts at batch {}", index),
        ResumeOutcome::Chain(index) => format!("post-processing restarts at step {}", index),
        ResumeOutcome::Phase(phase) => format!("{} queued", phase),
        ResumeOutcome::AwaitingConfirmation => {
            "waiting for confirmation, run 'phaseline confirm' first".to_string()
        }
        ResumeOutcome::AlreadyComplete => "already complete".to_string(),
        ResumeOutcome::Repaired => "post-processing re-entered to repair missing artifacts".to_string(),
        ResumeOutcome::Terminal(status) => format!("{}, nothing to resume", status),
    };
    println!("Run {}: {}", run_id, message);
    Ok(())
}

pub async fn cmd_cancel(config: &Config, run_id: i64) -> Result<()> {
    let pipeline = config.pipeline()?;
    pipeline.cancel(run_id).await?;
    println!("Run {} cancelled", run_id);
    Ok(())
}

pub async fn cmd_retry_dlq(config: &Config, run_id: i64) -> Result<()> {
    let pipeline = config.pipeline()?;
    let count = pipeline.retry_dlq(run_id).await?;
    println!("Requeued {} dead-lettered job(s) for run {}", count, run_id);
    Ok(())
}

pub async fn cmd_purge(config: &Config, run_id: i64, older_than_hours: Option<i64>) -> Result<()> {
    if older_than_hours.is_some_and(|h| h < 0) {
        anyhow::bail!("--older-than-hours must not be negative");
    }
    let pipeline = config.pipeline()?;
    let purged = pipeline
        .purge(run_id, older_than_hours.map(TimeDelta::hours))
        .await?;
    println!("Purged {} finished job(s) for run {}", purged, run_id);
    Ok(())
}
