//! Knowledge base commands: ingest, documents, query and translate.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use phaseline::config::Config;
use phaseline::pipeline::IntentRequest;
use phaseline::store::{DocumentStatus, NewDocument};

pub async fn cmd_ingest(
    config: &Config,
    run_id: i64,
    file: &Path,
    subdomain: Option<String>,
    name: Option<String>,
) -> Result<()> {
    let path = config.project_dir.join(file);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = match name {
        Some(name) => name,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Document path has no file name")?,
    };
    let pipeline = config.pipeline()?;
    let document = pipeline
        .ingest(
            run_id,
            NewDocument {
                name,
                subdomain,
                content,
            },
        )
        .await?;
    println!(
        "Document {} ({}) queued for run {}, filed under '{}'",
        style(document.id).bold(),
        document.name,
        run_id,
        document.subdomain
    );
    Ok(())
}

pub async fn cmd_documents(config: &Config, run_id: i64) -> Result<()> {
    let pipeline = config.pipeline()?;
    let documents = pipeline.documents(run_id).await?;
    if documents.is_empty() {
        println!("No documents for run {}", run_id);
        return Ok(());
    }
    for doc in documents {
        let status = match doc.status {
            DocumentStatus::Stored => style(doc.status.as_str()).green(),
            DocumentStatus::Skipped => style(doc.status.as_str()).yellow(),
            DocumentStatus::Failed => style(doc.status.as_str()).red(),
            _ => style(doc.status.as_str()).cyan(),
        };
        print!(
            "{:>4}  {:<9} {:<30} {} words, {}/{} chunks kept, {} stored",
            doc.id, status, doc.name, doc.word_count, doc.chunks_kept, doc.chunks_total, doc.chunks_stored
        );
        match &doc.error_log {
            Some(reason) => println!("  ({})", reason),
            None => println!(),
        }
    }
    Ok(())
}

pub async fn cmd_query(config: &Config, run_id: i64, question: &str, json: bool) -> Result<()> {
    let pipeline = config.pipeline()?;
    let answer = pipeline.query(run_id, question).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }
    println!("{}", answer.answer);
    println!();
    println!(
        "Confidence: {}",
        style(format!("{:.0}%", answer.confidence * 100.0)).bold()
    );
    for source in &answer.sources {
        println!("  [{}] {}", style(&source.subdomain).cyan(), source.excerpt);
    }
    Ok(())
}

pub async fn cmd_translate(config: &Config, request: &IntentRequest, json: bool) -> Result<()> {
    let pipeline = config.pipeline()?;
    let brief = pipeline.translate_intent(request).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&brief)?);
        return Ok(());
    }
    println!("{}", style(&brief.problem_definition).bold());
    println!("Target:     {}", brief.target_variable);
    println!("Model:      {}", brief.recommended_model_type);
    println!("Baseline:   {}", brief.suggested_baseline);
    let lists = [
        ("Predictors", &brief.predictive_variables),
        ("Metrics", &brief.success_metrics),
        ("Sources", &brief.likely_data_sources),
        ("Horizons", &brief.prediction_horizons),
        ("Risks", &brief.risks_and_limitations),
    ];
    for (label, items) in lists {
        if !items.is_empty() {
            println!("{:<11} {}", format!("{}:", label), items.join("; "));
        }
    }
    if !brief.expanded_objective.is_empty() {
        println!();
        println!("{}", brief.expanded_objective);
    }
    Ok(())
}
