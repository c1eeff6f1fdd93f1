//! Markdown report command: `phaseline export`.

use std::path::Path;

use anyhow::{Context, Result};

use phaseline::config::Config;

pub async fn cmd_export(config: &Config, run_id: i64, output: Option<&Path>) -> Result<()> {
    let pipeline = config.pipeline()?;
    let report = pipeline.export(run_id).await?;
    match output {
        Some(path) => {
            let path = config.project_dir.join(path);
            std::fs::write(&path, &report)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            println!("Report for run {} written to {}", run_id, path.display());
        }
        None => print!("{}", report),
    }
    Ok(())
}
