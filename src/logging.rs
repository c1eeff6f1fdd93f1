//! Tracing subscriber setup.
//!
//! Stderr gets a `fmt` layer in text or JSON. When `logging.file_dir` is set
//! a daily rolling JSON file is written as well; the returned guard must be
//! held until exit so buffered lines are flushed.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::settings::{LogFormat, LoggingSettings};

pub const DEFAULT_FILTER: &str = "phaseline=info";
const VERBOSE_FILTER: &str = "phaseline=debug";
const LOG_FILE_PREFIX: &str = "phaseline.log";

/// Directive used when `RUST_LOG` is unset. `-v` wins over the file setting.
pub fn default_directive(configured: Option<&str>, verbose: bool) -> &str {
    if verbose {
        VERBOSE_FILTER
    } else {
        configured.unwrap_or(DEFAULT_FILTER)
    }
}

fn env_filter(configured: Option<&str>, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::try_new(default_directive(configured, verbose))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. `base_dir` anchors a relative `file_dir`.
pub fn init(settings: &LoggingSettings, verbose: bool, base_dir: &Path) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(match settings.format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    });

    let mut guard = None;
    if let Some(dir) = &settings.file_dir {
        let dir = base_dir.join(dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
        guard = Some(file_guard);
    }

    let filter = env_filter(settings.filter.as_deref(), verbose);
    tracing_subscriber::registry()
        .with(layers.with_filter(filter))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(None, false), "phaseline=info");
        assert_eq!(default_directive(Some("phaseline=warn"), false), "phaseline=warn");
        assert_eq!(default_directive(Some("phaseline=warn"), true), "phaseline=debug");
    }
}
