//! File-backed settings for phaseline.
//!
//! Settings are read from `.phaseline/phaseline.toml` (or an explicit
//! `--config` path). Every field has a default, so an empty or missing file
//! is valid. Environment variables and CLI flags are layered on top by
//! [`crate::config::Config`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [database]
//! path = ".phaseline/phaseline.db"
//!
//! [reasoning]
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! api_key_env = "PHASELINE_API_KEY"
//! timeout_secs = 50
//!
//! [jobs]
//! max_attempts = 3
//! backoff_base_ms = 2000
//! backoff_max_ms = 60000
//! lock_timeout_secs = 600
//!
//! [fanout]
//! levels = ["surface", "academic", "datasets", "multimedia", "community", "frontier", "lateral"]
//! expected_chunks_per_batch = 5
//! orphan_after_secs = 600
//! hard_fail_after_secs = 1800
//!
//! [gate]
//! max_autocorrect_iterations = 2
//! supplementary_limit = 6
//!
//! [build]
//! degraded_below_fraction = 0.5
//!
//! [ingest]
//! min_words = 250
//! chunk_target_words = 180
//! chunk_max_words = 320
//!
//! [query]
//! max_chunks = 20
//! temperature = 0.2
//!
//! [server]
//! port = 8080
//! workers = 2
//!
//! [logging]
//! format = "text"
//! file_dir = ".phaseline/logs"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::store::jobs::RetryPolicy;

pub const SETTINGS_FILE: &str = "phaseline.toml";

/// Storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file path (default: `.phaseline/phaseline.db`)
    #[serde(default)]
    pub path: Option<String>,
}

/// Reasoning service endpoint and call tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSettings {
    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Hard ceiling on every call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "PHASELINE_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    50
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.3
}

impl Default for ReasoningSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl ReasoningSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Job queue retry and polling behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    /// Attempts before a transiently failing job is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// A RUNNING job locked longer than this is treated as orphaned
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on jobs processed by one `drain` call
    #[serde(default = "default_drain_max_jobs")]
    pub drain_max_jobs: usize,
    /// DONE jobs older than this are removed by `purge`
    #[serde(default = "default_done_retention_hours")]
    pub done_retention_hours: u64,
}

fn default_max_attempts() -> i32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_lock_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_drain_max_jobs() -> usize {
    20
}

fn default_done_retention_hours() -> u64 {
    24
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            lock_timeout_secs: default_lock_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            drain_max_jobs: default_drain_max_jobs(),
            done_retention_hours: default_done_retention_hours(),
        }
    }
}

impl JobSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: TimeDelta::milliseconds(self.backoff_base_ms as i64),
            backoff_max: TimeDelta::milliseconds(self.backoff_max_ms as i64),
        }
    }

    pub fn lock_timeout(&self) -> TimeDelta {
        TimeDelta::seconds(self.lock_timeout_secs as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn done_retention(&self) -> TimeDelta {
        TimeDelta::hours(self.done_retention_hours as i64)
    }
}

/// Batch fan-out shape and unit staleness thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutSettings {
    /// Ordered research levels; each included subdomain runs one batch per level
    #[serde(default = "default_levels")]
    pub levels: Vec<String>,
    /// Chunks a healthy batch is expected to produce (coverage denominator)
    #[serde(default = "default_expected_chunks")]
    pub expected_chunks_per_batch: u32,
    /// A `running` unit older than this becomes `orphaned`
    #[serde(default = "default_orphan_after_secs")]
    pub orphan_after_secs: u64,
    /// A `running` or `orphaned` unit older than this becomes `failed`
    #[serde(default = "default_hard_fail_after_secs")]
    pub hard_fail_after_secs: u64,
    /// Chunks passed to one post-processing prompt
    #[serde(default = "default_chunks_per_prompt")]
    pub chunks_per_prompt: usize,
}

pub fn default_levels() -> Vec<String> {
    [
        "surface",
        "academic",
        "datasets",
        "multimedia",
        "community",
        "frontier",
        "lateral",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_expected_chunks() -> u32 {
    5
}

fn default_orphan_after_secs() -> u64 {
    600
}

fn default_hard_fail_after_secs() -> u64 {
    1_800
}

fn default_chunks_per_prompt() -> usize {
    40
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            levels: default_levels(),
            expected_chunks_per_batch: default_expected_chunks(),
            orphan_after_secs: default_orphan_after_secs(),
            hard_fail_after_secs: default_hard_fail_after_secs(),
            chunks_per_prompt: default_chunks_per_prompt(),
        }
    }
}

impl FanoutSettings {
    pub fn orphan_after(&self) -> TimeDelta {
        TimeDelta::seconds(self.orphan_after_secs as i64)
    }

    pub fn hard_fail_after(&self) -> TimeDelta {
        TimeDelta::seconds(self.hard_fail_after_secs as i64)
    }
}

/// Quality gate thresholds and autocorrection bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    #[serde(default = "default_max_autocorrect_iterations")]
    pub max_autocorrect_iterations: u32,
    /// Supplementary sources accepted per iteration
    #[serde(default = "default_supplementary_limit")]
    pub supplementary_limit: usize,
    /// Coverage points contributed by each registered source
    #[serde(default = "default_coverage_per_source")]
    pub coverage_per_source: f64,
    #[serde(default = "default_pass_coverage")]
    pub pass_coverage: f64,
    #[serde(default = "default_conditional_coverage")]
    pub conditional_coverage: f64,
    #[serde(default = "default_min_freshness")]
    pub min_freshness: f64,
    #[serde(default = "default_min_diversity")]
    pub min_diversity: usize,
    #[serde(default = "default_min_reliability")]
    pub min_reliability: f64,
    #[serde(default = "default_pass_cap")]
    pub pass_cap: u32,
    #[serde(default = "default_conditional_cap")]
    pub conditional_cap: u32,
}

fn default_max_autocorrect_iterations() -> u32 {
    2
}

fn default_supplementary_limit() -> usize {
    6
}

fn default_coverage_per_source() -> f64 {
    12.0
}

fn default_pass_coverage() -> f64 {
    80.0
}

fn default_conditional_coverage() -> f64 {
    75.0
}

fn default_min_freshness() -> f64 {
    70.0
}

fn default_min_diversity() -> usize {
    3
}

fn default_min_reliability() -> f64 {
    6.0
}

fn default_pass_cap() -> u32 {
    70
}

fn default_conditional_cap() -> u32 {
    60
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            max_autocorrect_iterations: default_max_autocorrect_iterations(),
            supplementary_limit: default_supplementary_limit(),
            coverage_per_source: default_coverage_per_source(),
            pass_coverage: default_pass_coverage(),
            conditional_coverage: default_conditional_coverage(),
            min_freshness: default_min_freshness(),
            min_diversity: default_min_diversity(),
            min_reliability: default_min_reliability(),
            pass_cap: default_pass_cap(),
            conditional_cap: default_conditional_cap(),
        }
    }
}

/// Thresholds for the knowledge build verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    #[serde(default = "default_degraded_below_fraction")]
    pub degraded_below_fraction: f64,
    #[serde(default = "default_production_ready_chunks")]
    pub production_ready_chunks: i64,
    #[serde(default = "default_good_enough_chunks")]
    pub good_enough_chunks: i64,
}

fn default_degraded_below_fraction() -> f64 {
    0.5
}

fn default_production_ready_chunks() -> i64 {
    50
}

fn default_good_enough_chunks() -> i64 {
    20
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            degraded_below_fraction: default_degraded_below_fraction(),
            production_ready_chunks: default_production_ready_chunks(),
            good_enough_chunks: default_good_enough_chunks(),
        }
    }
}

/// Document ingestion thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    /// Documents with fewer words after extraction or cleaning are skipped
    #[serde(default = "default_min_words")]
    pub min_words: usize,
    /// A chunk is closed once it reaches this many words
    #[serde(default = "default_chunk_target_words")]
    pub chunk_target_words: usize,
    /// A paragraph that would push a chunk past this starts a new one
    #[serde(default = "default_chunk_max_words")]
    pub chunk_max_words: usize,
    /// Text carried from one stage to the next is cut at this many characters
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

fn default_min_words() -> usize {
    250
}

fn default_chunk_target_words() -> usize {
    180
}

fn default_chunk_max_words() -> usize {
    320
}

fn default_max_text_chars() -> usize {
    200_000
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            min_words: default_min_words(),
            chunk_target_words: default_chunk_target_words(),
            chunk_max_words: default_chunk_max_words(),
            max_text_chars: default_max_text_chars(),
        }
    }
}

/// Question answering over a run's knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    /// Chunks handed to the answer prompt
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_query_temperature")]
    pub temperature: f32,
    /// Confidence assumed when the answer does not state one
    #[serde(default = "default_query_confidence")]
    pub default_confidence: f64,
}

fn default_max_chunks() -> usize {
    20
}

fn default_query_temperature() -> f32 {
    0.2
}

fn default_query_confidence() -> f64 {
    0.7
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_chunks: default_max_chunks(),
            temperature: default_query_temperature(),
            default_confidence: default_query_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Background workers spawned next to the HTTP server
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    2
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: text, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub format: LogFormat,
    /// Directive used when RUST_LOG is unset (default `phaseline=info`)
    #[serde(default)]
    pub filter: Option<String>,
    /// Enables a daily rolling log file in this directory
    #[serde(default)]
    pub file_dir: Option<String>,
}

/// The complete phaseline.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub reasoning: ReasoningSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub fanout: FanoutSettings,
    #[serde(default)]
    pub gate: GateSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse settings from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phaseline.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize phaseline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the settings and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.fanout.levels.is_empty() {
            warnings.push("fanout.levels is empty: no research batches would run".to_string());
        }
        if self.fanout.hard_fail_after_secs <= self.fanout.orphan_after_secs {
            warnings.push(format!(
                "fanout.hard_fail_after_secs ({}) should exceed orphan_after_secs ({})",
                self.fanout.hard_fail_after_secs, self.fanout.orphan_after_secs
            ));
        }
        if self.jobs.max_attempts < 1 {
            warnings.push(format!(
                "jobs.max_attempts must be at least 1 (got {})",
                self.jobs.max_attempts
            ));
        }
        if self.jobs.backoff_max_ms < self.jobs.backoff_base_ms {
            warnings.push("jobs.backoff_max_ms is below backoff_base_ms".to_string());
        }
        if self.gate.conditional_coverage > self.gate.pass_coverage {
            warnings.push(format!(
                "gate.conditional_coverage ({}) exceeds pass_coverage ({})",
                self.gate.conditional_coverage, self.gate.pass_coverage
            ));
        }
        if !(0.0..=1.0).contains(&self.build.degraded_below_fraction) {
            warnings.push(format!(
                "build.degraded_below_fraction must be within 0..=1 (got {})",
                self.build.degraded_below_fraction
            ));
        }
        if self.ingest.chunk_target_words > self.ingest.chunk_max_words {
            warnings.push(format!(
                "ingest.chunk_target_words ({}) exceeds chunk_max_words ({})",
                self.ingest.chunk_target_words, self.ingest.chunk_max_words
            ));
        }
        if self.reasoning.timeout_secs == 0 {
            warnings.push("reasoning.timeout_secs of 0 disables every call".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.jobs.max_attempts, 3);
        assert_eq!(settings.fanout.levels.len(), 7);
        assert_eq!(settings.fanout.levels[0], "surface");
        assert_eq!(settings.gate.max_autocorrect_iterations, 2);
        assert_eq!(settings.reasoning.timeout_secs, 50);
        assert_eq!(settings.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_partial_sections() {
        let content = r#"
[jobs]
max_attempts = 5

[fanout]
levels = ["surface", "academic"]

[logging]
format = "json"
"#;
        let settings = Settings::parse(content).unwrap();
        assert_eq!(settings.jobs.max_attempts, 5);
        assert_eq!(settings.jobs.backoff_base_ms, 2_000);
        assert_eq!(settings.fanout.levels, vec!["surface", "academic"]);
        assert_eq!(settings.fanout.expected_chunks_per_batch, 5);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_rejects_bad_toml() {
        assert!(Settings::parse("[jobs\nmax_attempts = ").is_err());
    }

    #[test]
    fn test_retry_policy_from_job_settings() {
        let policy = JobSettings::default().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_base, TimeDelta::seconds(2));
        assert_eq!(policy.backoff_max, TimeDelta::seconds(60));
    }

    #[test]
    fn test_validate_defaults_clean() {
        assert!(Settings::default().validate().is_empty());
    }

    #[test]
    fn test_validate_flags_inverted_staleness() {
        let mut settings = Settings::default();
        settings.fanout.orphan_after_secs = 3_600;
        settings.fanout.hard_fail_after_secs = 60;
        let warnings = settings.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("hard_fail_after_secs"));
    }

    #[test]
    fn test_ingest_and_query_defaults() {
        let settings = Settings::parse("[ingest]\nmin_words = 100\n").unwrap();
        assert_eq!(settings.ingest.min_words, 100);
        assert_eq!(settings.ingest.chunk_max_words, 320);
        assert_eq!(settings.query.max_chunks, 20);
        assert_eq!(settings.query.default_confidence, 0.7);
    }

    #[test]
    fn test_validate_flags_inverted_chunk_sizes() {
        let mut settings = Settings::default();
        settings.ingest.chunk_target_words = 400;
        assert!(settings.validate().iter().any(|w| w.contains("chunk_target_words")));
    }

    #[test]
    fn test_validate_flags_empty_levels() {
        let mut settings = Settings::default();
        settings.fanout.levels.clear();
        assert!(settings.validate().iter().any(|w| w.contains("levels")));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        let mut settings = Settings::default();
        settings.server.port = 9191;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9191);
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Settings::load(&dir.path().join(SETTINGS_FILE)).is_err());
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
