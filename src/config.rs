use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::pipeline::{
    EventBus, HttpReasoningClient, Pipeline, PipelineContext, ReasoningService, TimeoutReasoning,
};
use crate::settings::{LogFormat, SETTINGS_FILE, Settings};
use crate::store::{DbHandle, PipelineDb};

pub const CONFIG_DIR: &str = ".phaseline";
pub const DEFAULT_DB_FILE: &str = "phaseline.db";

pub const ENV_DB: &str = "PHASELINE_DB";
pub const ENV_REASONING_URL: &str = "PHASELINE_REASONING_URL";
pub const ENV_MODEL: &str = "PHASELINE_MODEL";

/// Values given on the command line. They win over env and file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub verbose: bool,
    pub log_format: Option<LogFormat>,
}

/// Runtime configuration for phaseline.
///
/// Merges `phaseline.toml`, then environment variables, then CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// The settings file read, or the one `config init` would write
    pub settings_path: PathBuf,
    pub settings_file_found: bool,
    pub settings: Settings,
    pub db_path: PathBuf,
    pub api_key: Option<String>,
    pub verbose: bool,
}

impl Config {
    pub fn load(project_dir: PathBuf, overrides: CliOverrides) -> Result<Self> {
        Self::load_with_env(project_dir, overrides, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load`] with an explicit environment lookup.
    pub fn load_with_env<F>(project_dir: PathBuf, overrides: CliOverrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings_path = match &overrides.config {
            Some(path) => project_dir.join(path),
            None => project_dir.join(CONFIG_DIR).join(SETTINGS_FILE),
        };
        let settings_file_found = settings_path.exists();
        let mut settings = if settings_file_found {
            Settings::load(&settings_path)?
        } else if overrides.config.is_some() {
            anyhow::bail!("Config file not found: {}", settings_path.display());
        } else {
            Settings::default()
        };

        apply_env(&mut settings, &env);

        if let Some(db) = &overrides.db {
            settings.database.path = Some(db.to_string_lossy().into_owned());
        }
        if let Some(format) = overrides.log_format {
            settings.logging.format = format;
        }

        let db_path = match &settings.database.path {
            Some(path) => project_dir.join(path),
            None => project_dir.join(CONFIG_DIR).join(DEFAULT_DB_FILE),
        };
        let api_key = env(&settings.reasoning.api_key_env).filter(|k| !k.trim().is_empty());

        Ok(Self {
            project_dir,
            settings_path,
            settings_file_found,
            settings,
            db_path,
            api_key,
            verbose: overrides.verbose,
        })
    }

    pub fn reasoning_service(&self) -> Arc<dyn ReasoningService> {
        let reasoning = &self.settings.reasoning;
        let client = HttpReasoningClient::new(&reasoning.base_url, &reasoning.model, self.api_key.clone());
        Arc::new(TimeoutReasoning::new(client, reasoning.timeout()))
    }

    pub fn open_db(&self) -> Result<DbHandle> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let db = PipelineDb::new(&self.db_path)
            .with_context(|| format!("Failed to open database at {}", self.db_path.display()))?;
        debug!(path = %self.db_path.display(), "database opened");
        Ok(DbHandle::new(db))
    }

    /// Open the store and wire the HTTP reasoning client into a pipeline.
    pub fn pipeline(&self) -> Result<Pipeline> {
        self.pipeline_with(self.reasoning_service())
    }

    pub fn pipeline_with(&self, reasoning: Arc<dyn ReasoningService>) -> Result<Pipeline> {
        let ctx = PipelineContext::new(
            self.open_db()?,
            reasoning,
            Arc::new(self.settings.clone()),
            EventBus::default(),
        );
        Ok(Pipeline::new(ctx))
    }
}

fn apply_env<F>(settings: &mut Settings, env: &F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(db) = env(ENV_DB) {
        settings.database.path = Some(db);
    }
    if let Some(url) = env(ENV_REASONING_URL) {
        settings.reasoning.base_url = url;
    }
    if let Some(model) = env(ENV_MODEL) {
        settings.reasoning.model = model;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = tempdir().unwrap();
        let config =
            Config::load_with_env(dir.path().to_path_buf(), CliOverrides::default(), env_of(&[])).unwrap();
        assert!(!config.settings_file_found);
        assert_eq!(config.db_path, dir.path().join(".phaseline/phaseline.db"));
        assert_eq!(config.settings.reasoning.model, "gpt-4o-mini");
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_file_then_env_then_cli() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".phaseline")).unwrap();
        std::fs::write(
            dir.path().join(".phaseline/phaseline.toml"),
            "[database]\npath = \"from-file.db\"\n\n[reasoning]\nmodel = \"file-model\"\nbase_url = \"http://file\"\n",
        )
        .unwrap();

        let env = env_of(&[
            ("PHASELINE_MODEL", "env-model"),
            ("PHASELINE_DB", "from-env.db"),
            ("PHASELINE_API_KEY", "secret"),
        ]);
        let overrides = CliOverrides {
            db: Some(PathBuf::from("from-cli.db")),
            log_format: Some(LogFormat::Json),
            ..Default::default()
        };
        let config = Config::load_with_env(dir.path().to_path_buf(), overrides, env).unwrap();

        assert!(config.settings_file_found);
        assert_eq!(config.settings.reasoning.base_url, "http://file");
        assert_eq!(config.settings.reasoning.model, "env-model");
        assert_eq!(config.db_path, dir.path().join("from-cli.db"));
        assert_eq!(config.settings.logging.format, LogFormat::Json);
        assert_eq!(config.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_api_key_env_name_is_configurable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[reasoning]\napi_key_env = \"MY_KEY\"\n").unwrap();
        let overrides = CliOverrides {
            config: Some(path),
            ..Default::default()
        };
        let env = env_of(&[("MY_KEY", "k1"), ("PHASELINE_API_KEY", "ignored")]);
        let config = Config::load_with_env(dir.path().to_path_buf(), overrides, env).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("k1"));
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let dir = tempdir().unwrap();
        let overrides = CliOverrides {
            config: Some(PathBuf::from("missing.toml")),
            ..Default::default()
        };
        let err = Config::load_with_env(dir.path().to_path_buf(), overrides, env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[tokio::test]
    async fn test_pipeline_opens_database_file() {
        let dir = tempdir().unwrap();
        let config =
            Config::load_with_env(dir.path().to_path_buf(), CliOverrides::default(), env_of(&[])).unwrap();
        let pipeline = config.pipeline().unwrap();
        assert!(config.db_path.exists());
        assert!(pipeline.list(None, 10).await.unwrap().is_empty());
    }
}
