//! Configuration view, validation and init: `phaseline config`.

use anyhow::Result;

use phaseline::config::Config;
use phaseline::settings::Settings;

use super::super::ConfigCommands;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("phaseline configuration");
            println!("=======================");
            println!();
            if config.settings_file_found {
                println!("Config file: {}", config.settings_path.display());
            } else {
                println!("No config file at {} (using defaults)", config.settings_path.display());
            }
            println!("Database:    {}", config.db_path.display());
            println!(
                "API key:     {} ({})",
                if config.api_key.is_some() { "set" } else { "not set" },
                config.settings.reasoning.api_key_env
            );
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();
            print!("{}", toml::to_string_pretty(&config.settings)?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.settings.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            let path = &config.settings_path;
            if path.exists() {
                println!("{} already exists.", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Settings::default().save(path)?;
            println!("Created {}", path.display());
        }
    }
    Ok(())
}
