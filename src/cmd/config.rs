//! Configuration view and validation commands (`gavel config`).

use std::path::Path;

use anyhow::{Context, Result};

use gavel::config::GavelConfig;

use super::super::ConfigCommands;

pub fn cmd_config(
    config_path: &Path,
    config: &GavelConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!(
                    "No config file at {}, using defaults",
                    config_path.display()
                );
            }
            println!("Effective values (with env overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }
    Ok(())
}
