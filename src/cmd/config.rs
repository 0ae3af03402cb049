//! Configuration view and validation commands: `launchpad config`.

use std::path::Path;

use anyhow::Result;
use launchpad::config::PlatformConfig;

use super::super::ConfigCommands;

pub fn cmd_config(
    config_path: &Path,
    config: &PlatformConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No {} found, using defaults", config_path.display());
            }
            println!("# Effective values (with env overrides):");
            println!();
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration has {} problem(s):", problems.len());
                for problem in &problems {
                    println!("  - {}", problem);
                }
                anyhow::bail!("Invalid configuration");
            }
        }
    }
    Ok(())
}
