//! Configuration view and validation: `flowmaster config`.

use anyhow::{Context, Result};

use flowmaster::config::OrchestratorConfig;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(
    cli: &Cli,
    effective: &OrchestratorConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = &cli.config;

    match command {
        None | Some(ConfigCommands::Show) => {
            if cli.json {
                return super::print_json(effective);
            }
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found, using defaults", config_path.display());
            }
            println!("Effective values (with env/CLI overrides):");
            println!();
            let rendered = toml::to_string_pretty(effective)
                .context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let problems = effective.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for problem in &problems {
                    println!("  - {}", console::style(problem).yellow());
                }
                anyhow::bail!("{} configuration problem(s)", problems.len());
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            OrchestratorConfig::default().save(config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
