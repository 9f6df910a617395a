use std::path::Path;

use anyhow::Context;
use clap::Subcommand;
use storyflow_core::config::{Config, WarnLevel};
use storyflow_core::paths;

use crate::output::print_json;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective config (file merged over defaults)
    Show,
    /// Validate the config for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if json {
        print_json(&config)
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
        Ok(())
    }
}

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();
    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();

    if json {
        print_json(&serde_json::json!({
            "path": paths::config_path(root),
            "errors": errors,
            "warnings": warnings,
        }))?;
    } else {
        for w in &warnings {
            let tag = if w.level == WarnLevel::Error { "error" } else { "warning" };
            println!("[{tag}] {}", w.message);
        }
        if warnings.is_empty() {
            println!("{}: ok", paths::CONFIG_FILE);
        }
    }

    if errors > 0 {
        anyhow::bail!("{errors} config error(s) in {}", paths::CONFIG_FILE);
    }
    Ok(())
}
