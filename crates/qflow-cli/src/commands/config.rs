//! Config command implementation.

use std::path::Path;

use anyhow::{Context, Result};

use qflow_core::config::Config;

use super::{ConfigAction, ConfigArgs, GlobalArgs};

/// Run the config command.
pub fn run(args: ConfigArgs, global: &GlobalArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show => show(global),
        ConfigAction::Path => {
            let path = Config::config_path();
            if global.json {
                let output = serde_json::json!({
                    "path": path,
                    "exists": path.exists(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", path.display());
            }
            Ok(())
        }
        ConfigAction::Init { force } => {
            let path = Config::config_path();
            init_at(&path, force)?;
            if !global.quiet {
                println!("Wrote default configuration to {}", path.display());
            }
            Ok(())
        }
    }
}

fn show(global: &GlobalArgs) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    if global.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

/// Write the default configuration to `path`.
fn init_at(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to replace it)",
            path.display()
        );
    }
    Config::default()
        .save_to(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        init_at(&path, false).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.server.port, qflow_core::DEFAULT_PORT);
        assert_eq!(loaded.storage.path_template, "{date}");
    }

    #[test]
    fn test_init_refuses_to_replace_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 9000\n").unwrap();

        assert!(init_at(&path, false).is_err());
        assert_eq!(Config::load_from(&path).unwrap().server.port, 9000);

        init_at(&path, true).unwrap();
        assert_eq!(
            Config::load_from(&path).unwrap().server.port,
            qflow_core::DEFAULT_PORT
        );
    }
}
