//! `histsync config`: show the resolved configuration.

use anyhow::{Context, Result};
use histsync::{histsync_home, Config};
use std::path::Path;

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    /// Show resolved configuration in JSON format
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: &ConfigArgs, config: &Config, source: Option<&Path>) -> Result<()> {
    let home = histsync_home();

    if args.json {
        let out = serde_json::json!({
            "home": home.to_string_lossy(),
            "config_file": source.map(|p| p.to_string_lossy().into_owned()),
            "config": config,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("HISTSYNC CONFIGURATION");
    println!("======================");
    println!();
    println!("Home:   {}", home.display());
    match source {
        Some(path) => println!("File:   {}", path.display()),
        None => println!(
            "File:   (none, defaults in use; create {} to override)",
            home.join("config.toml").display()
        ),
    }
    println!();
    print!(
        "{}",
        toml::to_string_pretty(config).context("Failed to render configuration")?
    );
    Ok(())
}
