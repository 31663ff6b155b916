//! voicelink - Realtime voice conversations with a remote speech model
//!
//! This is the main entry point for the voicelink command-line client.

mod audio;
mod cli;
mod controller;
mod errors;
mod session;
mod settings;
mod tools;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use settings::Settings;

fn main() -> Result<()> {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    cli::init_logging(&args);

    let path = args.settings_path();
    let mut settings = Settings::load(&path).map_err(anyhow::Error::msg)?;
    args.apply(&mut settings);

    if args.save_settings {
        settings
            .save(&path)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Could not save settings to {}", path.display()))?;
        println!("Settings written to {}", path.display());
        return Ok(());
    }

    info!("Starting voicelink session with {}", settings.model);
    controller::run(settings)
}
