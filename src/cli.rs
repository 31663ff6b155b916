//! Command-line interface for voicelink
//!
//! Handles argument parsing, settings overrides and logging configuration.

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

use crate::audio::WavRecorder;
use crate::settings::Settings;

/// voicelink - Talk to a realtime speech model from the terminal
#[derive(Parser, Debug)]
#[command(name = "voicelink")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Settings file (default: ~/.config/voicelink/settings.json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the endpoint URL
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Override the remote model name
    #[arg(long)]
    pub model: Option<String>,

    /// Prebuilt voice for model speech
    #[arg(long)]
    pub voice: Option<String>,

    /// Save microphone and model audio of the session as WAV files
    #[arg(long)]
    pub record: bool,

    /// Directory for --record output
    #[arg(long, value_name = "DIR")]
    pub record_dir: Option<PathBuf>,

    /// Write the effective settings to the settings file and exit
    #[arg(long)]
    pub save_settings: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Settings::default_path)
    }

    /// Apply command-line overrides on top of loaded settings
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(endpoint) = &self.endpoint {
            settings.endpoint = endpoint.clone();
        }
        if let Some(model) = &self.model {
            settings.model = model.clone();
        }
        if let Some(voice) = &self.voice {
            settings.voice = Some(voice.clone());
        }
        if let Some(dir) = &self.record_dir {
            settings.record_dir = Some(dir.clone());
        } else if self.record && settings.record_dir.is_none() {
            settings.record_dir = Some(WavRecorder::default_dir());
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    builder.filter_module("voicelink", args.log_level());

    // Socket and TLS internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("tungstenite", args.log_level());
        builder.filter_module("tokio_tungstenite", args.log_level());
        builder.filter_module("rustls", args.log_level());
    }

    builder.format_timestamp_millis().init();
}
