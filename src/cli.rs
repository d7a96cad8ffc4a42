//! # CLI Arguments
//!
//! Command-line argument definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use ventai_autoclicker::config::{ConfigOverlay, Preset};
use ventai_autoclicker::logging::LogFormat;

/// Keeps an IDE chat session moving.
///
/// Clicks Continue / Accept All / recovery buttons as they appear and types a
/// reactivation phrase when the chat stalls. Move the mouse into any screen
/// corner to stop.
#[derive(Parser, Debug)]
#[command(name = "ventai-autoclicker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (TOML). Defaults to the per-user config if present
    #[arg(short, long, global = true, env = "AUTOCLICKER_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Timing preset
    #[arg(short, long, global = true, value_enum)]
    pub preset: Option<Preset>,

    /// Seconds between ticks
    #[arg(long, global = true, value_name = "SECONDS")]
    pub tick_interval: Option<f64>,

    /// Identical consecutive frames that count as a stall
    #[arg(long, global = true, value_name = "K")]
    pub stall_frames: Option<usize>,

    /// Seconds without a visual change that count as a stall
    #[arg(long, global = true, value_name = "SECONDS")]
    pub stall_age: Option<f64>,

    /// Max distance between Accept All and Continue for the combined click
    #[arg(long, global = true, value_name = "PIXELS")]
    pub proximity: Option<f64>,

    /// Template match acceptance cutoff (0-1]
    #[arg(long, global = true, value_name = "SCORE")]
    pub confidence: Option<f32>,

    /// Phrase typed into the chat input on stall
    #[arg(long, global = true)]
    pub phrase: Option<String>,

    /// Directory holding the button templates
    #[arg(short, long, global = true, value_name = "DIR")]
    pub template_dir: Option<PathBuf>,

    /// Disable the screen-corner fail-safe
    #[arg(long, global = true)]
    pub no_failsafe: bool,

    /// Detect and log, but never inject input
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Stop after this many ticks
    #[arg(long, global = true, value_name = "N")]
    pub max_ticks: Option<u64>,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the autoclicker loop (default)
    Run,

    /// Validate configuration and templates, then exit
    Check,

    /// Print the effective configuration as TOML
    Config,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }

    /// Flags as the top configuration layer.
    pub fn overlay(&self) -> ConfigOverlay {
        ConfigOverlay {
            preset: self.preset,
            tick_interval_seconds: self.tick_interval,
            stall_identical_frames: self.stall_frames,
            stall_age_seconds: self.stall_age,
            proximity_threshold_pixels: self.proximity,
            confidence_floor: self.confidence,
            reactivation_phrase: self.phrase.clone(),
            corner_failsafe_enabled: self.no_failsafe.then_some(false),
            template_dir: self.template_dir.clone(),
            max_ticks: self.max_ticks,
            dry_run: self.dry_run.then_some(true),
            ..Default::default()
        }
    }
}
