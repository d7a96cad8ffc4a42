//! # VentAI Autoclicker
//!
//! Entry point: load configuration, load templates, then hand the screen and
//! input devices to the control loop.

mod cli;

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

use cli::{Cli, Commands};
use ventai_autoclicker::capture::create_screen_capture;
use ventai_autoclicker::config::LoopConfig;
use ventai_autoclicker::input::create_input_simulator;
use ventai_autoclicker::{logging, startup, Error, Result, Shutdown};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.verbose);

    match dispatch(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_clean_exit() => {
            info!(reason = %e, "Stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(category = e.category(), error = %e, "Autoclicker failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<()> {
    let config = LoopConfig::load(cli.config.as_deref(), cli.overlay()).await?;

    match cli.command() {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Check => check(&config),
        Commands::Run => run(config).await,
    }
}

fn check(config: &LoopConfig) -> Result<()> {
    let templates = startup::load_templates(config)?;

    println!("Templates in {}:", config.template_dir.display());
    for kind in templates.kinds() {
        for asset in templates.variants(kind) {
            println!(
                "  {:<12} {:<24} {:>4}x{:<4} floor {:.2}",
                kind.as_str(),
                asset.name,
                asset.width(),
                asset.height(),
                asset.expected_confidence_floor.max(config.confidence_floor),
            );
        }
    }
    println!("Configuration OK");
    Ok(())
}

async fn run(config: LoopConfig) -> Result<()> {
    let shutdown = Shutdown::new();
    let mut control = startup::assemble(
        config,
        shutdown.clone(),
        || Ok(create_screen_capture()?),
        || Ok(create_input_simulator()?),
    )?;

    shutdown
        .install()
        .map_err(|e| Error::unexpected(format!("failed to install signal handler: {}", e)))?;

    control.run().await?;
    Ok(())
}
