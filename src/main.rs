//! emu-harness - ephemeral Android emulators for automated testing
//!
//! Entry point: parses arguments, installs logging and runs one command.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use emu_harness::cli::{Cli, Commands};
use emu_harness::commands::{load_config, ConsoleCommand, PortsCommand, StartCommand};
use emu_harness::core::{HarnessError, APP_NAME, VERSION};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber; `RUST_LOG` wins over `-v`
fn init_logging(verbose: u8) {
    let fallback = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Start {
            avd,
            first_boot,
            commands,
            command_timeout_ms,
            hold,
            logcat,
            output,
        } => {
            StartCommand {
                avd,
                first_boot,
                commands,
                command_timeout: Duration::from_millis(command_timeout_ms),
                hold,
                capture_logcat: logcat,
                output,
            }
            .execute(config)
            .await
        }
        Commands::Console {
            port,
            command,
            timeout_ms,
        } => {
            ConsoleCommand {
                port,
                command,
                timeout: Duration::from_millis(timeout_ms),
            }
            .execute(&config)
            .await
        }
        Commands::Ports { json } => PortsCommand { json }.execute(&config).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    debug!("{} v{}", APP_NAME, VERSION);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<HarnessError>() {
                Some(harness) => error!("{}", harness.user_message()),
                None => error!("{:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}
