//! CLI commands for emu-harness
//!
//! Each command loads configuration, applies its overrides and drives the
//! emulator bridge.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use emu_harness_core::{HarnessConfig, HarnessError};
use emu_harness_emulator_bridge::{
    CommandOutcome, ConsoleClient, EmulatorLifecycle, LeaseKey, PortAllocator, ProcessSupervisor,
    TokioSupervisor,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Load the explicit config file, or the platform one
pub async fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    let config = match path {
        Some(path) => HarnessConfig::load_from(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => HarnessConfig::load().await?,
    };
    Ok(config)
}

fn print_transcript(outcome: &CommandOutcome) {
    for line in &outcome.transcript {
        println!("{}", line);
    }
}

/// Full lifecycle: boot, run commands, tear down
pub struct StartCommand {
    pub avd: Option<String>,
    pub first_boot: bool,
    pub commands: Vec<String>,
    pub command_timeout: Duration,
    pub hold: bool,
    pub capture_logcat: bool,
    pub output: Option<PathBuf>,
}

impl StartCommand {
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(ref avd) = self.avd {
            config.emulator.avd_name = Some(avd.clone());
        }
        if let Some(ref output) = self.output {
            config.output.dir = output.clone();
        }
        if self.capture_logcat {
            config.output.capture_logcat = true;
        }
    }

    /// Execute the start command
    pub async fn execute(&self, mut config: HarnessConfig) -> Result<()> {
        self.apply(&mut config);
        let boot_timeout = config.boot.timeout_secs;

        let allocator = Arc::new(PortAllocator::new(config.ports.clone())?);
        let supervisor: Arc<dyn ProcessSupervisor> = Arc::new(TokioSupervisor::new());
        let mut lifecycle = EmulatorLifecycle::new(config, allocator, supervisor)?;

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                on_interrupt.cancel();
            }
        });

        if !lifecycle.start_with_cancel(self.first_boot, &cancel).await? {
            if cancel.is_cancelled() {
                return Err(HarnessError::Cancelled.into());
            }
            return Err(HarnessError::BootTimeout(boot_timeout).into());
        }

        let result = self.drive(&mut lifecycle, &cancel).await;

        let report = lifecycle.teardown().await;
        if !report.ok() {
            for step in report.steps.iter().filter(|s| !s.ok()) {
                warn!("Teardown {}: {}", step.step.name(), step.errors.join("; "));
            }
        }
        result
    }

    async fn drive(&self, lifecycle: &mut EmulatorLifecycle, cancel: &CancellationToken) -> Result<()> {
        if let Some(lease) = lifecycle.lease() {
            println!("{} booted (console port {})", lease.serial(), lease.command_port);
        }

        let mut failed = Vec::new();
        for command in &self.commands {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(HarnessError::Cancelled.into()),
                outcome = lifecycle.send_command(command, self.command_timeout) => outcome?,
            };
            print_transcript(&outcome);
            if !outcome.success {
                failed.push(outcome.command.clone());
            }
        }

        if self.hold {
            println!("Holding emulator; press Ctrl-C to stop");
            cancel.cancelled().await;
        }

        if !failed.is_empty() {
            anyhow::bail!("console commands failed: {}", failed.join(", "));
        }
        Ok(())
    }
}

/// One console command against an already running instance
pub struct ConsoleCommand {
    pub port: u16,
    pub command: String,
    pub timeout: Duration,
}

impl ConsoleCommand {
    /// Execute the console command
    pub async fn execute(&self, config: &HarnessConfig) -> Result<()> {
        let client = ConsoleClient::from_config(&config.console);
        let outcome = client.execute(self.port, &self.command, self.timeout).await;
        print_transcript(&outcome);
        outcome.into_result()?;
        Ok(())
    }
}

/// Port lease diagnostics
pub struct PortsCommand {
    pub json: bool,
}

impl PortsCommand {
    /// Reserve a lease, print it, release it
    pub async fn execute(&self, config: &HarnessConfig) -> Result<()> {
        let allocator = PortAllocator::new(config.ports.clone())?;
        let lease = allocator.lease(&LeaseKey::random())?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&lease)?);
        } else {
            println!("serial:             {}", lease.serial());
            println!("command port:       {}", lease.command_port);
            println!("bridge port:        {}", lease.bridge_port);
            println!("bridge server port: {}", lease.bridge_server_port);
            println!("callback port:      {}", lease.callback_port);
        }

        allocator.release(&lease);
        Ok(())
    }
}
