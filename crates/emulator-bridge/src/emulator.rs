//! Emulator Launcher
//!
//! Builds the emulator invocation for one port lease and listens for the
//! console report the emulator sends once its console is up.

use std::path::PathBuf;
use std::time::Duration;

use emu_harness_core::config::EmulatorConfig;
use emu_harness_core::{HarnessError, Result};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::adb::ADB_SERVER_PORT_ENV;
use crate::ports::PortLease;
use crate::supervisor::ProcessCommand;

/// Largest console report we accept
const MAX_REPORT_LEN: u64 = 64;

/// Emulator launch options
#[derive(Debug, Clone)]
pub struct EmulatorOptions {
    pub avd_name: String,
    /// GPU mode (auto, host, swiftshader_indirect, etc.)
    pub gpu: Option<String>,
    pub no_audio: bool,
    pub no_window: bool,
    pub no_boot_anim: bool,
    /// Memory size in MB
    pub memory: Option<u32>,
    pub wipe_data: bool,
    /// Seconds the emulator keeps trying to deliver its console report;
    /// `None` disables the report
    pub report_timeout_secs: Option<u64>,
    /// Additional arguments
    pub extra_args: Vec<String>,
}

impl EmulatorOptions {
    pub fn from_config(config: &EmulatorConfig) -> Result<Self> {
        let avd_name = config
            .avd_name
            .clone()
            .ok_or_else(|| HarnessError::Config("emulator.avd_name is not set".into()))?;

        Ok(Self {
            avd_name,
            gpu: config.gpu.clone(),
            no_audio: config.no_audio,
            no_window: config.no_window,
            no_boot_anim: config.no_boot_anim,
            memory: config.memory_mb,
            wipe_data: config.wipe_data,
            report_timeout_secs: config.report_console.then_some(config.report_timeout_secs),
            extra_args: config.extra_args.clone(),
        })
    }

    pub fn reports_console(&self) -> bool {
        self.report_timeout_secs.is_some()
    }

    /// Convert to command line arguments for `lease`
    pub fn to_args(&self, lease: &PortLease) -> Vec<String> {
        let mut args = vec![
            "-avd".to_string(),
            self.avd_name.clone(),
            "-ports".to_string(),
            format!("{},{}", lease.command_port, lease.bridge_port),
        ];

        if let Some(max) = self.report_timeout_secs {
            args.push("-report-console".to_string());
            args.push(format!("tcp:{},max={}", lease.callback_port, max));
        }

        if let Some(ref gpu) = self.gpu {
            args.push("-gpu".to_string());
            args.push(gpu.clone());
        }

        if self.no_audio {
            args.push("-no-audio".to_string());
        }

        if self.no_window {
            args.push("-no-window".to_string());
        }

        if self.no_boot_anim {
            args.push("-no-boot-anim".to_string());
        }

        if let Some(memory) = self.memory {
            args.push("-memory".to_string());
            args.push(memory.to_string());
        }

        if self.wipe_data {
            args.push("-wipe-data".to_string());
        }

        args.extend(self.extra_args.iter().cloned());

        args
    }
}

/// Emulator launcher
#[derive(Debug, Clone)]
pub struct EmulatorLauncher {
    sdk_path: PathBuf,
}

impl EmulatorLauncher {
    pub fn new(sdk_path: PathBuf) -> Self {
        Self { sdk_path }
    }

    /// Get the emulator executable path
    pub fn emulator_path(&self) -> PathBuf {
        let emulator_dir = self.sdk_path.join("emulator");
        if cfg!(windows) {
            emulator_dir.join("emulator.exe")
        } else {
            emulator_dir.join("emulator")
        }
    }

    /// The launch command for `options` on `lease`. The instance registers
    /// with the bridge server dedicated to the lease.
    pub fn command(&self, options: &EmulatorOptions, lease: &PortLease) -> ProcessCommand {
        let args = options.to_args(lease);
        debug!("Emulator args: {:?}", args);

        ProcessCommand::new(self.emulator_path())
            .args(args)
            .env(ADB_SERVER_PORT_ENV, lease.bridge_server_port.to_string())
    }
}

/// Receives the console port the emulator reports after launch
#[derive(Debug)]
pub struct ConsoleReportListener {
    listener: TcpListener,
    port: u16,
}

impl ConsoleReportListener {
    /// Bind the callback port. Must happen before the emulator starts.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
            HarnessError::ProcessLaunchFailed(format!("cannot listen on callback port {}: {}", port, e))
        })?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for one report and return the console port it names
    pub async fn receive(self, timeout: Duration) -> Result<u16> {
        let report = tokio::time::timeout(timeout, async {
            let (stream, peer) = self.listener.accept().await?;
            debug!("Console report connection from {}", peer);
            let mut text = String::new();
            stream.take(MAX_REPORT_LEN).read_to_string(&mut text).await?;
            Ok::<_, std::io::Error>(text)
        })
        .await
        .map_err(|_| {
            HarnessError::ProcessLaunchFailed(format!(
                "no console report on port {} within {:?}",
                self.port, timeout
            ))
        })?
        .map_err(|e| HarnessError::ProcessLaunchFailed(format!("reading console report: {}", e)))?;

        let port = report.trim().parse::<u16>().map_err(|_| {
            HarnessError::ProcessLaunchFailed(format!("malformed console report {:?}", report.trim()))
        })?;
        info!("Emulator reported console port {}", port);
        Ok(port)
    }
}
