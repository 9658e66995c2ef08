//! ADB (Android Debug Bridge) Client
//!
//! Builds bridge invocations for one instance and runs them through a
//! [`ProcessSupervisor`]. Each instance gets its own bridge server port so
//! concurrent lifecycles never share a daemon.

use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::supervisor::{ProcessCommand, ProcessError, ProcessSupervisor};

/// Environment variable selecting the bridge server port
pub const ADB_SERVER_PORT_ENV: &str = "ANDROID_ADB_SERVER_PORT";

/// ADB errors
#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("ADB command failed: {0}")]
    CommandFailed(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// ADB Client
#[derive(Debug, Clone)]
pub struct AdbClient {
    sdk_path: PathBuf,
    server_port: Option<u16>,
}

impl AdbClient {
    /// Create a new ADB client
    pub fn new(sdk_path: PathBuf) -> Self {
        Self {
            sdk_path,
            server_port: None,
        }
    }

    /// Talk to (and start, if needed) the bridge server on `port`
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = Some(port);
        self
    }

    pub fn server_port(&self) -> Option<u16> {
        self.server_port
    }

    /// Get the ADB executable path
    pub fn adb_path(&self) -> PathBuf {
        let platform_tools = self.sdk_path.join("platform-tools");
        if cfg!(windows) {
            platform_tools.join("adb.exe")
        } else {
            platform_tools.join("adb")
        }
    }

    /// An adb invocation with the instance's server port exported
    pub fn command(&self, args: &[&str]) -> ProcessCommand {
        let cmd = ProcessCommand::new(self.adb_path()).args(args.iter().copied());
        match self.server_port {
            Some(port) => cmd.env(ADB_SERVER_PORT_ENV, port.to_string()),
            None => cmd,
        }
    }

    /// An adb invocation targeting one device
    pub fn device_command(&self, serial: &str, args: &[&str]) -> ProcessCommand {
        let mut full_args = vec!["-s", serial];
        full_args.extend(args);
        self.command(&full_args)
    }

    /// `adb -s <serial> shell <command>`
    pub fn shell_command(&self, serial: &str, command: &str) -> ProcessCommand {
        self.device_command(serial, &["shell", command])
    }

    /// `adb -s <serial> logcat -v time`
    pub fn logcat_command(&self, serial: &str) -> ProcessCommand {
        self.device_command(serial, &["logcat", "-v", "time"])
    }

    /// Run a command and return its stdout, failing on a non-zero exit
    pub async fn run(
        &self,
        supervisor: &dyn ProcessSupervisor,
        command: &ProcessCommand,
        timeout: Duration,
    ) -> Result<String, AdbError> {
        let output = supervisor.run(command, timeout).await?;
        if !output.success() {
            return Err(AdbError::CommandFailed(format!(
                "`{}` exited with {:?}: {}",
                command,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Kill the bridge server this client talks to
    pub async fn kill_server(
        &self,
        supervisor: &dyn ProcessSupervisor,
        timeout: Duration,
    ) -> Result<(), AdbError> {
        debug!("Stopping adb server on port {:?}", self.server_port);
        self.run(supervisor, &self.command(&["kill-server"]), timeout).await?;
        Ok(())
    }
}
