//! Process Supervision
//!
//! Starts and kills long-running processes and runs short commands with
//! captured output. The lifecycle only depends on the [`ProcessSupervisor`]
//! trait, so tests can script every process interaction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use emu_harness_core::HarnessError;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Process errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Executable not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{0}` timed out after {1:?}")]
    TimedOut(String, Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProcessError> for HarnessError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NotFound(_) | ProcessError::Spawn { .. } => {
                HarnessError::ProcessLaunchFailed(err.to_string())
            }
            ProcessError::TimedOut(..) => HarnessError::Process(err.to_string()),
            ProcessError::Io(e) => HarnessError::Io(e),
        }
    }
}

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn to_tokio(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Output of a short-lived command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// Exit code, `None` when killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Handle to a spawned long-running process
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    child: Option<Child>,
    killed: bool,
}

impl ProcessHandle {
    /// Wrap a spawned child
    pub fn from_child(name: impl Into<String>, child: Child) -> Self {
        Self {
            name: name.into(),
            pid: child.id(),
            child: Some(child),
            killed: false,
        }
    }

    /// A handle with no OS process behind it; alive until killed
    pub fn detached(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: None,
            child: None,
            killed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Check if the process is still running
    pub fn is_alive(&mut self) -> bool {
        if self.killed {
            return false;
        }
        match self.child {
            Some(ref mut child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Exit code if the process has already exited
    pub fn exit_code(&mut self) -> Option<i32> {
        self.child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
            .and_then(|status| status.code())
    }

    /// Take the stdout pipe
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|c| c.stdout.take())
    }

    /// Take the stderr pipe
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|c| c.stderr.take())
    }

    /// Kill the process. Killing a process that already exited is a no-op.
    pub async fn kill(&mut self) -> Result<(), ProcessError> {
        if self.killed {
            return Ok(());
        }
        if let Some(ref mut child) = self.child {
            if child.try_wait()?.is_none() {
                child.kill().await?;
                info!("Killed process: {}", self.name);
            } else {
                debug!("Process {} already exited", self.name);
            }
        }
        self.killed = true;
        Ok(())
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("killed", &self.killed)
            .finish()
    }
}

/// Process control used by the emulator lifecycle
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Run a command to completion, killing it once `timeout` passes
    async fn run(&self, command: &ProcessCommand, timeout: Duration) -> Result<RunOutput, ProcessError>;

    /// Start a long-running process
    async fn launch(&self, command: &ProcessCommand) -> Result<ProcessHandle, ProcessError>;

    /// Stop a process started by [`launch`](Self::launch)
    async fn kill(&self, handle: &mut ProcessHandle) -> Result<(), ProcessError> {
        handle.kill().await
    }
}

/// Supervisor backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioSupervisor;

impl TokioSupervisor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSupervisor for TokioSupervisor {
    async fn run(&self, command: &ProcessCommand, timeout: Duration) -> Result<RunOutput, ProcessError> {
        debug!("run: {}", command);

        let child = command.to_tokio().spawn().map_err(|source| spawn_error(command, source))?;

        // dropping the wait future drops the child, and kill_on_drop reaps it
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(RunOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
            Err(_) => {
                warn!("`{}` did not finish within {:?}", command, timeout);
                Err(ProcessError::TimedOut(command.to_string(), timeout))
            }
        }
    }

    async fn launch(&self, command: &ProcessCommand) -> Result<ProcessHandle, ProcessError> {
        info!("launch: {}", command);

        let child = command.to_tokio().spawn().map_err(|source| spawn_error(command, source))?;
        let name = command
            .program()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| command.program().display().to_string());

        Ok(ProcessHandle::from_child(name, child))
    }
}

fn spawn_error(command: &ProcessCommand, source: std::io::Error) -> ProcessError {
    if source.kind() == std::io::ErrorKind::NotFound {
        ProcessError::NotFound(command.program().to_path_buf())
    } else {
        ProcessError::Spawn {
            program: command.program().display().to_string(),
            source,
        }
    }
}
