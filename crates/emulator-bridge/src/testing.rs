//! Scripted process supervisor for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::supervisor::{ProcessCommand, ProcessError, ProcessHandle, ProcessSupervisor, RunOutput};

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Output(RunOutput),
    Fail,
    Hang,
}

impl Step {
    pub(crate) fn output(stdout: &str) -> Self {
        Step::Output(RunOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    pub(crate) fn exit(code: i32, stderr: &str) -> Self {
        Step::Output(RunOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }
}

/// Answers `run` calls from a script and hands out detached handles
pub(crate) struct ScriptedSupervisor {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    fail_launch: bool,
    exit_on_launch: bool,
    runs: Mutex<Vec<ProcessCommand>>,
    launches: Mutex<Vec<ProcessCommand>>,
    kills: AtomicUsize,
}

impl ScriptedSupervisor {
    /// Play `steps` in order, then report failure for every further run
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self::build(steps, Step::Fail)
    }

    /// Answer every run with `step`
    pub(crate) fn repeating(step: Step) -> Self {
        Self::build(Vec::new(), step)
    }

    fn build(steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback,
            fail_launch: false,
            exit_on_launch: false,
            runs: Mutex::new(Vec::new()),
            launches: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    /// Launched processes are already gone
    pub(crate) fn exiting_launch(mut self) -> Self {
        self.exit_on_launch = true;
        self
    }

    pub(crate) fn run_count(&self) -> usize {
        self.runs.lock().len()
    }

    pub(crate) fn runs(&self) -> Vec<ProcessCommand> {
        self.runs.lock().clone()
    }

    pub(crate) fn last_run(&self) -> Option<ProcessCommand> {
        self.runs.lock().last().cloned()
    }

    pub(crate) fn launches(&self) -> Vec<ProcessCommand> {
        self.launches.lock().clone()
    }

    pub(crate) fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessSupervisor for ScriptedSupervisor {
    async fn run(&self, command: &ProcessCommand, timeout: Duration) -> Result<RunOutput, ProcessError> {
        self.runs.lock().push(command.clone());
        let step = self
            .steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Output(output) => Ok(output),
            Step::Fail => Err(ProcessError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "scripted failure",
            ))),
            Step::Hang => {
                tokio::time::sleep(timeout * 10).await;
                Err(ProcessError::TimedOut(command.to_string(), timeout))
            }
        }
    }

    async fn launch(&self, command: &ProcessCommand) -> Result<ProcessHandle, ProcessError> {
        self.launches.lock().push(command.clone());
        if self.fail_launch {
            return Err(ProcessError::NotFound(command.program().to_path_buf()));
        }
        let mut handle = ProcessHandle::detached("scripted");
        if self.exit_on_launch {
            handle.kill().await?;
        }
        Ok(handle)
    }

    async fn kill(&self, handle: &mut ProcessHandle) -> Result<(), ProcessError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        handle.kill().await
    }
}
