//! Emulator Lifecycle
//!
//! Drives one emulator instance from port reservation to teardown:
//!
//! 1. lease ports
//! 2. launch the emulator on them and wait for its console report
//! 3. wait for boot completion
//! 4. run console commands on request
//! 5. tear everything down
//!
//! Teardown runs on every failure inside [`EmulatorLifecycle::start`], can
//! be called any number of times, and still releases the ports when the
//! lifecycle is dropped without it.

use std::sync::Arc;
use std::time::Duration;

use emu_harness_core::{Event, EventBus, HarnessConfig, HarnessError, Result};
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adb::AdbClient;
use crate::boot::{cold_boot_timeout, BootReadinessPoller, BootSignal, BootWait};
use crate::capture::OutputCapture;
use crate::console::{CommandOutcome, ConsoleClient};
use crate::emulator::{ConsoleReportListener, EmulatorLauncher, EmulatorOptions};
use crate::ports::{LeaseKey, PortAllocator, PortLease};
use crate::supervisor::{ProcessHandle, ProcessSupervisor};

/// How often liveness is checked while waiting for the console report
const LIVENESS_TICK: Duration = Duration::from_millis(500);

/// Bound for the dedicated bridge server shutdown
const KILL_SERVER_TIMEOUT: Duration = Duration::from_secs(5);

/// How long teardown waits for captured pipes to drain
const CAPTURE_GRACE: Duration = Duration::from_secs(2);

pub const EMULATOR_LOG: &str = "emulator.log";
pub const LOGCAT_LOG: &str = "logcat.txt";

/// Teardown steps, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    KillProcess,
    ReleasePorts,
    CloseSessions,
    FlushCapture,
}

impl TeardownStep {
    pub const ALL: [TeardownStep; 4] = [
        TeardownStep::KillProcess,
        TeardownStep::ReleasePorts,
        TeardownStep::CloseSessions,
        TeardownStep::FlushCapture,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TeardownStep::KillProcess => "kill_process",
            TeardownStep::ReleasePorts => "release_ports",
            TeardownStep::CloseSessions => "close_sessions",
            TeardownStep::FlushCapture => "flush_capture",
        }
    }
}

/// Result of one teardown step
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: TeardownStep,
    /// Error messages; empty when the step succeeded
    pub errors: Vec<String>,
}

impl StepReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// What a teardown did
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    /// Empty when the lifecycle had already been torn down
    pub steps: Vec<StepReport>,
}

impl TeardownReport {
    pub fn ok(&self) -> bool {
        self.steps.iter().all(StepReport::ok)
    }

    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Running,
    TornDown,
}

/// One emulator instance under management
pub struct EmulatorLifecycle {
    config: HarnessConfig,
    key: LeaseKey,
    allocator: Arc<PortAllocator>,
    supervisor: Arc<dyn ProcessSupervisor>,
    events: Arc<EventBus>,
    launcher: EmulatorLauncher,
    adb: AdbClient,
    console: ConsoleClient,
    phase: Phase,
    lease: Option<PortLease>,
    process: Option<ProcessHandle>,
    logcat: Option<ProcessHandle>,
    captures: Vec<OutputCapture>,
    sessions: Vec<(u64, AbortHandle)>,
    next_session: u64,
}

impl EmulatorLifecycle {
    pub fn new(
        config: HarnessConfig,
        allocator: Arc<PortAllocator>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Result<Self> {
        let sdk_path = config
            .get_sdk_path()
            .ok_or_else(|| HarnessError::Config("Android SDK not found; set android.sdk_path".into()))?;
        let console = ConsoleClient::from_config(&config.console);

        Ok(Self {
            key: LeaseKey::random(),
            allocator,
            supervisor,
            events: Arc::new(EventBus::new()),
            launcher: EmulatorLauncher::new(sdk_path.clone()),
            adb: AdbClient::new(sdk_path),
            console,
            config,
            phase: Phase::Idle,
            lease: None,
            process: None,
            logcat: None,
            captures: Vec::new(),
            sessions: Vec::new(),
            next_session: 0,
        })
    }

    pub fn with_key(mut self, key: LeaseKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_console(mut self, console: ConsoleClient) -> Self {
        self.console = console;
        self
    }

    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn lease(&self) -> Option<&PortLease> {
        self.lease.as_ref()
    }

    pub fn serial(&self) -> Option<String> {
        self.lease.as_ref().map(PortLease::serial)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Bridge client bound to this instance's dedicated bridge server
    pub fn adb(&self) -> &AdbClient {
        &self.adb
    }

    /// Whether the emulator process is running
    pub fn is_alive(&mut self) -> bool {
        self.process.as_mut().map(ProcessHandle::is_alive).unwrap_or(false)
    }

    /// Launch the instance and wait for it to boot. `first_boot` stretches
    /// the boot timeout by the configured cold-boot factor.
    ///
    /// Returns `Ok(false)` when boot did not complete in time. Every failure
    /// tears the lifecycle down before returning.
    pub async fn start(&mut self, first_boot: bool) -> Result<bool> {
        self.start_with_cancel(first_boot, &CancellationToken::new()).await
    }

    /// Like [`start`](Self::start); cancelling stops the console report
    /// and boot waits and reports `Ok(false)`
    pub async fn start_with_cancel(&mut self, first_boot: bool, cancel: &CancellationToken) -> Result<bool> {
        if self.phase != Phase::Idle {
            return Err(HarnessError::InvalidState(format!(
                "lifecycle {} cannot start from {:?}",
                self.key, self.phase
            )));
        }
        self.phase = Phase::Starting;

        match self.launch_and_wait(first_boot, cancel).await {
            Ok(true) => {
                self.phase = Phase::Running;
                Ok(true)
            }
            Ok(false) => {
                self.teardown().await;
                Ok(false)
            }
            Err(e) => {
                error!("Lifecycle {} failed to start: {}", self.key, e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn launch_and_wait(&mut self, first_boot: bool, cancel: &CancellationToken) -> Result<bool> {
        let options = EmulatorOptions::from_config(&self.config.emulator)?;

        let lease = self.allocator.lease(&self.key)?;
        self.events.emit(Event::PortsLeased {
            command_port: lease.command_port,
            bridge_port: lease.bridge_port,
        });
        self.adb = self.adb.clone().with_server_port(lease.bridge_server_port);
        let serial = lease.serial();
        self.lease = Some(lease.clone());

        // must be listening before the emulator starts
        let report = if options.reports_console() {
            Some(ConsoleReportListener::bind(lease.callback_port).await?)
        } else {
            None
        };

        let command = self.launcher.command(&options, &lease);
        info!("Launching {} as {}", options.avd_name, serial);
        let mut process = self.supervisor.launch(&command).await?;
        let capture = OutputCapture::start(&mut process, &self.config.output.dir.join(EMULATOR_LOG)).await;
        self.process = Some(process);
        self.captures.push(capture?);
        self.events.emit(Event::EmulatorLaunched {
            avd_name: options.avd_name.clone(),
            command_port: lease.command_port,
        });

        if let Some(listener) = report {
            let timeout = Duration::from_secs(self.config.emulator.report_timeout_secs);
            let reported = match self.await_report(listener, timeout, cancel).await? {
                Some(port) => port,
                None => {
                    info!("Console report wait for {} cancelled", serial);
                    return Ok(false);
                }
            };
            self.events.emit(Event::ConsoleReported { port: reported });
            if reported != lease.command_port {
                return Err(HarnessError::ProcessLaunchFailed(format!(
                    "emulator reported console port {} but was given {}",
                    reported, lease.command_port
                )));
            }
        }

        let mut timeout = self.config.boot.timeout();
        if first_boot {
            timeout = cold_boot_timeout(timeout, self.config.boot.cold_boot_factor);
        }
        let signal = BootSignal::for_api_level(self.config.boot.api_level);
        let poller = BootReadinessPoller::new(Arc::clone(&self.supervisor), self.adb.clone())
            .with_probe_timeout(self.config.boot.probe_timeout());

        let started = Instant::now();
        let result = match self.process.as_mut() {
            Some(process) => {
                poller
                    .poll(&serial, &signal, timeout, cancel, &mut || process.is_alive())
                    .await
            }
            None => BootWait::ProcessExited,
        };

        match result {
            BootWait::Booted => {
                self.events.emit(Event::BootCompleted {
                    serial: serial.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                if self.config.output.capture_logcat {
                    self.start_logcat(&serial).await;
                }
                Ok(true)
            }
            BootWait::TimedOut => {
                warn!("{} did not boot within {:?}", serial, timeout);
                self.events.emit(Event::BootTimedOut {
                    serial,
                    timeout_ms: timeout.as_millis() as u64,
                });
                Ok(false)
            }
            BootWait::Cancelled => {
                info!("Boot wait for {} cancelled", serial);
                Ok(false)
            }
            BootWait::ProcessExited => {
                let code = self.process.as_mut().and_then(ProcessHandle::exit_code);
                Err(HarnessError::ProcessDiedEarly(format!(
                    "{} exited with {:?} before boot completed",
                    serial, code
                )))
            }
        }
    }

    /// Wait for the console report, giving up early if the process dies.
    /// `None` when cancelled.
    async fn await_report(
        &mut self,
        listener: ConsoleReportListener,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<u16>> {
        let receive = listener.receive(timeout);
        tokio::pin!(receive);
        let mut tick = tokio::time::interval(LIVENESS_TICK);

        loop {
            tokio::select! {
                reported = &mut receive => return reported.map(Some),
                _ = cancel.cancelled() => return Ok(None),
                _ = tick.tick() => {
                    if !self.is_alive() {
                        return Err(HarnessError::ProcessDiedEarly(
                            "emulator exited before reporting its console port".into(),
                        ));
                    }
                }
            }
        }
    }

    async fn start_logcat(&mut self, serial: &str) {
        let command = self.adb.logcat_command(serial);
        match self.supervisor.launch(&command).await {
            Ok(mut handle) => {
                let path = self.config.output.dir.join(LOGCAT_LOG);
                match OutputCapture::start(&mut handle, &path).await {
                    Ok(capture) => self.captures.push(capture),
                    Err(e) => warn!("Cannot capture logcat for {}: {}", serial, e),
                }
                self.logcat = Some(handle);
            }
            Err(e) => warn!("Cannot start logcat for {}: {}", serial, e),
        }
    }

    /// Run one console command against the running instance. Console
    /// failures are reported in the outcome, not as errors.
    pub async fn send_command(&mut self, command: &str, timeout: Duration) -> Result<CommandOutcome> {
        let port = match (self.phase, self.lease.as_ref()) {
            (Phase::Running, Some(lease)) => lease.command_port,
            _ => {
                return Err(HarnessError::InvalidState(format!(
                    "lifecycle {} is not running",
                    self.key
                )))
            }
        };
        if !self.is_alive() {
            return Err(HarnessError::ProcessDiedEarly(format!(
                "emulator on port {} is no longer running",
                port
            )));
        }

        let client = self.console.clone();
        let line = command.to_string();
        let task = tokio::spawn(async move { client.execute(port, &line, timeout).await });
        let id = self.next_session;
        self.next_session += 1;
        self.sessions.push((id, task.abort_handle()));

        let joined = task.await;
        self.sessions.retain(|(session, _)| *session != id);
        let outcome = joined.map_err(|e| {
            if e.is_cancelled() {
                HarnessError::Cancelled
            } else {
                HarnessError::UnexpectedIo(format!("console session panicked: {}", e))
            }
        })?;

        self.events.emit(Event::ConsoleCommandFinished {
            command: outcome.command.clone(),
            success: outcome.success,
            timed_out: outcome.timed_out,
        });
        Ok(outcome)
    }

    /// Stop the instance and give back everything it holds. Each step runs
    /// even if an earlier one failed; calling this again does nothing.
    pub async fn teardown(&mut self) -> TeardownReport {
        if self.phase == Phase::TornDown {
            debug!("Lifecycle {} already torn down", self.key);
            return TeardownReport::default();
        }
        self.phase = Phase::TornDown;

        let mut report = TeardownReport::default();
        for step in TeardownStep::ALL {
            let errors = match step {
                TeardownStep::KillProcess => self.kill_processes().await,
                TeardownStep::ReleasePorts => self.release_ports(),
                TeardownStep::CloseSessions => self.close_sessions(),
                TeardownStep::FlushCapture => self.flush_captures().await,
            };
            for e in &errors {
                warn!("Teardown step {} failed: {}", step.name(), e);
            }
            self.events.emit(Event::TeardownStep {
                step: step.name().to_string(),
                ok: errors.is_empty(),
            });
            report.steps.push(StepReport { step, errors });
        }

        let serial = self.serial().unwrap_or_default();
        info!("Lifecycle {} torn down", self.key);
        self.events.emit(Event::TornDown { serial });
        report
    }

    async fn kill_processes(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        let launched = self.process.is_some();

        for mut handle in self.process.take().into_iter().chain(self.logcat.take()) {
            if let Err(e) = self.supervisor.kill(&mut handle).await {
                errors.push(format!("{}: {}", handle.name(), e));
            }
        }

        if launched && self.adb.server_port().is_some() {
            // the server may never have started; nothing to report then
            if let Err(e) = self.adb.kill_server(self.supervisor.as_ref(), KILL_SERVER_TIMEOUT).await {
                debug!("Bridge server shutdown: {}", e);
            }
        }
        errors
    }

    fn release_ports(&mut self) -> Vec<String> {
        // keep the lease around for the serial; release is idempotent
        if let Some(ref lease) = self.lease {
            let released = self.allocator.release(lease);
            debug!("Released {} ports of {}", released, self.key);
        }
        Vec::new()
    }

    fn close_sessions(&mut self) -> Vec<String> {
        for (_, session) in self.sessions.drain(..) {
            session.abort();
        }
        Vec::new()
    }

    async fn flush_captures(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        for capture in self.captures.drain(..) {
            let path = capture.path().to_path_buf();
            match capture.stop(CAPTURE_GRACE).await {
                Ok(lines) => debug!("Captured {} lines to {:?}", lines, path),
                Err(e) => errors.push(format!("{:?}: {}", path, e)),
            }
        }
        errors
    }
}

impl Drop for EmulatorLifecycle {
    fn drop(&mut self) {
        if self.phase == Phase::TornDown {
            return;
        }
        warn!("Lifecycle {} dropped without teardown", self.key);
        // processes die with their handles
        self.release_ports();
        self.close_sessions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSupervisor, Step};
    use emu_harness_core::config::{PortConfig, PortRange};
    use std::path::PathBuf;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    struct Fixture {
        _dir: tempfile::TempDir,
        config: HarnessConfig,
        allocator: Arc<PortAllocator>,
    }

    /// Deterministic ports: command `base`, bridge `base + 1`, server
    /// `base + 100`, callback `base + 101`
    fn fixture(base: u16) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.android.sdk_path = Some(PathBuf::from("/sdk"));
        config.emulator.avd_name = Some("test_avd".into());
        config.emulator.report_console = false;
        config.boot.timeout_secs = 1;
        config.output.dir = dir.path().join("output");
        config.ports = PortConfig {
            command_range: PortRange::new(base, base + 100),
            aux_range: PortRange::new(base + 100, base + 200),
            ..PortConfig::default()
        };

        let allocator = PortAllocator::new(config.ports.clone())
            .unwrap()
            .with_probe(Arc::new(|_| true));
        Fixture {
            _dir: dir,
            config,
            allocator: Arc::new(allocator),
        }
    }

    fn lifecycle(fx: &Fixture, supervisor: &Arc<ScriptedSupervisor>) -> EmulatorLifecycle {
        let supervisor: Arc<dyn ProcessSupervisor> = supervisor.clone();
        EmulatorLifecycle::new(fx.config.clone(), Arc::clone(&fx.allocator), supervisor)
            .unwrap()
            .with_key(LeaseKey::new("test"))
    }

    #[tokio::test]
    async fn test_start_and_teardown() {
        let fx = fixture(46000);
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![Step::output("1")]));
        let mut lifecycle = lifecycle(&fx, &supervisor);
        let events = lifecycle.events().subscribe();

        assert!(lifecycle.start(false).await.unwrap());
        assert_eq!(lifecycle.phase(), Phase::Running);
        assert_eq!(lifecycle.serial().as_deref(), Some("emulator-46000"));
        assert_eq!(fx.allocator.reserved_count(), 4);

        let launch = &supervisor.launches()[0];
        assert_eq!(&launch.get_args()[..4], &["-avd", "test_avd", "-ports", "46000,46001"]);
        assert_eq!(launch.get_env("ANDROID_ADB_SERVER_PORT"), Some("46100"));
        assert_eq!(
            supervisor.runs()[0].get_env("ANDROID_ADB_SERVER_PORT"),
            Some("46100")
        );

        let report = lifecycle.teardown().await;
        assert!(report.ok());
        assert_eq!(
            report.steps.iter().map(|s| s.step).collect::<Vec<_>>(),
            TeardownStep::ALL.to_vec()
        );
        assert_eq!(fx.allocator.reserved_count(), 0);
        assert_eq!(supervisor.kill_count(), 1);
        assert_eq!(supervisor.last_run().unwrap().get_args(), &["kill-server"]);
        assert!(fx.config.output.dir.join(EMULATOR_LOG).exists());

        let received = events.drain();
        assert_eq!(
            received[0],
            Event::PortsLeased {
                command_port: 46000,
                bridge_port: 46001
            }
        );
        assert!(matches!(received[2], Event::BootCompleted { .. }));
        assert_eq!(received.last(), Some(&Event::TornDown { serial: "emulator-46000".into() }));
    }

    #[tokio::test]
    async fn test_second_teardown_is_noop() {
        let fx = fixture(46200);
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![Step::output("1")]));
        let mut lifecycle = lifecycle(&fx, &supervisor);
        let events = lifecycle.events().subscribe();

        lifecycle.start(false).await.unwrap();
        assert!(!lifecycle.teardown().await.is_noop());
        let runs = supervisor.run_count();
        events.drain();

        assert!(lifecycle.teardown().await.is_noop());
        assert!(events.drain().is_empty());
        assert_eq!(supervisor.kill_count(), 1);
        assert_eq!(supervisor.run_count(), runs);
    }

    #[tokio::test]
    async fn test_boot_timeout_tears_down() {
        let fx = fixture(46400);
        let supervisor = Arc::new(ScriptedSupervisor::repeating(Step::output("0")));
        let mut lifecycle = lifecycle(&fx, &supervisor);
        let events = lifecycle.events().subscribe();

        assert!(!lifecycle.start(false).await.unwrap());
        assert_eq!(lifecycle.phase(), Phase::TornDown);
        assert_eq!(fx.allocator.reserved_count(), 0);
        assert_eq!(supervisor.kill_count(), 1);
        assert!(events
            .drain()
            .iter()
            .any(|e| matches!(e, Event::BootTimedOut { timeout_ms: 1000, .. })));
    }

    #[tokio::test]
    async fn test_launch_failure_releases_ports() {
        let fx = fixture(46600);
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![]).failing_launch());
        let mut lifecycle = lifecycle(&fx, &supervisor);

        let result = lifecycle.start(false).await;
        assert!(matches!(result, Err(HarnessError::ProcessLaunchFailed(_))));
        assert_eq!(fx.allocator.reserved_count(), 0);
        assert_eq!(supervisor.kill_count(), 0);
    }

    #[tokio::test]
    async fn test_early_exit_is_not_a_timeout() {
        let fx = fixture(46800);
        let supervisor = Arc::new(ScriptedSupervisor::repeating(Step::output("0")).exiting_launch());
        let mut lifecycle = lifecycle(&fx, &supervisor);

        let result = lifecycle.start(false).await;
        assert!(matches!(result, Err(HarnessError::ProcessDiedEarly(_))));
        assert_eq!(supervisor.run_count(), 1, "only the kill-server call");
        assert_eq!(fx.allocator.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_avd_fails_before_leasing() {
        let mut fx = fixture(47000);
        fx.config.emulator.avd_name = None;
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![]));
        let mut lifecycle = lifecycle(&fx, &supervisor);

        assert!(matches!(lifecycle.start(false).await, Err(HarnessError::Config(_))));
        assert!(supervisor.launches().is_empty());
        assert_eq!(fx.allocator.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let fx = fixture(47200);
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![Step::output("1")]));
        let mut lifecycle = lifecycle(&fx, &supervisor);

        lifecycle.start(false).await.unwrap();
        assert!(matches!(lifecycle.start(false).await, Err(HarnessError::InvalidState(_))));
        lifecycle.teardown().await;
    }

    async fn report_port(callback_port: u16, port: u16) {
        for _ in 0..50 {
            if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", callback_port)).await {
                stream.write_all(port.to_string().as_bytes()).await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_console_report_verified() {
        let mut fx = fixture(47400);
        fx.config.emulator.report_console = true;
        fx.config.emulator.report_timeout_secs = 5;
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![Step::output("1")]));
        let mut lifecycle = lifecycle(&fx, &supervisor);
        let events = lifecycle.events().subscribe();

        tokio::spawn(report_port(47501, 47400));
        assert!(lifecycle.start(false).await.unwrap());

        let args = supervisor.launches()[0].get_args().to_vec();
        assert!(args.windows(2).any(|w| w == ["-report-console", "tcp:47501,max=5"]));
        assert!(events.drain().contains(&Event::ConsoleReported { port: 47400 }));
        lifecycle.teardown().await;
    }

    #[tokio::test]
    async fn test_console_report_mismatch() {
        let mut fx = fixture(47600);
        fx.config.emulator.report_console = true;
        fx.config.emulator.report_timeout_secs = 5;
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![Step::output("1")]));
        let mut lifecycle = lifecycle(&fx, &supervisor);

        tokio::spawn(report_port(47701, 5554));
        let result = lifecycle.start(false).await;
        assert!(matches!(result, Err(HarnessError::ProcessLaunchFailed(ref m)) if m.contains("5554")));
        assert_eq!(fx.allocator.reserved_count(), 0);
        assert_eq!(supervisor.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_console_report_wait() {
        let mut fx = fixture(48200);
        fx.config.emulator.report_console = true;
        fx.config.emulator.report_timeout_secs = 60;
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![Step::output("1")]));
        let mut lifecycle = lifecycle(&fx, &supervisor);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let booted = lifecycle.start_with_cancel(false, &cancel).await.unwrap();
        assert!(!booted);
        assert!(started.elapsed() < Duration::from_secs(5), "cancel ignored: {:?}", started.elapsed());
        assert_eq!(lifecycle.phase(), Phase::TornDown);
        assert_eq!(fx.allocator.reserved_count(), 0);
        assert_eq!(supervisor.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_send_command() {
        let fx = fixture(47800);
        let console = TcpListener::bind("127.0.0.1:47800").await.unwrap();
        tokio::spawn(async move {
            let (stream, _) = console.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write.write_all(b"OK\r\n").await.unwrap();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line == "quit" {
                    break;
                }
                write.write_all(format!("{}\r\nOK\r\n", line).as_bytes()).await.unwrap();
            }
        });

        let supervisor = Arc::new(ScriptedSupervisor::new(vec![Step::output("1")]));
        let mut lifecycle = lifecycle(&fx, &supervisor);
        let events = lifecycle.events().subscribe();

        assert!(lifecycle.start(false).await.unwrap());
        let outcome = lifecycle
            .send_command("network speed full", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.received().any(|l| l == "network speed full"));
        assert!(events.drain().contains(&Event::ConsoleCommandFinished {
            command: "network speed full".into(),
            success: true,
            timed_out: false,
        }));

        lifecycle.teardown().await;
        assert!(matches!(
            lifecycle.send_command("kill", Duration::from_secs(1)).await,
            Err(HarnessError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_releases_ports() {
        let fx = fixture(48000);
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![Step::output("1")]));
        {
            let mut lifecycle = lifecycle(&fx, &supervisor);
            lifecycle.start(false).await.unwrap();
            assert_eq!(fx.allocator.reserved_count(), 4);
        }
        assert_eq!(fx.allocator.reserved_count(), 0);
    }
}
