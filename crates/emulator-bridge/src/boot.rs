//! Boot Readiness
//!
//! Polls a running instance until it reports boot completion. The polling
//! interval widens with the timeout: `timeout / floor(sqrt(timeout_secs))`,
//! so a two-minute wait probes every 12 seconds while short waits poll
//! frequently.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adb::AdbClient;
use crate::supervisor::ProcessSupervisor;

/// Default bound for one probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Property/value pair that flips once the instance has booted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSignal {
    pub property: &'static str,
    pub expected: &'static str,
}

/// Boot signals keyed by API level range
const BOOT_SIGNALS: &[(RangeInclusive<u32>, BootSignal)] = &[
    (
        0..=8,
        BootSignal {
            property: "dev.bootcomplete",
            expected: "1",
        },
    ),
    (
        9..=u32::MAX,
        BootSignal {
            property: "sys.boot_completed",
            expected: "1",
        },
    ),
];

impl BootSignal {
    /// Pick the signal for an API level; unknown levels get the modern one
    pub fn for_api_level(api_level: Option<u32>) -> Self {
        let level = api_level.unwrap_or(u32::MAX);
        BOOT_SIGNALS
            .iter()
            .find(|(range, _)| range.contains(&level))
            .map(|(_, signal)| signal.clone())
            .unwrap_or_else(Self::modern)
    }

    pub fn modern() -> Self {
        Self {
            property: "sys.boot_completed",
            expected: "1",
        }
    }

    /// Shell command that prints the current value
    pub fn probe_command(&self) -> String {
        format!("getprop {}", self.property)
    }

    pub fn matches(&self, output: &str) -> bool {
        output.trim() == self.expected
    }
}

impl Default for BootSignal {
    fn default() -> Self {
        Self::modern()
    }
}

/// Interval between probes for a given total timeout
pub fn polling_interval(timeout: Duration) -> Duration {
    let timeout_ms = timeout.as_millis() as u64;
    let probes = ((timeout_ms as f64 / 1000.0).sqrt().floor() as u64).max(1);
    Duration::from_millis(timeout_ms / probes)
}

/// Timeout to use for the first boot of a new instance, which is
/// `factor` times slower than a warm boot
pub fn cold_boot_timeout(timeout: Duration, factor: u32) -> Duration {
    timeout * factor.max(1)
}

/// How a boot wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootWait {
    Booted,
    TimedOut,
    Cancelled,
    ProcessExited,
}

impl BootWait {
    pub fn is_booted(&self) -> bool {
        matches!(self, BootWait::Booted)
    }
}

/// Waits for an instance to finish booting
pub struct BootReadinessPoller {
    supervisor: Arc<dyn ProcessSupervisor>,
    adb: AdbClient,
    probe_timeout: Duration,
}

impl BootReadinessPoller {
    pub fn new(supervisor: Arc<dyn ProcessSupervisor>, adb: AdbClient) -> Self {
        Self {
            supervisor,
            adb,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Wait until `signal` is observed on `serial`, or `timeout` passes
    pub async fn wait(&self, serial: &str, signal: &BootSignal, timeout: Duration) -> bool {
        self.wait_with_cancel(serial, signal, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`wait`](Self::wait), returning `false` as soon as `cancel` fires
    pub async fn wait_with_cancel(
        &self,
        serial: &str,
        signal: &BootSignal,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        self.poll(serial, signal, timeout, cancel, &mut || true)
            .await
            .is_booted()
    }

    /// Poll until booted, timed out, cancelled, or `alive` reports the
    /// process gone. Returns within `timeout` plus one probe timeout.
    pub async fn poll(
        &self,
        serial: &str,
        signal: &BootSignal,
        timeout: Duration,
        cancel: &CancellationToken,
        alive: &mut (dyn FnMut() -> bool + Send),
    ) -> BootWait {
        let interval = polling_interval(timeout);
        let started = Instant::now();
        let deadline = started + timeout;

        debug!(
            "Waiting up to {:?} for {} on {} (probing every {:?})",
            timeout, signal.property, serial, interval
        );

        loop {
            if !alive() {
                warn!("Process for {} exited while waiting for boot", serial);
                return BootWait::ProcessExited;
            }

            let matched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return BootWait::Cancelled,
                matched = self.probe(serial, signal) => matched,
            };
            if matched {
                info!("{} booted after {:?}", serial, started.elapsed());
                return BootWait::Booted;
            }

            let now = Instant::now();
            if now >= deadline {
                info!("{} did not boot within {:?}", serial, timeout);
                return BootWait::TimedOut;
            }

            let pause = interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return BootWait::Cancelled,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// One bounded probe; failures count as "not booted yet"
    async fn probe(&self, serial: &str, signal: &BootSignal) -> bool {
        let command = self.adb.shell_command(serial, &signal.probe_command());
        let run = self.supervisor.run(&command, self.probe_timeout);

        match tokio::time::timeout(self.probe_timeout, run).await {
            Ok(Ok(output)) => {
                debug!("{} {} = {:?}", serial, signal.property, output.stdout.trim());
                signal.matches(&output.stdout)
            }
            Ok(Err(e)) => {
                debug!("Boot probe on {} failed: {}", serial, e);
                false
            }
            Err(_) => {
                debug!("Boot probe on {} exceeded {:?}", serial, self.probe_timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSupervisor, Step};
    use std::path::PathBuf;

    fn poller(supervisor: Arc<ScriptedSupervisor>) -> BootReadinessPoller {
        let adb = AdbClient::new(PathBuf::from("/sdk")).with_server_port(5800);
        BootReadinessPoller::new(supervisor, adb).with_probe_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_polling_interval() {
        assert_eq!(polling_interval(Duration::from_millis(120_000)), Duration::from_millis(12_000));
        assert_eq!(polling_interval(Duration::from_secs(480)), Duration::from_millis(480_000 / 21));
        assert_eq!(polling_interval(Duration::from_millis(500)), Duration::from_millis(500));
        assert_eq!(polling_interval(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_cold_boot_timeout() {
        assert_eq!(cold_boot_timeout(Duration::from_secs(120), 4), Duration::from_secs(480));
        assert_eq!(cold_boot_timeout(Duration::from_secs(120), 0), Duration::from_secs(120));
    }

    #[test]
    fn test_boot_signal_table() {
        assert_eq!(BootSignal::for_api_level(Some(7)).property, "dev.bootcomplete");
        assert_eq!(BootSignal::for_api_level(Some(9)).property, "sys.boot_completed");
        assert_eq!(BootSignal::for_api_level(Some(34)).property, "sys.boot_completed");
        assert_eq!(BootSignal::for_api_level(None), BootSignal::modern());
        assert!(BootSignal::modern().matches(" 1\r\n"));
        assert!(!BootSignal::modern().matches("0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boots_on_third_probe() {
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![
            Step::output("0\n"),
            Step::output(""),
            Step::output("1\n"),
        ]));
        let poller = poller(Arc::clone(&supervisor));

        let started = Instant::now();
        assert!(poller.wait("emulator-5586", &BootSignal::modern(), Duration::from_secs(120)).await);
        assert_eq!(supervisor.run_count(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(24));

        let probe = supervisor.last_run().unwrap();
        assert_eq!(probe.get_args(), &["-s", "emulator-5586", "shell", "getprop sys.boot_completed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_bounded() {
        let supervisor = Arc::new(ScriptedSupervisor::repeating(Step::output("0")));
        let poller = poller(Arc::clone(&supervisor));

        let started = Instant::now();
        assert!(!poller.wait("emulator-5586", &BootSignal::modern(), Duration::from_secs(120)).await);
        assert!(started.elapsed() <= Duration::from_secs(120) + poller.probe_timeout());
        assert_eq!(supervisor.run_count(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_does_not_stall() {
        let supervisor = Arc::new(ScriptedSupervisor::repeating(Step::Hang));
        let poller = poller(Arc::clone(&supervisor));

        let started = Instant::now();
        assert!(!poller.wait("emulator-5586", &BootSignal::modern(), Duration::from_secs(30)).await);
        assert!(started.elapsed() <= Duration::from_secs(30) + poller.probe_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_keeps_polling() {
        let supervisor = Arc::new(ScriptedSupervisor::new(vec![
            Step::Fail,
            Step::exit(1, "error: device offline"),
            Step::output("1"),
        ]));
        let poller = poller(Arc::clone(&supervisor));

        assert!(poller.wait("emulator-5586", &BootSignal::modern(), Duration::from_secs(60)).await);
        assert_eq!(supervisor.run_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_false() {
        let supervisor = Arc::new(ScriptedSupervisor::repeating(Step::output("0")));
        let poller = poller(Arc::clone(&supervisor));
        let cancel = CancellationToken::new();

        let waiter = {
            let cancel = cancel.clone();
            async move {
                poller
                    .wait_with_cancel("emulator-5586", &BootSignal::modern(), Duration::from_secs(600), &cancel)
                    .await
            }
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            cancel.cancel();
        };

        let started = Instant::now();
        let (booted, _) = tokio::join!(waiter, canceller);
        assert!(!booted);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_exit_stops_wait() {
        let supervisor = Arc::new(ScriptedSupervisor::repeating(Step::output("0")));
        let poller = poller(Arc::clone(&supervisor));

        let mut checks = 0;
        let mut alive = || {
            checks += 1;
            checks < 3
        };
        let result = poller
            .poll(
                "emulator-5586",
                &BootSignal::modern(),
                Duration::from_secs(120),
                &CancellationToken::new(),
                &mut alive,
            )
            .await;
        assert_eq!(result, BootWait::ProcessExited);
        assert_eq!(supervisor.run_count(), 2);
    }
}
