//! Android Emulator Bridge
//!
//! Runs emulator instances for automated testing: port leasing, launch,
//! boot polling, console commands and teardown.

pub mod adb;
pub mod boot;
pub mod capture;
pub mod console;
pub mod emulator;
pub mod lifecycle;
pub mod ports;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use adb::{AdbClient, AdbError};
pub use boot::{polling_interval, BootReadinessPoller, BootSignal, BootWait};
pub use capture::{CaptureError, OutputCapture};
pub use console::{CommandOutcome, ConsoleClient, ConsoleFailure, SessionState, TranscriptLine};
pub use emulator::{ConsoleReportListener, EmulatorLauncher, EmulatorOptions};
pub use lifecycle::{EmulatorLifecycle, Phase, TeardownReport, TeardownStep};
pub use ports::{LeaseKey, PortAllocator, PortLease};
pub use supervisor::{ProcessCommand, ProcessError, ProcessHandle, ProcessSupervisor, RunOutput, TokioSupervisor};
