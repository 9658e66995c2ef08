//! emu-harness - ephemeral Android emulators for automated testing
//!
//! Provisions emulator instances on private port blocks, waits for them to
//! boot, drives their control console and tears them down again.
//!
//! ## Architecture
//!
//! - `emu-harness-core`: configuration, error taxonomy, lifecycle events
//! - `emu-harness-emulator-bridge`: port leasing, process supervision,
//!   boot polling, the console protocol client and the lifecycle coordinator

#![warn(clippy::all)]

pub mod cli;
pub mod commands;

// Re-export main components for library usage
pub use emu_harness_core as core;
pub use emu_harness_emulator_bridge as emulator;

/// Prelude module for convenient imports
pub mod prelude {
    pub use emu_harness_core::{Event, EventBus, HarnessConfig, HarnessError};
    pub use emu_harness_emulator_bridge::{
        BootReadinessPoller, CommandOutcome, ConsoleClient, EmulatorLifecycle, PortAllocator,
        PortLease, ProcessSupervisor, TokioSupervisor,
    };
}
