//! emu-harness core - shared types
//!
//! Configuration, the error taxonomy and the lifecycle event bus used by
//! the emulator bridge and the command-line front end.

pub mod config;
pub mod error;
pub mod events;

pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use events::{Event, EventBus, EventSubscription};

/// emu-harness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "emu-harness";
