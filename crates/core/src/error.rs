//! Error types for emu-harness
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// Main error type for emulator lifecycle operations
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No free ports left: {0}")]
    AllocationExhausted(String),

    #[error("Failed to launch process: {0}")]
    ProcessLaunchFailed(String),

    #[error("Process exited before it was ready: {0}")]
    ProcessDiedEarly(String),

    #[error("Emulator did not finish booting within {0} seconds")]
    BootTimeout(u64),

    #[error("Could not connect to console: {0}")]
    ConnectionFailed(String),

    #[error("Console banner not received: {0}")]
    BannerTimeout(String),

    #[error("Cannot read console auth token: {0}")]
    AuthTokenUnreadable(String),

    #[error("Console command timed out: {0}")]
    CommandTimeout(String),

    #[error("Unexpected IO error: {0}")]
    UnexpectedIo(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias for emu-harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    /// Check whether starting a fresh lifecycle attempt may succeed.
    ///
    /// Nothing is retried automatically; callers use this to decide whether
    /// a new attempt is worthwhile.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HarnessError::AllocationExhausted(_)
                | HarnessError::ProcessDiedEarly(_)
                | HarnessError::BootTimeout(_)
                | HarnessError::ConnectionFailed(_)
                | HarnessError::BannerTimeout(_)
                | HarnessError::CommandTimeout(_)
                | HarnessError::Cancelled
        )
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            HarnessError::Io(e) => format!("File operation failed: {}", e),
            HarnessError::Config(msg) => format!("Configuration error: {}", msg),
            HarnessError::AllocationExhausted(msg) => {
                format!("No free emulator ports: {}. Stop other emulators or widen the port ranges.", msg)
            }
            HarnessError::ProcessLaunchFailed(msg) => format!("Emulator failed to start: {}", msg),
            HarnessError::ProcessDiedEarly(msg) => format!("Emulator crashed during startup: {}", msg),
            HarnessError::BootTimeout(secs) => {
                format!("Emulator did not boot within {}s. Try a longer boot timeout.", secs)
            }
            HarnessError::AuthTokenUnreadable(msg) => {
                format!("Console auth token could not be read: {}", msg)
            }
            HarnessError::Cancelled => "Operation was cancelled".to_string(),
            _ => self.to_string(),
        }
    }
}
