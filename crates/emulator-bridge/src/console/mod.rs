//! Emulator Console
//!
//! Line-oriented client for the emulator's telnet-style control console.

mod pattern;
mod session;
mod transcript;

pub use pattern::{PatternMatch, PatternSet, PatternWatch, WatchScope, ACKNOWLEDGMENT, AUTH_CHALLENGE};
pub use session::{
    CommandOutcome, ConsoleClient, ConsoleFailure, SessionState, CONSOLE_WATCHDOG, QUIT_DIRECTIVE,
    QUIT_GRACE,
};
pub use transcript::{redact, Direction, LineCallback, Transcript, TranscriptLine, AUTH_DIRECTIVE, REDACTED};
