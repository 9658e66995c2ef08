//! Console session transcript
//!
//! Every line sent or received, in order. The argument of an `auth`
//! command never reaches the transcript in clear text, not even when the
//! server echoes it back.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Command that authenticates a console session
pub const AUTH_DIRECTIVE: &str = "auth";

/// Replacement for secrets in the transcript
pub const REDACTED: &str = "********";

/// Direction of a transcript line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
    /// Produced locally (connection errors, timeouts)
    Note,
}

/// One transcript entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptLine {
    pub direction: Direction,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl fmt::Display for TranscriptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.direction {
            Direction::Sent => '>',
            Direction::Received => '<',
            Direction::Note => '!',
        };
        write!(f, "{} {}", marker, self.text)
    }
}

/// Called for each line as it is appended
pub type LineCallback = Arc<dyn Fn(&TranscriptLine) + Send + Sync>;

/// Split an auth command into its directive and secret
fn auth_secret(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix(AUTH_DIRECTIVE)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let secret = rest.trim();
    (!secret.is_empty()).then_some(secret)
}

/// Redacted form of a line about to be sent
pub fn redact(line: &str) -> String {
    match auth_secret(line) {
        Some(_) => format!("{} {}", AUTH_DIRECTIVE, REDACTED),
        None => line.to_string(),
    }
}

#[derive(Default)]
struct Inner {
    lines: Vec<TranscriptLine>,
    secrets: Vec<String>,
}

/// Shared, append-only transcript of one session
#[derive(Clone, Default)]
pub struct Transcript {
    inner: Arc<Mutex<Inner>>,
    listener: Option<LineCallback>,
}

impl Transcript {
    pub fn new(listener: Option<LineCallback>) -> Self {
        Self {
            inner: Arc::default(),
            listener,
        }
    }

    /// Record an outgoing line. Returns the text as recorded.
    pub fn push_sent(&self, line: &str) -> String {
        let text = redact(line);
        let entry = {
            let mut inner = self.inner.lock();
            if let Some(secret) = auth_secret(line) {
                inner.secrets.push(secret.to_string());
            }
            Self::append(&mut inner, Direction::Sent, text.clone())
        };
        self.notify(&entry);
        text
    }

    /// Record an incoming line, scrubbing any secret sent earlier
    pub fn push_received(&self, line: &str) {
        let entry = {
            let mut inner = self.inner.lock();
            let mut text = line.to_string();
            for secret in &inner.secrets {
                text = text.replace(secret.as_str(), REDACTED);
            }
            Self::append(&mut inner, Direction::Received, text)
        };
        self.notify(&entry);
    }

    pub fn push_note(&self, note: impl Into<String>) {
        let entry = Self::append(&mut self.inner.lock(), Direction::Note, note.into());
        self.notify(&entry);
    }

    pub fn lines(&self) -> Vec<TranscriptLine> {
        self.inner.lock().lines.clone()
    }

    fn append(inner: &mut Inner, direction: Direction, text: String) -> TranscriptLine {
        let line = TranscriptLine {
            direction,
            text,
            at: Utc::now(),
        };
        inner.lines.push(line.clone());
        line
    }

    fn notify(&self, line: &TranscriptLine) {
        if let Some(ref listener) = self.listener {
            listener(line);
        }
    }
}

impl fmt::Debug for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transcript")
            .field("lines", &self.inner.lock().lines.len())
            .finish()
    }
}
