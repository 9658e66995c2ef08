//! Console Sessions
//!
//! One TCP connection per command: wait for the banner, authenticate if
//! the console asks for it, send the command, send `quit`, then drain
//! until the emulator closes the connection.
//!
//! A reader task and a sender task own the two halves of the socket. The
//! controlling side never touches the socket; it waits on the reader's
//! events with a deadline, so the watchdog applies uniformly to every wait
//! point. Closing the session (dropping the write side, aborting the
//! reader) is what ends a blocked read.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use emu_harness_core::config::ConsoleConfig;
use emu_harness_core::HarnessError;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::pattern::{PatternMatch, PatternSet, ACKNOWLEDGMENT, AUTH_CHALLENGE};
use super::transcript::{redact, LineCallback, Transcript, TranscriptLine, AUTH_DIRECTIVE};

/// Hard ceiling for one session, independent of the caller's timeout
pub const CONSOLE_WATCHDOG: Duration = Duration::from_secs(10);

/// Delay between the command and `quit`
pub const QUIT_GRACE: Duration = Duration::from_millis(100);

/// Ends a console session
pub const QUIT_DIRECTIVE: &str = "quit";

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    AwaitingBanner,
    Authenticating,
    Sending,
    SendingQuit,
    Draining,
    Closed,
    TimedOut,
}

/// Why a session did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConsoleFailure {
    ConnectionFailed(String),
    BannerTimeout,
    ClosedBeforeSending,
    AuthTokenUnreadable(String),
    CommandTimeout,
    UnexpectedIo(String),
}

impl ConsoleFailure {
    pub fn into_error(self, port: u16) -> HarnessError {
        match self {
            ConsoleFailure::ConnectionFailed(e) => {
                HarnessError::ConnectionFailed(format!("127.0.0.1:{}: {}", port, e))
            }
            ConsoleFailure::BannerTimeout => HarnessError::BannerTimeout(format!("port {}", port)),
            ConsoleFailure::ClosedBeforeSending => HarnessError::ConnectionFailed(format!(
                "console on port {} closed before the command was sent",
                port
            )),
            ConsoleFailure::AuthTokenUnreadable(path) => HarnessError::AuthTokenUnreadable(path),
            ConsoleFailure::CommandTimeout => HarnessError::CommandTimeout(format!("port {}", port)),
            ConsoleFailure::UnexpectedIo(e) => HarnessError::UnexpectedIo(e),
        }
    }
}

/// Result of one console session
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub port: u16,
    /// The command, redacted the same way as the transcript
    pub command: String,
    pub transcript: Vec<TranscriptLine>,
    pub success: bool,
    pub timed_out: bool,
    pub final_state: SessionState,
    pub failure: Option<ConsoleFailure>,
}

impl CommandOutcome {
    /// Received lines, in order
    pub fn received(&self) -> impl Iterator<Item = &str> {
        self.transcript
            .iter()
            .filter(|l| l.direction == super::Direction::Received)
            .map(|l| l.text.as_str())
    }

    /// Turn a failed outcome into the matching error
    pub fn into_result(self) -> Result<Self, HarnessError> {
        match self.failure.clone() {
            Some(failure) if !self.success => Err(failure.into_error(self.port)),
            _ => Ok(self),
        }
    }
}

/// Events the reader and sender report to the controlling side
#[derive(Debug)]
enum SessionEvent {
    Matched(PatternMatch),
    /// One queued line reached the socket
    Sent,
    Closed,
    ReadFailed(String),
    WriteFailed(String),
}

enum Wait {
    Event(SessionEvent),
    Deadline,
}

/// Client for the emulator console protocol
#[derive(Clone)]
pub struct ConsoleClient {
    host: IpAddr,
    watchdog: Duration,
    quit_grace: Duration,
    auth_token_path: Option<PathBuf>,
    listener: Option<LineCallback>,
}

impl ConsoleClient {
    pub fn new() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            watchdog: CONSOLE_WATCHDOG,
            quit_grace: QUIT_GRACE,
            auth_token_path: None,
            listener: None,
        }
    }

    pub fn from_config(config: &ConsoleConfig) -> Self {
        let client = Self::new()
            .with_watchdog(config.watchdog())
            .with_quit_grace(config.quit_grace());
        match config.auth_token_path {
            Some(ref path) => client.with_auth_token_path(path.clone()),
            None => client,
        }
    }

    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_quit_grace(mut self, grace: Duration) -> Self {
        self.quit_grace = grace;
        self
    }

    /// Answer auth challenges with the token stored at `path`
    pub fn with_auth_token_path(mut self, path: PathBuf) -> Self {
        self.auth_token_path = Some(path);
        self
    }

    /// Observe every transcript line as it happens
    pub fn with_listener(mut self, listener: LineCallback) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn watchdog(&self) -> Duration {
        self.watchdog
    }

    /// Run `command` against the console on `port`.
    ///
    /// Never fails: connection problems, timeouts and protocol errors are
    /// reported in the returned outcome. The session ends after
    /// `min(timeout, watchdog)` at the latest.
    pub async fn execute(&self, port: u16, command: &str, timeout: Duration) -> CommandOutcome {
        let deadline = Instant::now() + timeout.min(self.watchdog);
        let transcript = Transcript::new(self.listener.clone());

        debug!("Console {}: {}", port, redact(command));

        let connect = TcpStream::connect((self.host, port));
        let mut session = match tokio::time::timeout_at(deadline, connect).await {
            Ok(Ok(stream)) => Session::start(stream, transcript.clone(), deadline),
            Ok(Err(e)) => {
                warn!("Console connection to port {} failed: {}", port, e);
                transcript.push_note(format!("connection to {}:{} failed: {}", self.host, port, e));
                let failure = ConsoleFailure::ConnectionFailed(e.to_string());
                return outcome(port, command, &transcript, SessionState::Connecting, Some(failure));
            }
            Err(_) => {
                warn!("Console connection to port {} timed out", port);
                transcript.push_note(format!("connection to {}:{} timed out", self.host, port));
                let failure = ConsoleFailure::ConnectionFailed("timed out".into());
                return outcome(port, command, &transcript, SessionState::TimedOut, Some(failure));
            }
        };

        let token_override = self.auth_token_path.as_deref();
        let (state, failure) = session.converse(command, self.quit_grace, token_override).await;
        session.close().await;

        match failure {
            Some(ref f) => info!("Console command on port {} failed: {:?}", port, f),
            None => debug!("Console command on port {} completed", port),
        }
        if let Some(ref f) = failure {
            transcript.push_note(format!("{:?} in state {:?}", f, state));
        }
        outcome(port, command, &transcript, state, failure)
    }
}

impl Default for ConsoleClient {
    fn default() -> Self {
        Self::new()
    }
}

fn outcome(
    port: u16,
    command: &str,
    transcript: &Transcript,
    final_state: SessionState,
    failure: Option<ConsoleFailure>,
) -> CommandOutcome {
    CommandOutcome {
        port,
        command: redact(command),
        transcript: transcript.lines(),
        success: failure.is_none() && final_state == SessionState::Closed,
        timed_out: final_state == SessionState::TimedOut,
        final_state,
        failure,
    }
}

/// A live connection with its reader and sender tasks
struct Session {
    deadline: Instant,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    /// Lines queued but not yet confirmed written
    unsent: usize,
    reader: JoinHandle<()>,
    sender: JoinHandle<()>,
}

impl Session {
    fn start(stream: TcpStream, transcript: Transcript, deadline: Instant) -> Self {
        let (read, write) = stream.into_split();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_lines(read, PatternSet::banner(), transcript.clone(), event_tx.clone()));
        let sender = tokio::spawn(send_lines(write, outgoing_rx, transcript, event_tx));

        Self {
            deadline,
            events,
            outgoing: Some(outgoing),
            unsent: 0,
            reader,
            sender,
        }
    }

    /// Drive the protocol. Returns the state the session ended in.
    async fn converse(
        &mut self,
        command: &str,
        quit_grace: Duration,
        token_override: Option<&Path>,
    ) -> (SessionState, Option<ConsoleFailure>) {
        let mut token_path: Option<PathBuf> = None;

        // AwaitingBanner
        loop {
            match self.next_event().await {
                Wait::Deadline => return (SessionState::TimedOut, Some(ConsoleFailure::BannerTimeout)),
                Wait::Event(SessionEvent::Matched(m)) if m.watch == AUTH_CHALLENGE => {
                    token_path = m.group(1).map(PathBuf::from);
                }
                Wait::Event(SessionEvent::Matched(m)) if m.watch == ACKNOWLEDGMENT => break,
                Wait::Event(SessionEvent::Matched(_)) | Wait::Event(SessionEvent::Sent) => {}
                Wait::Event(SessionEvent::Closed) => {
                    return (SessionState::AwaitingBanner, Some(ConsoleFailure::ClosedBeforeSending))
                }
                Wait::Event(SessionEvent::ReadFailed(e)) | Wait::Event(SessionEvent::WriteFailed(e)) => {
                    return (SessionState::AwaitingBanner, Some(ConsoleFailure::UnexpectedIo(e)))
                }
            }
        }

        // the console may have hung up right after the banner
        if let Some(failure) = self.take_queued_failure() {
            return (SessionState::AwaitingBanner, Some(failure));
        }

        if let Some(challenge_path) = token_path {
            let path = token_override.map(Path::to_path_buf).unwrap_or(challenge_path);
            debug!("Console requires auth token from {:?}", path);
            match tokio::fs::read_to_string(&path).await {
                Ok(token) => self.send(&format!("{} {}", AUTH_DIRECTIVE, token.trim())),
                Err(e) => {
                    warn!("Cannot read console auth token {:?}: {}", path, e);
                    self.send(QUIT_DIRECTIVE);
                    return (
                        SessionState::Authenticating,
                        Some(ConsoleFailure::AuthTokenUnreadable(format!("{}: {}", path.display(), e))),
                    );
                }
            }
        }

        self.send(command);
        if let Err((state, failure)) = self.await_flushed().await {
            return (state, Some(failure));
        }

        // the quit goes out whether or not the command appeared to work
        let grace_end = (Instant::now() + quit_grace).min(self.deadline);
        tokio::time::sleep_until(grace_end).await;
        self.send(QUIT_DIRECTIVE);

        // Draining
        loop {
            match self.next_event().await {
                Wait::Deadline => return (SessionState::TimedOut, Some(ConsoleFailure::CommandTimeout)),
                Wait::Event(SessionEvent::Closed) => return (SessionState::Closed, None),
                Wait::Event(SessionEvent::ReadFailed(e)) => {
                    return (SessionState::Draining, Some(ConsoleFailure::UnexpectedIo(e)))
                }
                // only the quit can still be unsent here
                Wait::Event(SessionEvent::WriteFailed(e)) => debug!("Writing quit failed: {}", e),
                Wait::Event(SessionEvent::Matched(_)) | Wait::Event(SessionEvent::Sent) => {}
            }
        }
    }

    fn send(&mut self, line: &str) {
        if let Some(ref outgoing) = self.outgoing {
            if outgoing.send(line.to_string()).is_ok() {
                self.unsent += 1;
            }
        }
    }

    /// Wait until every queued line is written. The stream closing or a
    /// write failing first means the command never reached the console.
    async fn await_flushed(&mut self) -> Result<(), (SessionState, ConsoleFailure)> {
        while self.unsent > 0 {
            match self.next_event().await {
                Wait::Deadline => return Err((SessionState::TimedOut, ConsoleFailure::CommandTimeout)),
                Wait::Event(SessionEvent::Sent) => self.unsent -= 1,
                Wait::Event(SessionEvent::Matched(_)) => {}
                Wait::Event(SessionEvent::Closed) | Wait::Event(SessionEvent::WriteFailed(_)) => {
                    return Err((SessionState::Sending, ConsoleFailure::ClosedBeforeSending))
                }
                Wait::Event(SessionEvent::ReadFailed(e)) => {
                    return Err((SessionState::Sending, ConsoleFailure::UnexpectedIo(e)))
                }
            }
        }
        Ok(())
    }

    /// A close or read error the reader already reported
    fn take_queued_failure(&mut self) -> Option<ConsoleFailure> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                SessionEvent::Closed => return Some(ConsoleFailure::ClosedBeforeSending),
                SessionEvent::ReadFailed(e) | SessionEvent::WriteFailed(e) => {
                    return Some(ConsoleFailure::UnexpectedIo(e))
                }
                SessionEvent::Matched(_) | SessionEvent::Sent => {}
            }
        }
        None
    }

    async fn next_event(&mut self) -> Wait {
        match tokio::time::timeout_at(self.deadline, self.events.recv()).await {
            Ok(Some(event)) => Wait::Event(event),
            // both workers gone without saying why: the stream ended
            Ok(None) => Wait::Event(SessionEvent::Closed),
            Err(_) => Wait::Deadline,
        }
    }

    /// Close the connection from this side and reap both workers
    async fn close(mut self) {
        // the sender flushes what is queued, then drops the write half
        self.outgoing.take();
        let flush_deadline = Instant::now() + Duration::from_millis(250);
        if tokio::time::timeout_at(flush_deadline, &mut self.sender).await.is_err() {
            self.sender.abort();
        }
        self.reader.abort();
        let _ = (&mut self.reader).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // an aborted `execute` must not leave the workers parked on the socket
        self.reader.abort();
        self.sender.abort();
    }
}

/// Reader worker: publish each received line to the transcript and watches
async fn read_lines(
    read: OwnedReadHalf,
    mut patterns: PatternSet,
    transcript: Transcript,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                let _ = events.send(SessionEvent::Closed);
                return;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                transcript.push_received(line);
                for m in patterns.ingest(line) {
                    let _ = events.send(SessionEvent::Matched(m));
                }
            }
            Err(e) => {
                let _ = events.send(SessionEvent::ReadFailed(e.to_string()));
                return;
            }
        }
    }
}

/// Sender worker: write each request with CRLF and flush immediately
async fn send_lines(
    mut write: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    transcript: Transcript,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(line) = outgoing.recv().await {
        // recorded before the write so replies never precede their request
        transcript.push_sent(&line);

        let written = async {
            write.write_all(line.as_bytes()).await?;
            write.write_all(b"\r\n").await?;
            write.flush().await
        };
        if let Err(e) = written.await {
            let _ = events.send(SessionEvent::WriteFailed(e.to_string()));
            return;
        }
        let _ = events.send(SessionEvent::Sent);
    }
    let _ = write.shutdown().await;
}
