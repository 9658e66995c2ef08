//! Output Capture
//!
//! Streams the stdout and stderr of a launched process into a file. Both
//! pipes feed one writer, so lines interleave in arrival order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::supervisor::ProcessHandle;

/// Capture errors
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Cannot open capture file {0:?}: {1}")]
    Open(PathBuf, #[source] std::io::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CaptureError> for emu_harness_core::HarnessError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::Io(e) => emu_harness_core::HarnessError::Io(e),
            other => emu_harness_core::HarnessError::UnexpectedIo(other.to_string()),
        }
    }
}

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Running capture of one process
#[derive(Debug)]
pub struct OutputCapture {
    path: PathBuf,
    readers: Vec<JoinHandle<()>>,
    writer: JoinHandle<Result<u64, CaptureError>>,
}

impl OutputCapture {
    /// Take the pipes of `handle` and start copying them to `path`.
    /// A handle without pipes yields an empty file.
    pub async fn start(handle: &mut ProcessHandle, path: &Path) -> Result<Self, CaptureError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CaptureError::Open(path.to_path_buf(), e))?;
        }
        let file = File::create(path)
            .await
            .map_err(|e| CaptureError::Open(path.to_path_buf(), e))?;

        let (tx, rx) = mpsc::channel(1000);
        let mut readers = Vec::new();
        if let Some(stdout) = handle.take_stdout() {
            readers.push(tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone())));
        }
        if let Some(stderr) = handle.take_stderr() {
            readers.push(tokio::spawn(forward_lines(stderr, Stream::Stderr, tx.clone())));
        }
        drop(tx);

        debug!("Capturing output of {} to {:?}", handle.name(), path);

        Ok(Self {
            path: path.to_path_buf(),
            readers,
            writer: tokio::spawn(write_lines(file, rx)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the pipes to close, at most `grace`, then flush the file.
    /// Returns the number of lines written.
    pub async fn stop(self, grace: Duration) -> Result<u64, CaptureError> {
        let deadline = tokio::time::Instant::now() + grace;
        for mut reader in self.readers {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                debug!("Pipe still open after {:?}, detaching {:?}", grace, self.path);
                reader.abort();
            }
        }

        match self.writer.await {
            Ok(result) => result,
            Err(e) => Err(CaptureError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            ))),
        }
    }
}

async fn forward_lines<R>(pipe: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Reading {:?} failed: {}", stream, e);
                break;
            }
        }
    }
}

async fn write_lines(file: File, mut rx: mpsc::Receiver<(Stream, String)>) -> Result<u64, CaptureError> {
    let mut out = BufWriter::new(file);
    let mut written = 0;

    while let Some((_, line)) = rx.recv().await {
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        written += 1;
    }

    out.flush().await?;
    Ok(written)
}
