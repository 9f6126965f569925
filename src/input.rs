//! Stdin handling: one reader owns the supervisor's stdin and splits manual
//! reload commands from data, and a per-child pipe forwards data to the child.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Line that requests a manual restart.
pub const RELOAD_COMMAND: &str = "rs";

/// Largest chunk read from stdin at once.
const READ_CHUNK: usize = 8 * 1024;

/// Chunks queued for one child before further input is dropped.
pub const STDIN_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// The operator typed the reload command.
    Reload,
    /// Anything else, to be forwarded verbatim.
    Data(Vec<u8>),
    /// The supervisor's own stdin reached end of file.
    Closed,
}

/// Splits raw stdin chunks into events.
///
/// A reload is only recognized as a whole line: `rs\n` or `rs\r\n` starting
/// right after a newline (or at the very beginning). Everything else,
/// including a line that is still incomplete, is passed through as data as
/// soon as it is read.
#[derive(Debug)]
pub struct InputSplitter {
    at_line_start: bool,
}

impl Default for InputSplitter {
    fn default() -> Self {
        Self {
            at_line_start: true,
        }
    }
}

impl InputSplitter {
    pub fn split(&mut self, chunk: &[u8]) -> Vec<InputEvent> {
        let mut events = Vec::new();
        let mut data = Vec::new();
        for segment in chunk.split_inclusive(|b| *b == b'\n') {
            if self.at_line_start && is_reload(segment) {
                if !data.is_empty() {
                    events.push(InputEvent::Data(std::mem::take(&mut data)));
                }
                events.push(InputEvent::Reload);
            } else {
                data.extend_from_slice(segment);
            }
            self.at_line_start = segment.ends_with(b"\n");
        }
        if !data.is_empty() {
            events.push(InputEvent::Data(data));
        }
        events
    }
}

fn is_reload(line: &[u8]) -> bool {
    let Some(rest) = line.strip_prefix(RELOAD_COMMAND.as_bytes()) else {
        return false;
    };
    rest == b"\n" || rest == b"\r\n"
}

/// Read `reader` until EOF, sending events for whatever bytes arrive.
///
/// This is the only consumer of the supervisor's stdin, so reload detection and
/// forwarding never compete for bytes.
pub fn spawn_reader<R>(mut reader: R, tx: mpsc::Sender<InputEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut splitter = InputSplitter::default();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let events = match reader.read(&mut buf).await {
                Ok(0) => vec![InputEvent::Closed],
                Ok(n) => splitter.split(&buf[..n]),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read stdin");
                    vec![InputEvent::Closed]
                }
            };
            for event in events {
                let closed = event == InputEvent::Closed;
                if tx.send(event).await.is_err() || closed {
                    return;
                }
            }
        }
    })
}

/// What happened to bytes handed to a child's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    Queued,
    /// The child is not keeping up; the bytes were discarded.
    Dropped,
    /// The child's stdin is gone.
    Closed,
}

/// Pipe from the supervisor into one child's stdin.
///
/// Writes happen on a dedicated task so a child that stops reading can never
/// block the supervision loop. At most [`STDIN_QUEUE`] chunks wait for such a
/// child. Dropping the pipe closes the child's stdin.
#[derive(Debug)]
pub struct StdinPipe {
    tx: mpsc::Sender<Vec<u8>>,
}

impl StdinPipe {
    pub fn attach(mut stdin: ChildStdin, pid: u32) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(STDIN_QUEUE);
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let written = match stdin.write_all(&bytes).await {
                    Ok(()) => stdin.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    tracing::debug!(pid, error = %e, "child stdin closed");
                    break;
                }
            }
        });
        Self { tx }
    }

    pub fn forward(&self, bytes: Vec<u8>) -> Forward {
        match self.tx.try_send(bytes) {
            Ok(()) => Forward::Queued,
            Err(TrySendError::Full(bytes)) => {
                tracing::warn!(bytes = bytes.len(), "child is not reading stdin, input dropped");
                Forward::Dropped
            }
            Err(TrySendError::Closed(_)) => Forward::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
