//! Process handle: one spawned child, its exit status, and its stdin pipe.

use crate::input::{Forward, StdinPipe};
use nix::sys::signal::Signal;
use std::ffi::OsString;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::sync::watch;

/// Why a child is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited normally with a status code.
    Code(i32),
    /// Terminated by a signal (raw signal number).
    Signal(i32),
    /// The process could not be started at all.
    SpawnFailed,
    /// Waiting on the process failed, so its status is not known.
    Unknown,
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitReason::Code(code),
            (None, Some(signal)) => ExitReason::Signal(signal),
            (None, None) => ExitReason::Unknown,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Code(code) => write!(f, "code {}", code),
            ExitReason::Signal(raw) => match Signal::try_from(*raw) {
                Ok(signal) => write!(f, "signal {}", signal.as_str()),
                Err(_) => write!(f, "signal {}", raw),
            },
            ExitReason::SpawnFailed => write!(f, "spawn failure"),
            ExitReason::Unknown => write!(f, "unknown status"),
        }
    }
}

/// A single child process instance.
///
/// The exited flag is a completion signal: it moves from `None` to
/// `Some(reason)` exactly once, either immediately on spawn failure or when the
/// waiter task observes the process terminating. It is never reset; a restart
/// creates a new `ChildProcess`.
#[derive(Debug)]
pub struct ChildProcess {
    label: String,
    pid: Option<u32>,
    status: watch::Receiver<Option<ExitReason>>,
    stdin: Option<StdinPipe>,
}

impl ChildProcess {
    /// Start `command args...` with inherited stdout/stderr and piped stdin.
    ///
    /// The child is spawned in its own process group (via `process_group(0)`)
    /// so the whole tree can be signalled at once, and so terminal Ctrl-C only
    /// reaches the supervisor. Spawn failures are logged and produce a handle
    /// that has already exited.
    pub fn spawn(command: &str, args: &[OsString]) -> ChildProcess {
        let label = args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.to_string());
        let (tx, status) = watch::channel(None);

        let spawned = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(command, error = %e, "Failed to start process {}", label);
                tx.send_replace(Some(ExitReason::SpawnFailed));
                return ChildProcess {
                    label,
                    pid: None,
                    status,
                    stdin: None,
                };
            }
        };

        let pid = child.id();
        tracing::debug!(pid, command, args = ?args, "child process started");

        let stdin = match (child.stdin.take(), pid) {
            (Some(stdin), Some(pid)) => Some(StdinPipe::attach(stdin, pid)),
            _ => None,
        };

        let waiter_label = label.clone();
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => ExitReason::from(status),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to wait on child process");
                    ExitReason::Unknown
                }
            };
            tracing::info!(pid, "Process {} exited with {}", waiter_label, reason);
            tx.send_replace(Some(reason));
        });

        ChildProcess {
            label,
            pid,
            status,
            stdin,
        }
    }

    /// OS process id, absent when the spawn failed.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn has_exited(&self) -> bool {
        self.status.borrow().is_some()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self.status.borrow()
    }

    /// Wait until the child has exited. Returns immediately if it already has.
    pub async fn exited(&self) -> ExitReason {
        let mut status = self.status.clone();
        let reason = match status.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            Err(_) => *self.status.borrow(),
        };
        reason.unwrap_or(ExitReason::Unknown)
    }

    /// Forward bytes to the child's stdin.
    ///
    /// A pipe whose child end has closed is detached here, after which input
    /// is no longer forwarded.
    pub fn forward_input(&mut self, bytes: Vec<u8>) -> Forward {
        let Some(pipe) = &self.stdin else {
            return Forward::Closed;
        };
        let forwarded = pipe.forward(bytes);
        if forwarded == Forward::Closed {
            tracing::debug!(pid = ?self.pid, "detaching closed child stdin");
            self.stdin = None;
        }
        forwarded
    }

    pub fn input_attached(&self) -> bool {
        self.stdin.as_ref().is_some_and(|pipe| !pipe.is_closed())
    }

    /// Close the child's stdin, delivering EOF to it.
    pub fn close_input(&mut self) {
        self.stdin = None;
    }
}
