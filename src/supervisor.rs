//! The supervision loop.
//!
//! Owns the single child process and reacts to four event sources: stdin
//! (manual `rs` reloads and data to forward), debounced file changes,
//! operator signals, and the child's own exit. Handlers run one at a time,
//! so a restart's stop-then-spawn sequence never interleaves with another.

use crate::config::SupervisorConfig;
use crate::debounce::Debouncer;
use crate::input::{Forward, InputEvent};
use crate::process::{ChildProcess, ExitReason};
use crate::signals::ShutdownSignal;
use crate::terminate::{ProcessTree, Signaller, StopOutcome, TerminateError, Terminator};
use crate::watch::ChangeEvent;
use std::ffi::OsString;
use std::fmt;
use tokio::sync::mpsc;

/// What triggered a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Manual,
    FileChange,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::Manual => write!(f, "Manual reload"),
            RestartReason::FileChange => write!(f, "File change"),
        }
    }
}

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Restarting(RestartReason),
    /// `None` when every event source closed rather than a signal arriving.
    ShuttingDown(Option<ShutdownSignal>),
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The first child has been spawned.
    Started,
    Restart(RestartReason),
    /// The old child exited and its replacement was spawned.
    Respawned,
    /// The old child could not be stopped; the restart was abandoned.
    Resume,
    Shutdown(Option<ShutdownSignal>),
    /// The child tree is gone (or given up on) and the loop ends.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {transition:?} from {from:?}")]
pub struct IllegalTransition {
    pub from: Phase,
    pub transition: Transition,
}

impl Phase {
    /// Apply a transition, rejecting anything the lifecycle does not allow
    /// (a restart during shutdown, anything after termination, ...).
    pub fn apply(self, transition: Transition) -> Result<Phase, IllegalTransition> {
        use Phase::*;
        match (self, transition) {
            (Starting, Transition::Started) => Ok(Running),
            (Running, Transition::Restart(reason)) => Ok(Restarting(reason)),
            (Restarting(_), Transition::Respawned | Transition::Resume) => Ok(Running),
            (Starting | Running | Restarting(_), Transition::Shutdown(signal)) => {
                Ok(ShuttingDown(signal))
            }
            (ShuttingDown(_), Transition::Stopped) => Ok(Terminated),
            (from, transition) => Err(IllegalTransition { from, transition }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Lifecycle(#[from] IllegalTransition),
    #[error("failed to stop child process: {0}")]
    Terminate(#[from] TerminateError),
}

/// Everything that can wake the loop, wired up by the caller.
pub struct EventSources {
    pub input: mpsc::Receiver<InputEvent>,
    pub changes: mpsc::Receiver<ChangeEvent>,
    pub signals: mpsc::Receiver<ShutdownSignal>,
}

/// How a completed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// The operator signal that ended the run, if any.
    pub signal: Option<ShutdownSignal>,
    /// Number of replacement children spawned.
    pub restarts: u32,
}

pub struct Supervisor<S = ProcessTree> {
    command: String,
    args: Vec<OsString>,
    terminator: Terminator<S>,
    debouncer: Debouncer,
    phase: Phase,
    child: Option<ChildProcess>,
    /// The current child's exit has not been observed by the loop yet.
    exit_pending: bool,
    /// Our own stdin hit EOF; children get a closed stdin from now on.
    input_closed: bool,
    restarts: u32,
}

impl Supervisor<ProcessTree> {
    pub fn new(config: &SupervisorConfig) -> Self {
        let terminator = Terminator::new(
            ProcessTree,
            config.shutdown.stop_timeout(),
            config.shutdown.kill_timeout(),
        );
        Self::with_terminator(config, terminator)
    }
}

impl<S: Signaller> Supervisor<S> {
    pub fn with_terminator(config: &SupervisorConfig, terminator: Terminator<S>) -> Self {
        Self {
            command: config.child.command.clone(),
            args: config.child.args.clone(),
            terminator,
            debouncer: Debouncer::new(config.restart.debounce()),
            phase: Phase::Starting,
            child: None,
            exit_pending: false,
            input_closed: false,
            restarts: 0,
        }
    }

    /// Run until an operator signal (or the loss of every event source) ends
    /// supervision, then stop the child tree.
    pub async fn run(mut self, mut sources: EventSources) -> Result<RunSummary, SupervisorError> {
        self.spawn_child();
        self.advance(Transition::Started)?;

        let signal = loop {
            tokio::select! {
                Some(signal) = sources.signals.recv() => break Some(signal),
                Some(event) = sources.input.recv() => match event {
                    InputEvent::Reload => {
                        self.debouncer.cancel();
                        if let Some(signal) = self.restart(RestartReason::Manual, &mut sources.signals).await? {
                            break Some(signal);
                        }
                    }
                    InputEvent::Data(bytes) => self.forward(bytes),
                    InputEvent::Closed => {
                        tracing::debug!("stdin closed");
                        self.input_closed = true;
                        if let Some(child) = self.child.as_mut() {
                            child.close_input();
                        }
                    }
                },
                Some(change) = sources.changes.recv() => {
                    tracing::debug!(paths = ?change.paths, "change detected");
                    self.debouncer.notify();
                }
                () = self.debouncer.expired(), if self.debouncer.is_pending() => {
                    if let Some(signal) = self.restart(RestartReason::FileChange, &mut sources.signals).await? {
                        break Some(signal);
                    }
                }
                reason = child_exit(&self.child), if self.exit_pending => {
                    self.exit_pending = false;
                    let label = self.child.as_ref().map(ChildProcess::label).unwrap_or_default();
                    tracing::info!(
                        %reason,
                        "{} is not running. Waiting for a file change or `rs` to restart",
                        label
                    );
                }
                else => break None,
            }
        };

        self.shutdown(signal, &mut sources.signals).await
    }

    fn advance(&mut self, transition: Transition) -> Result<(), IllegalTransition> {
        let next = self.phase.apply(transition)?;
        tracing::debug!(from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
        Ok(())
    }

    fn spawn_child(&mut self) {
        debug_assert!(self.child.as_ref().map_or(true, ChildProcess::has_exited));
        let mut child = ChildProcess::spawn(&self.command, &self.args);
        if self.input_closed {
            child.close_input();
        }
        self.exit_pending = child.exit_reason().is_none();
        self.child = Some(child);
    }

    fn forward(&mut self, bytes: Vec<u8>) {
        let forwarded = match self.child.as_mut() {
            Some(child) if child.input_attached() => child.forward_input(bytes),
            _ => Forward::Closed,
        };
        if forwarded == Forward::Closed {
            tracing::trace!("no child stdin attached, input dropped");
        }
    }

    /// Stop the current child and spawn a replacement.
    ///
    /// Returns the operator signal if one arrived while the old child was
    /// being stopped; in that case no replacement is spawned.
    async fn restart(
        &mut self,
        reason: RestartReason,
        signals: &mut mpsc::Receiver<ShutdownSignal>,
    ) -> Result<Option<ShutdownSignal>, SupervisorError> {
        self.advance(Transition::Restart(reason))?;
        tracing::info!("{} detected. Restarting process", reason);

        let (stopped, signal) = self.stop_child(signals, None).await;
        match stopped {
            Ok(outcome) => {
                tracing::debug!(?outcome, "previous child stopped");
                if signal.is_some() {
                    return Ok(signal);
                }
                self.spawn_child();
                self.restarts += 1;
                self.advance(Transition::Respawned)?;
            }
            Err(e) => {
                tracing::error!(error = %e, "restart abandoned, previous child is still running");
                self.advance(Transition::Resume)?;
                if signal.is_some() {
                    return Ok(signal);
                }
            }
        }
        Ok(None)
    }

    async fn shutdown(
        mut self,
        signal: Option<ShutdownSignal>,
        signals: &mut mpsc::Receiver<ShutdownSignal>,
    ) -> Result<RunSummary, SupervisorError> {
        self.advance(Transition::Shutdown(signal))?;
        match signal {
            Some(signal) => tracing::info!("Detected signal {}. Exiting...", signal),
            None => tracing::info!("All event sources closed. Exiting..."),
        }
        self.debouncer.cancel();

        let (stopped, _) = self.stop_child(signals, signal).await;
        self.advance(Transition::Stopped)?;
        stopped?;
        Ok(RunSummary {
            signal,
            restarts: self.restarts,
        })
    }

    /// Stop the current child while still listening for operator signals.
    ///
    /// The first signal received is reported back to the caller; every signal
    /// after the first (counting `received`, a signal that already started a
    /// shutdown) force-kills the tree.
    async fn stop_child(
        &self,
        signals: &mut mpsc::Receiver<ShutdownSignal>,
        mut received: Option<ShutdownSignal>,
    ) -> (Result<StopOutcome, TerminateError>, Option<ShutdownSignal>) {
        let Some(child) = self.child.as_ref() else {
            return (Ok(StopOutcome::AlreadyExited), received);
        };

        let stop = self.terminator.stop(child);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                result = &mut stop => return (result, received),
                Some(signal) = signals.recv() => {
                    if received.is_some() {
                        tracing::warn!("Detected signal {} again. Killing process tree", signal);
                        self.terminator.force(child);
                    } else {
                        tracing::info!("Detected signal {}. Exiting once the current process stops", signal);
                        received = Some(signal);
                    }
                }
            }
        }
    }
}

async fn child_exit(child: &Option<ChildProcess>) -> ExitReason {
    match child {
        Some(child) => child.exited().await,
        None => std::future::pending().await,
    }
}
