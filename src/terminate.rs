//! Termination controller: graceful-then-forceful shutdown of a child and
//! every process it spawned.

use crate::process::{ChildProcess, ExitReason};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// The process table could not be read, so descendants are unknown.
    #[error("process tree lookup failed: {0}")]
    Lookup(String),
    /// The root of the tree could not be signalled.
    #[error("signal delivery failed: {0}")]
    Delivery(#[from] Errno),
}

#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("process {pid} did not exit {waited_secs}s after SIGKILL")]
    Unresponsive { pid: u32, waited_secs: u64 },
}

/// Delivers a signal to a process and all of its descendants.
pub trait Signaller: Send + Sync {
    fn signal_tree(&self, pid: u32, signal: Signal) -> Result<(), SignalError>;
}

/// Signals the child's process group plus every descendant found in the
/// process table, so processes that left the group are reached too.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTree;

impl Signaller for ProcessTree {
    fn signal_tree(&self, pid: u32, signal: Signal) -> Result<(), SignalError> {
        let root = Pid::from_raw(pid as i32);
        let tree = process_table().map(|table| descendants(&table, pid));

        // Group first: it holds the common case even when the lookup failed.
        let delivered = killpg(root, signal).or_else(|_| kill(root, signal));

        if let Ok(members) = &tree {
            for child in members {
                match kill(Pid::from_raw(*child as i32), signal) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => tracing::debug!(pid = child, error = %e, "failed to signal descendant"),
                }
            }
            tracing::debug!(pid, signal = signal.as_str(), descendants = members.len(), "signalled process tree");
        }

        tree?;
        delivered.map_err(SignalError::from)
    }
}

/// Parent pid -> child pids for every process visible to us.
pub type ProcessTable = HashMap<u32, Vec<u32>>;

#[cfg(target_os = "linux")]
fn process_table() -> Result<ProcessTable, SignalError> {
    let entries = std::fs::read_dir("/proc").map_err(|e| SignalError::Lookup(e.to_string()))?;
    let mut table = ProcessTable::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes can vanish between listing and reading.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_stat_ppid(&stat) {
            table.entry(ppid).or_default().push(pid);
        }
    }
    Ok(table)
}

#[cfg(not(target_os = "linux"))]
fn process_table() -> Result<ProcessTable, SignalError> {
    let output = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=", "-o", "ppid="])
        .output()
        .map_err(|e| SignalError::Lookup(format!("failed to run ps: {e}")))?;
    if !output.status.success() {
        return Err(SignalError::Lookup(format!("ps exited with {}", output.status)));
    }
    Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Extract the parent pid from the contents of `/proc/<pid>/stat`.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Parse `ps -o pid= -o ppid=` output into a process table.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub fn parse_ps_output(output: &str) -> ProcessTable {
    let mut table = ProcessTable::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(ppid)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let (Ok(pid), Ok(ppid)) = (pid.parse::<u32>(), ppid.parse::<u32>()) {
            table.entry(ppid).or_default().push(pid);
        }
    }
    table
}

/// All descendants of `root`, excluding `root` itself.
pub fn descendants(table: &ProcessTable, root: u32) -> Vec<u32> {
    let mut found = Vec::new();
    let mut queue = vec![root];
    while let Some(parent) = queue.pop() {
        for &child in table.get(&parent).map(Vec::as_slice).unwrap_or_default() {
            if child != root && !found.contains(&child) {
                found.push(child);
                queue.push(child);
            }
        }
    }
    found
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The child had already exited; nothing was signalled.
    AlreadyExited,
    /// The child exited after being signalled.
    Stopped { reason: ExitReason, escalated: bool },
}

/// Stops child processes: SIGTERM to the tree, SIGKILL when that cannot be
/// delivered or the grace period runs out.
pub struct Terminator<S = ProcessTree> {
    signaller: S,
    grace: Option<Duration>,
    kill_grace: Duration,
}

impl<S: Signaller> Terminator<S> {
    /// `grace` bounds the wait after SIGTERM (`None` waits forever);
    /// `kill_grace` bounds the wait after SIGKILL.
    pub fn new(signaller: S, grace: Option<Duration>, kill_grace: Duration) -> Self {
        Self {
            signaller,
            grace,
            kill_grace,
        }
    }

    /// Stop `child` and wait until its exit has been observed.
    ///
    /// Idempotent: an exited child returns `AlreadyExited` without signalling.
    pub async fn stop(&self, child: &ChildProcess) -> Result<StopOutcome, TerminateError> {
        let pid = match child.pid() {
            Some(pid) if !child.has_exited() => pid,
            _ => return Ok(StopOutcome::AlreadyExited),
        };

        let mut escalated = false;
        if let Err(e) = self.signaller.signal_tree(pid, Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "graceful termination failed, escalating to SIGKILL");
            self.kill(pid);
            escalated = true;
        }

        let Some(grace) = self.grace else {
            let reason = child.exited().await;
            return Ok(StopOutcome::Stopped { reason, escalated });
        };

        if let Ok(reason) = tokio::time::timeout(grace, child.exited()).await {
            return Ok(StopOutcome::Stopped { reason, escalated });
        }

        tracing::warn!(
            pid,
            grace_secs = grace.as_secs_f64(),
            "process tree ignored SIGTERM, sending SIGKILL"
        );
        self.kill(pid);
        match tokio::time::timeout(self.kill_grace, child.exited()).await {
            Ok(reason) => Ok(StopOutcome::Stopped {
                reason,
                escalated: true,
            }),
            Err(_) => {
                let err = TerminateError::Unresponsive {
                    pid,
                    waited_secs: self.kill_grace.as_secs(),
                };
                tracing::error!(pid, "{}", err);
                Err(err)
            }
        }
    }

    /// Send SIGKILL to the child's tree right away, without waiting.
    pub fn force(&self, child: &ChildProcess) {
        if let Some(pid) = child.pid().filter(|_| !child.has_exited()) {
            self.kill(pid);
        }
    }

    fn kill(&self, pid: u32) {
        if let Err(e) = self.signaller.signal_tree(pid, Signal::SIGKILL) {
            tracing::debug!(pid, error = %e, "SIGKILL delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// Records every request; delivers through the real tree signaller only
    /// for the signals it is told to.
    #[derive(Clone, Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<Signal>>>,
        fail_graceful: bool,
        deliver_graceful: bool,
        deliver_kill: bool,
    }

    impl Recording {
        fn calls(&self) -> Vec<Signal> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Signaller for Recording {
        fn signal_tree(&self, pid: u32, signal: Signal) -> Result<(), SignalError> {
            self.calls.lock().unwrap().push(signal);
            match signal {
                Signal::SIGTERM if self.fail_graceful => {
                    Err(SignalError::Lookup("simulated failure".to_string()))
                }
                Signal::SIGTERM if !self.deliver_graceful => Ok(()),
                Signal::SIGKILL if !self.deliver_kill => Ok(()),
                _ => ProcessTree.signal_tree(pid, signal),
            }
        }
    }

    fn sh(script: &str) -> ChildProcess {
        ChildProcess::spawn("sh", &["-c".into(), script.into()])
    }

    #[cfg(target_os = "linux")]
    fn is_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => {
                let state = stat.rsplit_once(')').map(|(_, rest)| rest.trim_start());
                !matches!(state.and_then(|s| s.chars().next()), Some('Z') | None)
            }
            Err(_) => false,
        }
    }

    #[test]
    fn test_parse_stat_ppid() {
        assert_eq!(parse_stat_ppid("1234 (node) S 1 1234 1234 0 -1"), Some(1));
        assert_eq!(
            parse_stat_ppid("77 (weird ) name) (x) R 42 77 77 0 -1"),
            Some(42)
        );
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[test]
    fn test_parse_ps_output() {
        let table = parse_ps_output("  1     0\n 10     1\n 11    10\n bogus line\n 12    10\n");
        assert_eq!(table.get(&1), Some(&vec![10]));
        assert_eq!(table.get(&10), Some(&vec![11, 12]));
    }

    #[test]
    fn test_descendants_walks_whole_tree() {
        let table = parse_ps_output("10 1\n11 10\n12 10\n13 11\n14 13\n20 1\n");
        let mut found = descendants(&table, 10);
        found.sort_unstable();
        assert_eq!(found, vec![11, 12, 13, 14]);
        assert!(descendants(&table, 14).is_empty());
        assert!(descendants(&table, 99).is_empty());
    }

    #[tokio::test]
    async fn test_stop_already_exited_is_noop() {
        let signaller = Recording::default();
        let terminator = Terminator::new(signaller.clone(), None, Duration::from_secs(1));
        let child = sh("exit 0");
        child.exited().await;

        let outcome = terminator.stop(&child).await.unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyExited);
        assert!(signaller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_spawn_failure_is_noop() {
        let terminator = Terminator::new(Recording::default(), None, Duration::from_secs(1));
        let child = ChildProcess::spawn("nonexistent-binary-xyz", &[]);
        assert_eq!(terminator.stop(&child).await.unwrap(), StopOutcome::AlreadyExited);
    }

    #[tokio::test]
    async fn test_stop_sends_graceful_signal() {
        let signaller = Recording {
            deliver_graceful: true,
            deliver_kill: true,
            ..Default::default()
        };
        let terminator = Terminator::new(signaller.clone(), None, Duration::from_secs(1));
        let child = sh("sleep 30");

        let outcome = terminator.stop(&child).await.unwrap();
        assert_eq!(
            outcome,
            StopOutcome::Stopped {
                reason: ExitReason::Signal(Signal::SIGTERM as i32),
                escalated: false,
            }
        );
        assert_eq!(signaller.calls(), vec![Signal::SIGTERM]);
    }

    #[tokio::test]
    async fn test_failed_graceful_signal_escalates_immediately() {
        let signaller = Recording {
            fail_graceful: true,
            deliver_kill: true,
            ..Default::default()
        };
        let terminator = Terminator::new(
            signaller.clone(),
            Some(Duration::from_secs(30)),
            Duration::from_secs(5),
        );
        let child = sh("sleep 30");

        let started = Instant::now();
        let outcome = terminator.stop(&child).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            outcome,
            StopOutcome::Stopped {
                reason: ExitReason::Signal(Signal::SIGKILL as i32),
                escalated: true,
            }
        );
        assert_eq!(signaller.calls(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test]
    async fn test_ignored_graceful_signal_escalates_after_grace() {
        // SIGTERM is "sent" but never delivered, as if the tree ignored it.
        let signaller = Recording {
            deliver_kill: true,
            ..Default::default()
        };
        let terminator = Terminator::new(
            signaller.clone(),
            Some(Duration::from_millis(200)),
            Duration::from_secs(5),
        );
        let child = sh("sleep 30");

        let outcome = terminator.stop(&child).await.unwrap();
        assert!(matches!(outcome, StopOutcome::Stopped { escalated: true, .. }));
        assert_eq!(signaller.calls(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test]
    async fn test_unkillable_tree_reports_unresponsive() {
        let signaller = Recording::default();
        let terminator = Terminator::new(
            signaller.clone(),
            Some(Duration::from_millis(50)),
            Duration::from_millis(50),
        );
        let child = sh("sleep 30");
        let pid = child.pid().unwrap();

        let err = terminator.stop(&child).await.unwrap_err();
        assert!(matches!(err, TerminateError::Unresponsive { pid: p, .. } if p == pid));
        assert_eq!(signaller.calls(), vec![Signal::SIGTERM, Signal::SIGKILL]);

        killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
        child.exited().await;
    }

    #[tokio::test]
    async fn test_force_kills_without_waiting() {
        let signaller = Recording {
            deliver_kill: true,
            ..Default::default()
        };
        let terminator = Terminator::new(signaller.clone(), None, Duration::from_secs(1));
        let child = sh("trap '' TERM; sleep 30");

        terminator.force(&child);
        assert_eq!(child.exited().await, ExitReason::Signal(Signal::SIGKILL as i32));
        assert_eq!(signaller.calls(), vec![Signal::SIGKILL]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_reaches_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let child = sh(&format!("sleep 30 & echo $! > {}; wait", pid_file.display()));

        let mut grandchild = None;
        for _ in 0..100 {
            if let Ok(contents) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = contents.trim().parse::<u32>() {
                    grandchild = Some(pid);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let grandchild = grandchild.expect("grandchild pid written");
        assert!(is_alive(grandchild));

        let terminator = Terminator::new(ProcessTree, Some(Duration::from_secs(5)), Duration::from_secs(5));
        terminator.stop(&child).await.unwrap();

        let mut gone = false;
        for _ in 0..100 {
            if !is_alive(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "grandchild {grandchild} survived");
    }
}
