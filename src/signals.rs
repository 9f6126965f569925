//! Operator signals that end supervision.
//!
//! SIGINT (Ctrl-C) and SIGTERM both stop the child tree and exit. A further
//! signal while that stop is in progress kills the tree immediately.

use std::fmt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Install SIGINT/SIGTERM handlers and deliver each signal on the returned channel.
///
/// Installing replaces the default disposition, so the supervisor is no longer
/// killed by these signals; it decides when to exit.
pub fn install() -> std::io::Result<mpsc::Receiver<ShutdownSignal>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::channel(8);

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = interrupt.recv() => ShutdownSignal::Interrupt,
                Some(()) = terminate.recv() => ShutdownSignal::Terminate,
                else => break,
            };
            tracing::debug!(signal = %received, "operator signal received");
            if tx.send(received).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal};

    #[test]
    fn test_display_names_signal() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }

    #[tokio::test]
    async fn test_installed_handler_reports_sigterm() {
        let mut rx = install().unwrap();
        raise(Signal::SIGTERM).unwrap();
        let received = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(ShutdownSignal::Terminate));
    }
}
