//! Shutdown signalling and supervised background tasks.
//!
//! Every long-lived task is spawned through [`spawn_supervised`]. If it
//! returns an error or panics, the fault is turned into a
//! [`Shutdown::Fatal`] on the shutdown channel. `main` acts on the first
//! reason it receives and ignores the rest.

use crate::error::RelayError;
use log::{error, warn};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shutdown {
    /// SIGINT / SIGTERM
    Signal,
    /// `stop` from the operator console
    Operator,
    Fatal(String),
}

impl Shutdown {
    pub fn exit_code(&self) -> u8 {
        match self {
            Shutdown::Signal | Shutdown::Operator => 0,
            Shutdown::Fatal(_) => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::UnboundedSender<Shutdown>,
}

impl ShutdownHandle {
    pub fn trigger(&self, reason: Shutdown) {
        if self.tx.send(reason).is_err() {
            warn!("Shutdown already in progress");
        }
    }
}

pub fn channel() -> (ShutdownHandle, mpsc::UnboundedReceiver<Shutdown>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ShutdownHandle { tx }, rx)
}

/// Spawns `task` and reports its failure as a fatal shutdown. The returned
/// handle aborts the task itself; an aborted task is not reported.
pub fn spawn_supervised<F>(name: &'static str, shutdown: ShutdownHandle, task: F) -> AbortHandle
where
    F: Future<Output = Result<(), RelayError>> + Send + 'static,
{
    let handle = tokio::spawn(task);
    let abort = handle.abort_handle();

    tokio::spawn(async move {
        let reason = match handle.await {
            Ok(Ok(())) => {
                warn!("Task {} exited", name);
                return;
            }
            Ok(Err(e)) => format!("{} failed: {}", name, e),
            Err(e) if e.is_panic() => format!("panic in {}: {}", name, e),
            Err(_) => return,
        };
        error!("{}", reason);
        shutdown.trigger(Shutdown::Fatal(reason));
    });

    abort
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn explode() -> Result<(), RelayError> {
        panic!("sweeper exploded");
    }

    async fn run_forever() -> Result<(), RelayError> {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        }
    }

    #[tokio::test]
    async fn test_error_becomes_fatal_shutdown() {
        let (handle, mut rx) = channel();
        spawn_supervised("failing", handle, async {
            Err(RelayError::Io(std::io::Error::other("accept loop gave up")))
        });

        match rx.recv().await.unwrap() {
            Shutdown::Fatal(reason) => {
                assert!(reason.contains("failing"));
                assert!(reason.contains("accept loop gave up"));
            }
            other => panic!("unexpected shutdown {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_fatal_shutdown() {
        let (handle, mut rx) = channel();
        spawn_supervised("panicking", handle, explode());

        let reason = rx.recv().await.unwrap();
        assert_eq!(reason.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_aborted_task_is_not_reported() {
        let (handle, mut rx) = channel();
        let abort = spawn_supervised("looping", handle.clone(), run_forever());
        abort.abort();
        tokio::task::yield_now().await;

        handle.trigger(Shutdown::Operator);
        assert_eq!(rx.recv().await.unwrap(), Shutdown::Operator);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Shutdown::Signal.exit_code(), 0);
        assert_eq!(Shutdown::Operator.exit_code(), 0);
        assert_eq!(Shutdown::Fatal("x".into()).exit_code(), 1);
    }
}
