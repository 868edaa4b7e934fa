// Persist runner
// Lets any producer ask for an immediate flush without waiting for the timer

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Sending half; cheap to clone and hand to producers
#[derive(Debug, Clone)]
pub struct PersistRunner {
    tx: mpsc::Sender<()>,
}

/// Receiving half; the scheduler owns it and turns signals into persist runs
#[derive(Debug)]
pub struct PersistSignals {
    rx: mpsc::Receiver<()>,
}

impl PersistRunner {
    /// At most one request is ever pending; further requests are absorbed
    /// until the scheduler picks it up.
    pub fn new() -> (Self, PersistSignals) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, PersistSignals { rx })
    }

    /// Request an immediate persist. Returns false when a request is already
    /// pending or nothing is listening anymore.
    pub fn run(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!("Persist already requested, coalescing");
                false
            },
            Err(TrySendError::Closed(())) => {
                warn!("Persist requested but no scheduler is listening");
                false
            },
        }
    }
}

impl PersistSignals {
    /// Wait for the next request; `None` once every runner is dropped
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_coalesce_while_pending() {
        let (runner, mut signals) = PersistRunner::new();

        assert!(runner.run());
        assert!(!runner.run());
        assert!(!runner.clone().run());

        assert_eq!(signals.recv().await, Some(()));
        assert!(runner.run(), "gate reopens once the request is taken");
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (runner, signals) = PersistRunner::new();
        drop(signals);
        assert!(!runner.run());

        let (runner, mut signals) = PersistRunner::new();
        drop(runner);
        assert_eq!(signals.recv().await, None);
    }
}
