//! Pause, resume and cancel signalling for a running graph
//!
//! The executor blocks on the signal instead of polling it, so a paused run
//! costs nothing until it is resumed or cancelled.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Running,
    Paused,
    Cancelled,
}

/// Cloneable handle shared between the executor and whoever controls it
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    tx: Arc<watch::Sender<ControlSignal>>,
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlSignal::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> ControlSignal {
        *self.tx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.signal() == ControlSignal::Paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal() == ControlSignal::Cancelled
    }

    /// Request a pause at the next task boundary. Has no effect once cancelled.
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Running {
                *signal = ControlSignal::Paused;
                true
            } else {
                false
            }
        })
    }

    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Paused {
                *signal = ControlSignal::Running;
                true
            } else {
                false
            }
        })
    }

    /// Cancellation is sticky until `reset`
    pub fn cancel(&self) {
        self.tx.send_replace(ControlSignal::Cancelled);
    }

    /// Back to running; called at the start of each run
    pub fn reset(&self) {
        self.tx.send_replace(ControlSignal::Running);
    }

    /// Block while paused. Returns `Running` or `Cancelled`.
    pub async fn wait_while_paused(&self) -> ControlSignal {
        let mut rx = self.tx.subscribe();
        let signal = match rx.wait_for(|s| *s != ControlSignal::Paused).await {
            Ok(signal) => *signal,
            Err(_) => ControlSignal::Cancelled,
        };
        signal
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| *s == ControlSignal::Cancelled).await;
    }
}
