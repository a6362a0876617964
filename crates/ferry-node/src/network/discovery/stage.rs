//! Worker Stages
//!
//! Every discovery worker moves through the same stage set; the
//! DHT-specific stages are simply never entered on the mDNS path.
//! `Stopped` and `Error` are terminal.

use std::sync::{Arc, RwLock};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Idle,
    /// Connecting to the bootstrap peers (DHT only).
    Bootstrapping,
    /// Blocked until the host reports a public address (DHT only).
    WaitingForPublicAddrs,
    /// Announcing the current rendezvous identifier.
    Provide,
    /// Resolving the current rendezvous identifier.
    Lookup,
    /// Between lookup attempts.
    Retrying,
    Stopped,
    Error,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Stopped | Stage::Error)
    }
}

/// Snapshot of a worker's progress.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub stage: Stage,
    pub error: Option<String>,
    /// Set when the worker stopped because the session was cancelled rather
    /// than because it completed.
    pub cancelled: bool,
}

impl WorkerStatus {
    /// Human-readable one-word status for the final report.
    pub fn describe(&self) -> &'static str {
        match self.stage {
            Stage::Idle => "not started",
            Stage::Stopped if self.cancelled => "cancelled",
            Stage::Stopped => "stopped",
            Stage::Error => "failed",
            _ => "ready",
        }
    }
}

/// Shared, clonable handle onto one worker's status.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<RwLock<WorkerStatus>>,
    name: &'static str,
}

impl StatusHandle {
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(WorkerStatus::default())),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> WorkerStatus {
        self.inner.read().expect("worker status poisoned").clone()
    }

    pub fn stage(&self) -> Stage {
        self.inner.read().expect("worker status poisoned").stage
    }

    pub fn set_stage(&self, stage: Stage) {
        let mut status = self.inner.write().expect("worker status poisoned");
        debug!(worker = self.name, stage = ?stage, "Worker stage changed");
        status.stage = stage;
    }

    pub fn set_stopped(&self, cancelled: bool) {
        let mut status = self.inner.write().expect("worker status poisoned");
        debug!(worker = self.name, cancelled, "Worker stopped");
        status.stage = Stage::Stopped;
        status.cancelled = cancelled;
    }

    pub fn set_error(&self, err: impl ToString) {
        let mut status = self.inner.write().expect("worker status poisoned");
        let message = err.to_string();
        debug!(worker = self.name, error = %message, "Worker failed");
        status.stage = Stage::Error;
        status.error = Some(message);
    }
}
