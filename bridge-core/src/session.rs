//! Transfer session state machine and progress bookkeeping.

use std::sync::Arc;

use crate::peer::Peer;

/// Direction, seen from the bridge (client) side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bridge -> monitor (`SendResource`).
    Upload,
    /// Monitor -> bridge (`GetResource`).
    Download,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Pending,
    InProgress,
    Completed,
    Failed { reason: Arc<str> },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed { .. })
    }
}

/// One payload-bearing transfer, keyed by `(peer.id, resource_path)`.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub peer: Peer,
    pub resource_path: String,
    pub direction: Direction,
    progress: f64,
    state: SessionState,
}

impl TransferSession {
    pub fn new(peer: Peer, resource_path: impl Into<String>, direction: Direction) -> Self {
        Self {
            peer,
            resource_path: resource_path.into(),
            direction,
            progress: 0.0,
            state: SessionState::Pending,
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.peer.id.clone(), self.resource_path.clone())
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Pending -> InProgress. No-op in any other state.
    pub fn start(&mut self) {
        if self.state == SessionState::Pending {
            self.state = SessionState::InProgress;
        }
    }

    /// Record progress. Implies `start`; values never move backwards and are clamped
    /// to `[0, 1]`. Ignored once terminal. Returns the stored progress.
    pub fn advance(&mut self, progress: f64) -> f64 {
        if self.state.is_terminal() {
            return self.progress;
        }
        self.start();
        let clamped = clamp_unit(progress);
        if clamped > self.progress {
            self.progress = clamped;
        }
        self.progress
    }

    pub fn complete(&mut self) {
        if !self.state.is_terminal() {
            self.progress = 1.0;
            self.state = SessionState::Completed;
        }
    }

    pub fn fail(&mut self, reason: impl Into<Arc<str>>) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed {
                reason: reason.into(),
            };
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Forwards progress to a caller callback as a non-decreasing sequence in `[0, 1]`
/// that ends with exactly one `1.0` on success.
pub(crate) struct ProgressTracker<F: FnMut(f64)> {
    last: Option<f64>,
    callback: F,
}

impl<F: FnMut(f64)> ProgressTracker<F> {
    pub(crate) fn new(callback: F) -> Self {
        Self {
            last: None,
            callback,
        }
    }

    pub(crate) fn report(&mut self, progress: f64) {
        let value = clamp_unit(progress);
        if self.last.is_some_and(|last| value <= last) {
            return;
        }
        self.last = Some(value);
        (self.callback)(value);
    }

    pub(crate) fn finish(&mut self) {
        self.report(1.0);
    }
}
