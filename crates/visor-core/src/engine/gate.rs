//! Pause/stop control. The engine polls the gate between step starts and
//! between iteration items; a stop request raises a cancel sentinel that
//! unwinds the invocation to the `Stopped` terminal state. Running
//! providers are never interrupted.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateMode {
    Open,
    Paused,
}

/// Raised through `Result` when a stop was requested at a gate point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

#[derive(Clone)]
pub struct ControlGate {
    mode: Arc<watch::Sender<GateMode>>,
    cancel: CancellationToken,
}

impl ControlGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(GateMode::Open);
        Self {
            mode: Arc::new(tx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn pause(&self) {
        let _ = self.mode.send(GateMode::Paused);
    }

    pub fn resume(&self) {
        let _ = self.mode.send(GateMode::Open);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        // Wake anything parked on the pause state.
        let _ = self.mode.send(GateMode::Open);
    }

    pub fn is_paused(&self) -> bool {
        *self.mode.borrow() == GateMode::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Block while paused; return `Err(Stopped)` once a stop is requested.
    pub async fn wait(&self) -> Result<(), Stopped> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Stopped);
            }
            if *self.mode.borrow() != GateMode::Paused {
                return Ok(());
            }
            let mut rx = self.mode.subscribe();
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Stopped),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Default for ControlGate {
    fn default() -> Self {
        Self::new()
    }
}
