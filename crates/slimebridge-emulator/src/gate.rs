//! Process-wide handshake gate
//!
//! Only one session may run discovery at a time. Sessions poll the gate
//! until they can claim it and hold the returned guard until the host has
//! acknowledged them.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

pub const DEFAULT_GATE_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug)]
pub struct HandshakeGate {
    held: AtomicBool,
    poll_interval: Duration,
}

impl Default for HandshakeGate {
    fn default() -> Self {
        Self::new(DEFAULT_GATE_POLL_INTERVAL)
    }
}

impl HandshakeGate {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            held: AtomicBool::new(false),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<GateGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard {
                gate: Arc::clone(self),
            })
    }

    /// Poll until the gate is claimed, or return `None` once `cancelled` resolves
    pub async fn acquire<F>(self: &Arc<Self>, cancelled: F) -> Option<GateGuard>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancelled);
        loop {
            if let Some(guard) = self.try_acquire() {
                return Some(guard);
            }
            trace!("Handshake gate busy");
            tokio::select! {
                _ = &mut cancelled => return None,
                _ = sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Releases the gate when dropped
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<HandshakeGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.held.store(false, Ordering::Release);
    }
}
