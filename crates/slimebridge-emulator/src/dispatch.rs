//! Rate-limited, coalescing dispatch of outbound packets
//!
//! Producers enqueue actions under a key; a later action under the same
//! key replaces the pending one, so a slow link only ever sends the most
//! recent value for each tracker and packet kind. A single worker drains
//! the whole pending map per cycle and spaces executions to honor the
//! configured packets-per-second budget.

use futures_util::future::BoxFuture;
use slimebridge_core::HardwareId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace};

pub const DEFAULT_PACKETS_PER_SECOND: u32 = 1000;

/// How long an empty queue waits before checking again
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Coalescing key, `"{hwid}/{tracker_id}/{kind}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchKey(String);

impl DispatchKey {
    pub fn new(hardware_id: &HardwareId, tracker_id: u8, kind: &str) -> Self {
        Self(format!("{}/{}/{}", hardware_id, tracker_id, kind))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub type DispatchAction = BoxFuture<'static, ()>;

pub struct DispatchQueue {
    pending: Mutex<HashMap<DispatchKey, DispatchAction>>,
    spacing: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new(DEFAULT_PACKETS_PER_SECOND)
    }
}

impl DispatchQueue {
    pub fn new(packets_per_second: u32) -> Self {
        let pps = packets_per_second.max(1);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pending: Mutex::new(HashMap::new()),
            spacing: Duration::from_secs(1) / pps,
            shutdown_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DispatchKey, DispatchAction>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delay between two executed actions
    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Store `action` under `key`, replacing any action still pending there
    pub fn enqueue<F>(&self, key: DispatchKey, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.lock().insert(key.clone(), Box::pin(action)).is_some() {
            trace!(key = %key, "Replaced pending action");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take everything pending and execute each action once
    ///
    /// Returns how many actions ran.
    pub async fn run_cycle(&self) -> usize {
        let batch = std::mem::take(&mut *self.lock());
        let count = batch.len();
        for (key, action) in batch {
            trace!(key = %key, "Dispatching");
            action.await;
            sleep(self.spacing).await;
        }
        count
    }

    /// Start the worker draining this queue until [`DispatchQueue::shutdown`]
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(spacing_us = self.spacing.as_micros() as u64, "Dispatch worker started");

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow_and_update() {
                    break;
                }
                let ran = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    ran = queue.run_cycle() => ran,
                };
                if ran == 0 {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = sleep(IDLE_POLL_INTERVAL) => {}
                    }
                }
            }
            debug!("Dispatch worker stopped");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}
