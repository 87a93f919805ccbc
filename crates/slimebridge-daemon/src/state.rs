//! Application state management

use anyhow::Result;
use slimebridge_emulator::{
    DeviceTemplate, DispatchQueue, HandshakeGate, PoseRouter, Registry, RegistryEvent,
    SessionState,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::Config;

/// How often the session summary is logged
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state
pub struct AppState {
    /// Registered virtual devices
    pub registry: Arc<Registry>,
    /// Upstream pose routing
    pub router: Arc<PoseRouter>,
    /// Rate-limited send queue
    pub dispatch: Arc<DispatchQueue>,
    /// Configuration
    pub config: Config,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Create services and register the configured devices
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let gate = Arc::new(HandshakeGate::new(config.gate_poll_interval()));
        let dispatch = Arc::new(DispatchQueue::new(config.dispatch.packets_per_second));
        let registry = Arc::new(Registry::new(
            config.registry_config(),
            gate,
            Arc::clone(&dispatch),
        ));
        let router = Arc::new(PoseRouter::new(
            Arc::clone(&registry),
            DeviceTemplate::default(),
        ));

        let dispatch_worker = dispatch.spawn();

        // Log registry changes
        let mut rx = registry.subscribe();
        let event_logger = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    RegistryEvent::DeviceRegistered {
                        hardware_id,
                        local_id,
                    } => info!(hwid = %hardware_id, local_id = local_id, "Virtual device online"),
                    RegistryEvent::DeviceRemoved { hardware_id } => {
                        info!(hwid = %hardware_id, "Virtual device removed")
                    }
                }
            }
        });

        let status_logger = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                let mut ticker = interval(STATUS_LOG_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    log_statuses(&registry).await;
                }
            }
        });

        let state = Arc::new(Self {
            registry,
            router,
            dispatch,
            config,
            workers: Mutex::new(vec![dispatch_worker, event_logger, status_logger]),
        });

        for device in &state.config.devices {
            let spec = device.to_spec()?;
            state.registry.register(spec).await?;
        }

        Ok(state)
    }

    /// Track a background task so shutdown can stop it
    pub fn adopt(&self, handle: JoinHandle<()>) {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Dispose every device and stop background work
    pub async fn shutdown(&self) {
        self.registry.dispose_all().await;
        self.dispatch.shutdown();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in workers {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task failed");
                }
            }
        }
        info!("Shutdown complete");
    }
}

/// Log one line per session and a summary; returns the active count
async fn log_statuses(registry: &Registry) -> usize {
    let statuses = registry.statuses().await;
    for status in &statuses {
        debug!(
            hwid = %status.hardware_id,
            session = %status.session_id,
            state = ?status.state,
            peer = %status.peer,
            packets = status.packets_sent,
            last_handshake = ?status.last_handshake,
            "Session status"
        );
    }
    let active = statuses
        .iter()
        .filter(|status| status.state == SessionState::Active)
        .count();
    info!(devices = statuses.len(), active = active, "Session summary");
    active
}
