//! Registry of virtual devices
//!
//! Owns every registered device, keyed by hardware identifier, and hands
//! out local ids. Registration creates the device's session and trackers
//! together; removal disposes the session.

use serde::{Deserialize, Serialize};
use slimebridge_core::{
    BoardType, DeviceIdentity, HardwareId, IdentityError, ImuType, MagnetometerStatus, McuType,
    TrackerDataType, TrackerPosition,
};
use slimebridge_protocol::{Transport, TransportFactory, UdpTransportFactory};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::dispatch::DispatchQueue;
use crate::gate::HandshakeGate;
use crate::session::{DeviceSession, SensorChannel, SessionConfig, SessionError, SessionStatus};
use crate::tracker::{Delivery, DeliveryMode, Tracker};

/// Most sensor channels one device can announce
pub const MAX_CHANNELS: usize = u8::MAX as usize + 1;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Device {0} is already registered")]
    Duplicate(HardwareId),
    #[error("Invalid device identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("Device needs between 1 and {MAX_CHANNELS} channels, got {0}")]
    ChannelCount(usize),
    #[error("Failed to bind transport: {0}")]
    Bind(#[from] std::io::Error),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelSpec {
    #[serde(default)]
    pub position: TrackerPosition,
    #[serde(default)]
    pub data_type: TrackerDataType,
}

/// Everything needed to register a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub firmware: String,
    pub hardware_id: HardwareId,
    pub board: BoardType,
    pub imu: ImuType,
    pub mcu: McuType,
    pub mag_status: MagnetometerStatus,
    pub channels: Vec<ChannelSpec>,
}

impl DeviceSpec {
    fn identity(&self) -> Result<DeviceIdentity, IdentityError> {
        DeviceIdentity::new(
            self.firmware.clone(),
            self.hardware_id.clone(),
            self.board,
            self.imu,
            self.mcu,
            self.mag_status,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub session: SessionConfig,
    pub delivery: DeliveryMode,
}

/// Registry events for subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    DeviceRegistered {
        hardware_id: HardwareId,
        local_id: u32,
    },
    DeviceRemoved {
        hardware_id: HardwareId,
    },
}

/// A registered device with its session and trackers
pub struct VirtualDevice {
    local_id: u32,
    session: Arc<DeviceSession>,
    trackers: Vec<Arc<Tracker>>,
}

impl VirtualDevice {
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.session.identity()
    }

    pub fn hardware_id(&self) -> &HardwareId {
        self.session.hardware_id()
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn trackers(&self) -> &[Arc<Tracker>] {
        &self.trackers
    }

    pub fn tracker(&self, tracker_id: u8) -> Option<&Arc<Tracker>> {
        self.trackers.get(tracker_id as usize)
    }
}

pub struct Registry {
    devices: RwLock<HashMap<HardwareId, Arc<VirtualDevice>>>,
    next_local_id: AtomicU32,
    gate: Arc<HandshakeGate>,
    dispatch: Arc<DispatchQueue>,
    config: RegistryConfig,
    transports: Arc<dyn TransportFactory>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    /// Registry whose devices each bind their own UDP socket
    pub fn new(config: RegistryConfig, gate: Arc<HandshakeGate>, dispatch: Arc<DispatchQueue>) -> Self {
        Self::with_transports(config, gate, dispatch, Arc::new(UdpTransportFactory))
    }

    pub fn with_transports(
        config: RegistryConfig,
        gate: Arc<HandshakeGate>,
        dispatch: Arc<DispatchQueue>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(HashMap::new()),
            next_local_id: AtomicU32::new(0),
            gate,
            dispatch,
            config,
            transports,
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    pub fn dispatch(&self) -> &Arc<DispatchQueue> {
        &self.dispatch
    }

    /// Register a device on a freshly opened transport and start its session
    pub async fn register(&self, spec: DeviceSpec) -> Result<Arc<VirtualDevice>, RegistryError> {
        if self.contains(&spec.hardware_id).await {
            return Err(RegistryError::Duplicate(spec.hardware_id));
        }
        let transport = self.transports.open(self.config.session.discovery_addr).await?;
        self.register_with_transport(spec, transport).await
    }

    /// Register a device over an already-built transport
    pub async fn register_with_transport(
        &self,
        spec: DeviceSpec,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<VirtualDevice>, RegistryError> {
        let identity = spec.identity()?;
        if spec.channels.is_empty() || spec.channels.len() > MAX_CHANNELS {
            return Err(RegistryError::ChannelCount(spec.channels.len()));
        }

        let mut devices = self.devices.write().await;
        if devices.contains_key(&spec.hardware_id) {
            return Err(RegistryError::Duplicate(spec.hardware_id));
        }

        let channels: Vec<SensorChannel> = spec
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel)| SensorChannel {
                tracker_id: index as u8,
                position: channel.position,
                data_type: channel.data_type,
            })
            .collect();

        let session = DeviceSession::new(
            identity,
            channels.clone(),
            transport,
            Arc::clone(&self.gate),
            self.config.session.clone(),
        );

        let delivery = match self.config.delivery {
            DeliveryMode::Direct => Delivery::Direct,
            DeliveryMode::Queued => Delivery::Queued(Arc::clone(&self.dispatch)),
        };
        let trackers = channels
            .iter()
            .map(|channel| {
                Arc::new(Tracker::new(
                    Arc::clone(&session),
                    channel.tracker_id,
                    channel.position,
                    delivery.clone(),
                ))
            })
            .collect();

        session.start()?;

        let local_id = self.next_local_id.fetch_add(1, Ordering::SeqCst) + 1;
        let device = Arc::new(VirtualDevice {
            local_id,
            session,
            trackers,
        });
        devices.insert(spec.hardware_id.clone(), Arc::clone(&device));
        drop(devices);

        info!(
            hwid = %spec.hardware_id,
            local_id = local_id,
            firmware = %spec.firmware,
            channels = spec.channels.len(),
            "Device registered"
        );
        let _ = self.event_tx.send(RegistryEvent::DeviceRegistered {
            hardware_id: spec.hardware_id,
            local_id,
        });
        Ok(device)
    }

    pub async fn get(&self, hardware_id: &HardwareId) -> Option<Arc<VirtualDevice>> {
        self.devices.read().await.get(hardware_id).cloned()
    }

    pub async fn contains(&self, hardware_id: &HardwareId) -> bool {
        self.devices.read().await.contains_key(hardware_id)
    }

    pub async fn devices(&self) -> Vec<Arc<VirtualDevice>> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    pub async fn statuses(&self) -> Vec<SessionStatus> {
        self.devices
            .read()
            .await
            .values()
            .map(|device| device.session.status())
            .collect()
    }

    /// Dispose a device's session and unregister it
    pub async fn remove(&self, hardware_id: &HardwareId) -> Option<Arc<VirtualDevice>> {
        let device = self.devices.write().await.remove(hardware_id)?;
        device.session.dispose().await;
        info!(hwid = %hardware_id, local_id = device.local_id, "Device removed");
        let _ = self.event_tx.send(RegistryEvent::DeviceRemoved {
            hardware_id: hardware_id.clone(),
        });
        Some(device)
    }

    /// Ask every session to pair again; returns how many accepted
    pub async fn force_handshake_all(&self) -> usize {
        let devices = self.devices.read().await;
        let accepted = devices
            .values()
            .filter(|device| device.session.force_handshake())
            .count();
        debug!(accepted = accepted, total = devices.len(), "Forced handshake on all devices");
        accepted
    }

    pub async fn dispose_all(&self) {
        let drained: Vec<(HardwareId, Arc<VirtualDevice>)> = self.devices.write().await.drain().collect();
        let count = drained.len();
        for (hardware_id, device) in drained {
            device.session.dispose().await;
            let _ = self.event_tx.send(RegistryEvent::DeviceRemoved { hardware_id });
        }
        info!(count = count, "All devices disposed");
    }
}
