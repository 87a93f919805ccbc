//! Per-device session with the tracking host
//!
//! A session owns the device's transport and packet builder and runs two
//! supervised workers:
//! - The control loop: discovery handshake, host acknowledgement, sensor
//!   announcement, then receiving host traffic while active
//! - The heartbeat loop: keeps the host from timing the device out
//!
//! Data-plane packets are only put on the wire while the session is
//! [`SessionState::Active`]. Everything else is dropped and reported as
//! `Ok(false)` so callers never block on a missing host.

use chrono::{DateTime, Utc};
use nalgebra::{Quaternion, Vector3};
use serde::{Deserialize, Serialize};
use slimebridge_core::{DeviceIdentity, HardwareId, ImuType, TrackerDataType, TrackerPosition, UserActionType};
use slimebridge_protocol::{
    CodecError, HostMessage, PacketBuilder, Transport, BROADCAST_ADDR, DEFAULT_HOST_PORT,
    MAX_DATAGRAM_LEN,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::gate::HandshakeGate;

pub const DEFAULT_HANDSHAKE_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(900);

/// Time allowed for workers to finish after dispose before they are aborted
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shortest timer period a session will run
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

const CONTROL_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Listening,
    Handshaking,
    Active,
    Disposed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Packet encoding failed: {0}")]
    Codec(#[from] CodecError),
    #[error("Session already started")]
    AlreadyStarted,
    #[error("Session is disposed")]
    Disposed,
}

/// Commands accepted on a session's control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Drop the current pairing and run discovery again
    ForceHandshake,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Where handshakes go before the host has answered
    pub discovery_addr: SocketAddr,
    /// Port used on the host once it has answered
    pub host_port: u16,
    pub handshake_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Re-run discovery after this long without hearing from the host
    pub host_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery_addr: SocketAddr::new(BROADCAST_ADDR, DEFAULT_HOST_PORT),
            host_port: DEFAULT_HOST_PORT,
            handshake_interval: DEFAULT_HANDSHAKE_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            host_timeout: None,
        }
    }
}

/// One sensor channel announced to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorChannel {
    pub tracker_id: u8,
    pub position: TrackerPosition,
    pub data_type: TrackerDataType,
}

/// Packets a session can put on the wire after the handshake
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outbound {
    Heartbeat,
    SensorInfo {
        channel: SensorChannel,
        imu: ImuType,
    },
    Rotation {
        tracker_id: u8,
        rotation: Quaternion<f32>,
    },
    Acceleration {
        tracker_id: u8,
        acceleration: Vector3<f32>,
    },
    Gyro {
        tracker_id: u8,
        gyro: Vector3<f32>,
    },
    Magnetometer {
        tracker_id: u8,
        mag: Vector3<f32>,
    },
    FlexData {
        tracker_id: u8,
        value: f32,
    },
    Battery {
        percent: f32,
        voltage: f32,
    },
    UserAction(UserActionType),
    Haptic {
        intensity: f32,
        duration_ms: i32,
    },
}

impl Outbound {
    /// Short name used in dispatch keys and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Heartbeat => "heartbeat",
            Outbound::SensorInfo { .. } => "sensor_info",
            Outbound::Rotation { .. } => "rotation",
            Outbound::Acceleration { .. } => "acceleration",
            Outbound::Gyro { .. } => "gyro",
            Outbound::Magnetometer { .. } => "magnetometer",
            Outbound::FlexData { .. } => "flex",
            Outbound::Battery { .. } => "battery",
            Outbound::UserAction(_) => "user_action",
            Outbound::Haptic { .. } => "haptic",
        }
    }

    fn encode<'a>(&self, builder: &'a mut PacketBuilder) -> Result<&'a [u8], CodecError> {
        match *self {
            Outbound::Heartbeat => builder.heartbeat(0),
            Outbound::SensorInfo { channel, imu } => {
                builder.sensor_info(channel.tracker_id, imu, channel.position, channel.data_type)
            }
            Outbound::Rotation { tracker_id, rotation } => builder.rotation(tracker_id, &rotation),
            Outbound::Acceleration {
                tracker_id,
                acceleration,
            } => builder.acceleration(tracker_id, &acceleration),
            Outbound::Gyro { tracker_id, gyro } => builder.gyro(tracker_id, &gyro),
            Outbound::Magnetometer { tracker_id, mag } => builder.magnetometer(tracker_id, &mag),
            Outbound::FlexData { tracker_id, value } => builder.flex_data(tracker_id, value),
            Outbound::Battery { percent, voltage } => builder.battery_level(percent, voltage),
            Outbound::UserAction(action) => builder.button_pushed(action),
            Outbound::Haptic {
                intensity,
                duration_ms,
            } => builder.haptic(intensity, duration_ms),
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub hardware_id: String,
    pub state: SessionState,
    pub packets_sent: u64,
    pub peer: SocketAddr,
    pub last_handshake: Option<DateTime<Utc>>,
}

/// How the active phase ended
enum ActiveExit {
    Rehandshake,
    Disposed,
}

pub struct DeviceSession {
    id: Uuid,
    identity: DeviceIdentity,
    channels: Vec<SensorChannel>,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    builder: Mutex<PacketBuilder>,
    gate: Arc<HandshakeGate>,
    state_tx: watch::Sender<SessionState>,
    control_tx: mpsc::Sender<SessionCommand>,
    control_rx: StdMutex<Option<mpsc::Receiver<SessionCommand>>>,
    packets_sent: AtomicU64,
    last_handshake: StdRwLock<Option<DateTime<Utc>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl DeviceSession {
    pub fn new(
        identity: DeviceIdentity,
        channels: Vec<SensorChannel>,
        transport: Arc<dyn Transport>,
        gate: Arc<HandshakeGate>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        Arc::new(Self {
            id: Uuid::new_v4(),
            identity,
            channels,
            config,
            transport,
            builder: Mutex::new(PacketBuilder::new()),
            gate,
            state_tx,
            control_tx,
            control_rx: StdMutex::new(Some(control_rx)),
            packets_sent: AtomicU64::new(0),
            last_handshake: StdRwLock::new(None),
            workers: StdMutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn hardware_id(&self) -> &HardwareId {
        self.identity.hardware_id()
    }

    pub fn channels(&self) -> &[SensorChannel] {
        &self.channels
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Sender for this session's control channel
    pub fn controller(&self) -> mpsc::Sender<SessionCommand> {
        self.control_tx.clone()
    }

    pub fn peer(&self) -> SocketAddr {
        self.transport.target()
    }

    pub fn last_handshake(&self) -> Option<DateTime<Utc>> {
        *self.last_handshake.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id,
            hardware_id: self.hardware_id().to_string(),
            state: self.state(),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            peer: self.peer(),
            last_handshake: self.last_handshake(),
        }
    }

    /// Spawn the control and heartbeat workers
    pub fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.state() == SessionState::Disposed {
            return Err(SessionError::Disposed);
        }
        let control_rx = self
            .control_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SessionError::AlreadyStarted)?;

        let control = tokio::spawn(Arc::clone(self).run_control(control_rx));
        let heartbeat = tokio::spawn(Arc::clone(self).run_heartbeat());
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([control, heartbeat]);

        info!(
            hwid = %self.hardware_id(),
            session = %self.id,
            channels = self.channels.len(),
            "Session started"
        );
        Ok(())
    }

    /// Ask the session to pair with the host again
    ///
    /// Returns false if the session has no running control loop.
    pub fn force_handshake(&self) -> bool {
        match self.control_tx.try_send(SessionCommand::ForceHandshake) {
            Ok(()) => true,
            // A command is already pending
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop both workers and close the transport
    ///
    /// A send already on the wire finishes; any other send, including
    /// ones waiting for the packet builder, is rejected.
    pub async fn dispose(&self) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Disposed {
                false
            } else {
                *state = SessionState::Disposed;
                true
            }
        });
        if !changed {
            return;
        }
        info!(hwid = %self.hardware_id(), session = %self.id, "Disposing session");

        // Every send holds the builder; once we hold it, senders that were
        // waiting see Disposed and nothing else reaches the socket
        {
            let _builder = self.builder.lock().await;
            self.transport.close();
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in workers {
            let abort = handle.abort_handle();
            if timeout(WORKER_JOIN_TIMEOUT, handle).await.is_err() {
                warn!(hwid = %self.hardware_id(), "Session worker did not stop, aborting");
                abort.abort();
            }
        }
    }

    /// Send a data-plane packet if the session is active
    ///
    /// Returns `Ok(true)` when the packet reached the socket, `Ok(false)`
    /// when it was dropped.
    pub async fn send(&self, packet: Outbound) -> Result<bool, SessionError> {
        if !self.is_active() {
            trace!(hwid = %self.hardware_id(), kind = packet.kind(), "Dropping packet, session not active");
            return Ok(false);
        }
        self.transmit(&packet, SessionState::Active).await
    }

    /// Encode and send `packet` if the session is still in `required`
    ///
    /// The state is read again under the builder lock, which `dispose`
    /// also takes.
    async fn transmit(&self, packet: &Outbound, required: SessionState) -> Result<bool, SessionError> {
        let mut builder = self.builder.lock().await;
        if self.state() != required {
            trace!(hwid = %self.hardware_id(), kind = packet.kind(), "Dropping packet, state changed");
            return Ok(false);
        }
        let bytes = packet.encode(&mut builder).map_err(|e| {
            error!(hwid = %self.hardware_id(), kind = packet.kind(), error = %e, "Failed to encode packet");
            e
        })?;
        Ok(self.put_on_wire(bytes, packet.kind()).await)
    }

    async fn echo(&self, datagram: &[u8]) -> bool {
        let _builder = self.builder.lock().await;
        if !self.is_active() {
            return false;
        }
        self.put_on_wire(datagram, "ping_pong").await
    }

    async fn send_handshake(&self) -> Result<bool, SessionError> {
        let mut builder = self.builder.lock().await;
        if self.state() != SessionState::Listening {
            return Ok(false);
        }
        let packet = builder.handshake(&self.identity).map_err(|e| {
            error!(hwid = %self.hardware_id(), error = %e, "Failed to encode handshake");
            e
        })?;
        Ok(self.put_on_wire(&packet, "handshake").await)
    }

    async fn put_on_wire(&self, bytes: &[u8], kind: &'static str) -> bool {
        match self.transport.send(bytes).await {
            Ok(_) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(hwid = %self.hardware_id(), kind = kind, error = %e, "Send failed");
                false
            }
        }
    }

    fn set_state(&self, next: SessionState) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Disposed || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(hwid = %self.hardware_id(), state = ?next, "Session state changed");
        }
        changed
    }

    fn is_disposed(&self) -> bool {
        self.state() == SessionState::Disposed
    }

    async fn disposed(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Disposed).await;
    }

    async fn run_control(self: Arc<Self>, mut control_rx: mpsc::Receiver<SessionCommand>) {
        loop {
            if !self.discover(&mut control_rx).await {
                break;
            }
            match self.serve(&mut control_rx).await {
                ActiveExit::Rehandshake => continue,
                ActiveExit::Disposed => break,
            }
        }
        debug!(hwid = %self.hardware_id(), "Control loop stopped");
    }

    /// Run discovery until the host acknowledges; false if disposed first
    async fn discover(&self, control_rx: &mut mpsc::Receiver<SessionCommand>) -> bool {
        self.set_state(SessionState::Idle);
        self.transport.retarget(self.config.discovery_addr);

        let Some(gate) = self.gate.acquire(self.disposed()).await else {
            return false;
        };
        if !self.set_state(SessionState::Listening) {
            return false;
        }
        info!(hwid = %self.hardware_id(), target = %self.config.discovery_addr, "Searching for host");

        let mut ticker = interval(self.config.handshake_interval.max(MIN_TIMER_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; MAX_DATAGRAM_LEN];

        let host = loop {
            tokio::select! {
                _ = self.disposed() => return false,
                _ = ticker.tick() => {
                    if let Err(e) = self.send_handshake().await {
                        warn!(hwid = %self.hardware_id(), error = %e, "Handshake not sent");
                    }
                }
                Some(command) = control_rx.recv() => {
                    debug!(hwid = %self.hardware_id(), command = ?command, "Already searching for host");
                }
                received = self.transport.recv(&mut buf) => match received {
                    Ok((len, from)) => match HostMessage::parse(&buf[..len]) {
                        HostMessage::DiscoveryAck => break from,
                        other => trace!(hwid = %self.hardware_id(), from = %from, message = ?other, "Ignoring datagram while searching"),
                    },
                    Err(e) => debug!(hwid = %self.hardware_id(), error = %e, "Receive failed while searching"),
                },
            }
        };

        if !self.set_state(SessionState::Handshaking) {
            return false;
        }
        let peer = SocketAddr::new(host.ip(), self.config.host_port);
        self.transport.retarget(peer);
        info!(hwid = %self.hardware_id(), host = %peer, "Host acknowledged handshake");

        let imu = self.identity.imu();
        for channel in &self.channels {
            let info = Outbound::SensorInfo { channel: *channel, imu };
            if let Err(e) = self.transmit(&info, SessionState::Handshaking).await {
                warn!(hwid = %self.hardware_id(), tracker = channel.tracker_id, error = %e, "Sensor info not sent");
            }
        }

        drop(gate);
        *self.last_handshake.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.set_state(SessionState::Active)
    }

    /// Handle host traffic while active
    async fn serve(&self, control_rx: &mut mpsc::Receiver<SessionCommand>) -> ActiveExit {
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        let mut last_heard = Instant::now();

        loop {
            let deadline = self.config.host_timeout.map(|t| last_heard + t);
            tokio::select! {
                _ = self.disposed() => return ActiveExit::Disposed,
                Some(SessionCommand::ForceHandshake) = control_rx.recv() => {
                    info!(hwid = %self.hardware_id(), "Forced handshake");
                    return ActiveExit::Rehandshake;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(hwid = %self.hardware_id(), "Host went silent, searching again");
                    return ActiveExit::Rehandshake;
                }
                received = self.transport.recv(&mut buf) => match received {
                    Ok((len, from)) => {
                        last_heard = Instant::now();
                        let datagram = &buf[..len];
                        match HostMessage::parse(datagram) {
                            HostMessage::PingPong { ping_id } => {
                                trace!(hwid = %self.hardware_id(), ping_id = ping_id, "Echoing ping");
                                self.echo(datagram).await;
                            }
                            HostMessage::Handshake => {
                                info!(hwid = %self.hardware_id(), host = %from, "Host requested a new handshake");
                                return ActiveExit::Rehandshake;
                            }
                            other => trace!(hwid = %self.hardware_id(), message = ?other, "Host message"),
                        }
                    }
                    Err(e) => debug!(hwid = %self.hardware_id(), error = %e, "Receive failed"),
                },
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = interval(self.config.heartbeat_interval.max(MIN_TIMER_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.disposed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.transmit(&Outbound::Heartbeat, SessionState::Active).await {
                        warn!(hwid = %self.hardware_id(), error = %e, "Heartbeat not sent");
                    }
                }
            }
        }
        debug!(hwid = %self.hardware_id(), "Heartbeat loop stopped");
    }
}
