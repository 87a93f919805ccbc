//! SlimeBridge Emulator - Virtual tracker devices
//!
//! This crate turns pose data into traffic from emulated tracker hardware:
//! - Per-device sessions running the discovery handshake and heartbeat
//! - A process-wide gate so only one device handshakes at a time
//! - Trackers holding the latest sensor values of each channel
//! - A coalescing dispatch queue for rate-limited sends
//! - The device registry and the pose router feeding it

pub mod dispatch;
pub mod gate;
pub mod registry;
pub mod router;
pub mod session;
pub mod tracker;

#[cfg(test)]
mod mock;

pub use dispatch::{DispatchKey, DispatchQueue, DEFAULT_PACKETS_PER_SECOND};
pub use gate::{GateGuard, HandshakeGate, DEFAULT_GATE_POLL_INTERVAL};
pub use registry::{
    ChannelSpec, DeviceSpec, Registry, RegistryConfig, RegistryError, RegistryEvent, VirtualDevice,
};
pub use router::{DeviceTemplate, PoseRouter, PoseSample, RouterError};
pub use session::{
    DeviceSession, Outbound, SensorChannel, SessionCommand, SessionConfig, SessionError,
    SessionState, SessionStatus,
};
pub use tracker::{Delivery, DeliveryMode, Tracker};
