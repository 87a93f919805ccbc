//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use slimebridge_core::{
    BoardType, HardwareId, ImuType, MagnetometerStatus, McuType, TrackerDataType, TrackerPosition,
};
use slimebridge_emulator::{ChannelSpec, DeliveryMode, DeviceSpec, RegistryConfig, SessionConfig};
use slimebridge_protocol::DEFAULT_HOST_PORT;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Where handshakes are sent until the host answers
    #[serde(default = "default_discovery_addr")]
    pub discovery_addr: IpAddr,
    /// Host tracker port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            discovery_addr: default_discovery_addr(),
            port: default_port(),
        }
    }
}

fn default_discovery_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_port() -> u16 {
    DEFAULT_HOST_PORT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Rate limit of the shared dispatch queue
    #[serde(default = "default_packets_per_second")]
    pub packets_per_second: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            packets_per_second: default_packets_per_second(),
        }
    }
}

fn default_packets_per_second() -> u32 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_handshake_interval")]
    pub handshake_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_gate_poll_interval")]
    pub gate_poll_interval_ms: u64,
    /// Re-handshake after this much host silence (0 to disable)
    #[serde(default)]
    pub host_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_interval_ms: default_handshake_interval(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            gate_poll_interval_ms: default_gate_poll_interval(),
            host_timeout_ms: 0,
        }
    }
}

fn default_handshake_interval() -> u64 {
    1000
}

fn default_heartbeat_interval() -> u64 {
    900
}

fn default_gate_poll_interval() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Drive trackers from generated motion
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rate_hz")]
    pub rate_hz: u32,
    /// How trackers hand packets to their session
    #[serde(default)]
    pub delivery: DeliveryMode,
    /// Source address reported for generated pose routes
    #[serde(default = "default_source_ip")]
    pub source_ip: IpAddr,
    /// Body parts routed as separate devices
    #[serde(default = "default_body_parts")]
    pub body_parts: Vec<String>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_hz: default_rate_hz(),
            delivery: DeliveryMode::default(),
            source_ip: default_source_ip(),
            body_parts: default_body_parts(),
        }
    }
}

fn default_rate_hz() -> u32 {
    60
}

fn default_source_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_body_parts() -> Vec<String> {
    vec!["hip".to_string(), "left_foot".to_string(), "right_foot".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name, also the seed of the derived hardware id
    pub name: String,
    #[serde(default = "default_firmware")]
    pub firmware: String,
    /// Hex hardware id; derived from the name when absent
    #[serde(default)]
    pub hwid: Option<String>,
    #[serde(default = "default_board")]
    pub board: BoardType,
    #[serde(default = "default_imu")]
    pub imu: ImuType,
    #[serde(default = "default_mcu")]
    pub mcu: McuType,
    #[serde(default)]
    pub mag_status: MagnetometerStatus,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default)]
    pub position: TrackerPosition,
}

fn default_firmware() -> String {
    "SlimeBridge".to_string()
}

fn default_board() -> BoardType {
    BoardType::Custom
}

fn default_imu() -> ImuType {
    ImuType::Bno085
}

fn default_mcu() -> McuType {
    McuType::Esp32
}

fn default_channels() -> u8 {
    1
}

impl DeviceConfig {
    pub fn hardware_id(&self) -> Result<HardwareId> {
        match &self.hwid {
            Some(hex) => HardwareId::from_hex(hex)
                .with_context(|| format!("device '{}' has an invalid hwid", self.name)),
            None => Ok(HardwareId::derive(&self.name)),
        }
    }

    /// Registration request for this device; the first channel carries `position`
    pub fn to_spec(&self) -> Result<DeviceSpec> {
        let channels = (0..self.channels.max(1))
            .map(|index| ChannelSpec {
                position: if index == 0 {
                    self.position
                } else {
                    TrackerPosition::None
                },
                data_type: TrackerDataType::Rotation,
            })
            .collect();

        Ok(DeviceSpec {
            firmware: self.firmware.clone(),
            hardware_id: self.hardware_id()?,
            board: self.board,
            imu: self.imu,
            mcu: self.mcu,
            mag_status: self.mag_status,
            channels,
        })
    }
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            discovery_addr: SocketAddr::new(self.host.discovery_addr, self.host.port),
            host_port: self.host.port,
            handshake_interval: Duration::from_millis(self.session.handshake_interval_ms),
            heartbeat_interval: Duration::from_millis(self.session.heartbeat_interval_ms),
            host_timeout: match self.session.host_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            session: self.session_config(),
            delivery: self.synthetic.delivery,
        }
    }

    pub fn gate_poll_interval(&self) -> Duration {
        Duration::from_millis(self.session.gate_poll_interval_ms)
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        info!(path = %path.display(), devices = config.devices.len(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save an example configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        synthetic: SyntheticConfig {
            enabled: true,
            ..SyntheticConfig::default()
        },
        devices: vec![DeviceConfig {
            name: "chest".to_string(),
            firmware: default_firmware(),
            hwid: None,
            board: default_board(),
            imu: default_imu(),
            mcu: default_mcu(),
            mag_status: MagnetometerStatus::NotSupported,
            channels: 1,
            position: TrackerPosition::Chest,
        }],
        ..Config::default()
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}
