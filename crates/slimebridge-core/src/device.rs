//! Identity of an emulated tracker device

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::firmware::{BoardType, ImuType, MagnetometerStatus, McuType, PROTOCOL_VERSION};

/// Longest hardware identifier accepted in a handshake
pub const MAX_HARDWARE_ID_LEN: usize = 64;

/// Longest firmware name that fits the handshake length prefix
pub const MAX_FIRMWARE_NAME_LEN: usize = u8::MAX as usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Hardware identifier is empty")]
    EmptyHardwareId,
    #[error("Hardware identifier is {0} bytes, limit is {MAX_HARDWARE_ID_LEN}")]
    HardwareIdTooLong(usize),
    #[error("Firmware name is {0} bytes, limit is {MAX_FIRMWARE_NAME_LEN}")]
    FirmwareNameTooLong(usize),
    #[error("Invalid hex hardware identifier: {0}")]
    InvalidHex(String),
}

/// Opaque hardware identifier, usually a MAC-like byte string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareId(Vec<u8>);

impl HardwareId {
    /// Wrap raw identifier bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Parse a hex string, with or without `:` separators
    pub fn from_hex(text: &str) -> Result<Self, IdentityError> {
        let cleaned: String = text.chars().filter(|c| *c != ':' && *c != '-').collect();
        hex::decode(&cleaned)
            .map(Self)
            .map_err(|_| IdentityError::InvalidHex(text.to_string()))
    }

    /// Derive a stable 6-byte MAC-like identifier from a name
    ///
    /// The first octet has the locally-administered bit set and the
    /// multicast bit cleared.
    pub fn derive(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&digest[..6]);
        mac[0] = (mac[0] | 0x02) & 0xfe;
        Self(mac.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for HardwareId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Everything the host learns about a device during the handshake
///
/// Built once when a device is registered and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    firmware: String,
    hardware_id: HardwareId,
    board: BoardType,
    imu: ImuType,
    mcu: McuType,
    mag_status: MagnetometerStatus,
    protocol_version: i32,
}

impl DeviceIdentity {
    pub fn new(
        firmware: impl Into<String>,
        hardware_id: HardwareId,
        board: BoardType,
        imu: ImuType,
        mcu: McuType,
        mag_status: MagnetometerStatus,
    ) -> Result<Self, IdentityError> {
        let firmware = firmware.into();
        if firmware.len() > MAX_FIRMWARE_NAME_LEN {
            return Err(IdentityError::FirmwareNameTooLong(firmware.len()));
        }
        if hardware_id.is_empty() {
            return Err(IdentityError::EmptyHardwareId);
        }
        if hardware_id.len() > MAX_HARDWARE_ID_LEN {
            return Err(IdentityError::HardwareIdTooLong(hardware_id.len()));
        }

        Ok(Self {
            firmware,
            hardware_id,
            board,
            imu,
            mcu,
            mag_status,
            protocol_version: PROTOCOL_VERSION,
        })
    }

    pub fn firmware(&self) -> &str {
        &self.firmware
    }

    pub fn hardware_id(&self) -> &HardwareId {
        &self.hardware_id
    }

    pub fn board(&self) -> BoardType {
        self.board
    }

    pub fn imu(&self) -> ImuType {
        self.imu
    }

    pub fn mcu(&self) -> McuType {
        self.mcu
    }

    pub fn mag_status(&self) -> MagnetometerStatus {
        self.mag_status
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(firmware: &str, hwid: &[u8]) -> Result<DeviceIdentity, IdentityError> {
        DeviceIdentity::new(
            firmware,
            HardwareId::from_bytes(hwid),
            BoardType::Custom,
            ImuType::Bno085,
            McuType::Esp32,
            MagnetometerStatus::NotSupported,
        )
    }

    #[test]
    fn test_hardware_id_from_hex() {
        let id = HardwareId::from_hex("aa:bb:cc:01:02:03").unwrap();
        assert_eq!(id.as_bytes(), &[0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03]);
        assert_eq!(id.to_string(), "aabbcc010203");
        assert!(HardwareId::from_hex("zz").is_err());
    }

    #[test]
    fn test_derived_id_is_stable_local_unicast() {
        let a = HardwareId::derive("192.168.1.20/LeftFoot");
        let b = HardwareId::derive("192.168.1.20/LeftFoot");
        let c = HardwareId::derive("192.168.1.20/RightFoot");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 6);
        assert_eq!(a.as_bytes()[0] & 0x03, 0x02);
    }

    #[test]
    fn test_identity_validation() {
        assert!(identity("Bridge", &[1, 2, 3, 4, 5, 6]).is_ok());
        assert_eq!(
            identity("Bridge", &[]).unwrap_err(),
            IdentityError::EmptyHardwareId
        );
        assert_eq!(
            identity(&"x".repeat(256), &[1]).unwrap_err(),
            IdentityError::FirmwareNameTooLong(256)
        );
        assert_eq!(
            identity("Bridge", &[0u8; 65]).unwrap_err(),
            IdentityError::HardwareIdTooLong(65)
        );
    }

    #[test]
    fn test_identity_reports_protocol_version() {
        let id = identity("Bridge", &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(id.protocol_version(), PROTOCOL_VERSION);
        assert_eq!(id.imu(), ImuType::Bno085);
    }
}
