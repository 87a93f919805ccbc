//! Outbound packet encoding
//!
//! Every packet starts with a 4-byte big-endian opcode followed by the
//! 8-byte packet id, except the haptic packet which carries a 1-byte
//! opcode after three bytes of padding and no packet id. All multi-byte
//! fields are big-endian.
//!
//! High-frequency packets are written into buffers owned by the builder
//! and sized for their fixed layout, so steady-state streaming does not
//! allocate. Writing past the end of a buffer is reported as
//! [`CodecError::BufferOverflow`] instead of truncating the packet.

use nalgebra::{Quaternion, Vector3};
use slimebridge_core::{DeviceIdentity, ImuType, TrackerDataType, TrackerPosition, UserActionType};
use thiserror::Error;
use tracing::trace;

/// Packet opcodes understood by the host
pub mod opcode {
    pub const HEARTBEAT: u32 = 0;
    pub const ROTATION: u32 = 1;
    pub const GYRO: u32 = 2;
    pub const HANDSHAKE: u32 = 3;
    pub const ACCELERATION: u32 = 4;
    pub const MAG: u32 = 5;
    pub const CONFIG: u32 = 8;
    pub const PING_PONG: u32 = 10;
    pub const BATTERY_LEVEL: u32 = 12;
    pub const SENSOR_INFO: u32 = 15;
    pub const ROTATION_DATA: u32 = 17;
    pub const CALIBRATION_RESET: u32 = 21;
    pub const FLEX_DATA_PACKET: u32 = 26;
    pub const HAPTICS: u32 = 30;
    pub const BUTTON_PUSHED: u32 = 60;
}

const HEADER_LEN: usize = 4 + 8;

pub const HEARTBEAT_LEN: usize = HEADER_LEN + 1;
pub const SENSOR_INFO_LEN: usize = HEADER_LEN + 1 + 1 + 1 + 2 + 1 + 1;
pub const ROTATION_LEN: usize = HEADER_LEN + 1 + 1 + 16 + 1;
pub const ACCELERATION_LEN: usize = HEADER_LEN + 12 + 1;
pub const VECTOR_LEN: usize = HEADER_LEN + 1 + 1 + 12 + 1;
pub const FLEX_DATA_LEN: usize = HEADER_LEN + 1 + 4;
pub const BUTTON_LEN: usize = HEADER_LEN + 1;
pub const BATTERY_LEN: usize = HEADER_LEN + 4 + 4;
pub const HAPTIC_LEN: usize = 3 + 1 + 4 + 4 + 1;

/// Fixed part of the handshake before the firmware name
const HANDSHAKE_FIXED_LEN: usize = HEADER_LEN + 4 * 7 + 1;

/// Data-type byte sent with rotation/gyro/magnetometer samples
const SAMPLE_DATA_TYPE: u8 = 1;
/// Calibration-info byte sent with rotation/gyro/magnetometer samples
const SAMPLE_CALIBRATION_INFO: u8 = 0;
/// Calibration state advertised in sensor info
const SENSOR_CALIBRATION_STATE: i16 = 1;
/// Sensor status advertised in sensor info
const SENSOR_STATUS_OK: u8 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{packet} packet overflowed its {capacity}-byte buffer")]
    BufferOverflow {
        packet: &'static str,
        capacity: usize,
    },
    #[error("Firmware name is {0} bytes, handshake length prefix allows 255")]
    FirmwareNameTooLong(usize),
}

/// Cursor writing big-endian fields into a fixed buffer
struct PacketWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    packet: &'static str,
}

impl<'a> PacketWriter<'a> {
    fn new(buf: &'a mut [u8], packet: &'static str) -> Self {
        Self { buf, pos: 0, packet }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(CodecError::BufferOverflow {
                packet: self.packet,
                capacity: self.buf.len(),
            });
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.put(&[value])
    }

    fn put_i16(&mut self, value: i16) -> Result<(), CodecError> {
        self.put(&value.to_be_bytes())
    }

    fn put_u32(&mut self, value: u32) -> Result<(), CodecError> {
        self.put(&value.to_be_bytes())
    }

    fn put_i32(&mut self, value: i32) -> Result<(), CodecError> {
        self.put(&value.to_be_bytes())
    }

    fn put_u64(&mut self, value: u64) -> Result<(), CodecError> {
        self.put(&value.to_be_bytes())
    }

    fn put_f32(&mut self, value: f32) -> Result<(), CodecError> {
        self.put(&value.to_be_bytes())
    }

    fn header(&mut self, opcode: u32, packet_id: u64) -> Result<(), CodecError> {
        self.put_u32(opcode)?;
        self.put_u64(packet_id)
    }

    fn finish(self) -> usize {
        self.pos
    }
}

/// Packet encoder for one device session
///
/// Owns the session's packet-id counter. Ids start at 0, advance by one
/// per encoded packet and wrap to 0 after `i64::MAX`.
#[derive(Debug)]
pub struct PacketBuilder {
    next_id: u64,
    heartbeat: [u8; HEARTBEAT_LEN],
    sensor_info: [u8; SENSOR_INFO_LEN],
    rotation: [u8; ROTATION_LEN],
    acceleration: [u8; ACCELERATION_LEN],
    gyro: [u8; VECTOR_LEN],
    magnetometer: [u8; VECTOR_LEN],
    flex_data: [u8; FLEX_DATA_LEN],
    button: [u8; BUTTON_LEN],
    battery: [u8; BATTERY_LEN],
    haptic: [u8; HAPTIC_LEN],
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Builder whose first packet carries `packet_id`
    pub fn starting_at(packet_id: u64) -> Self {
        Self {
            next_id: packet_id.min(i64::MAX as u64),
            heartbeat: [0; HEARTBEAT_LEN],
            sensor_info: [0; SENSOR_INFO_LEN],
            rotation: [0; ROTATION_LEN],
            acceleration: [0; ACCELERATION_LEN],
            gyro: [0; VECTOR_LEN],
            magnetometer: [0; VECTOR_LEN],
            flex_data: [0; FLEX_DATA_LEN],
            button: [0; BUTTON_LEN],
            battery: [0; BATTERY_LEN],
            haptic: [0; HAPTIC_LEN],
        }
    }

    /// Id the next encoded packet will carry
    pub fn peek_packet_id(&self) -> u64 {
        self.next_id
    }

    fn next_packet_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = if id >= i64::MAX as u64 { 0 } else { id + 1 };
        id
    }

    pub fn heartbeat(&mut self, tracker_id: u8) -> Result<&[u8], CodecError> {
        let id = self.next_packet_id();
        let mut w = PacketWriter::new(&mut self.heartbeat, "heartbeat");
        w.header(opcode::HEARTBEAT, id)?;
        w.put_u8(tracker_id)?;
        let len = w.finish();
        Ok(&self.heartbeat[..len])
    }

    /// Discovery handshake announcing the device identity
    ///
    /// The firmware name is length-prefixed with one byte; the hardware
    /// identifier follows it unprefixed.
    pub fn handshake(&mut self, identity: &DeviceIdentity) -> Result<Vec<u8>, CodecError> {
        let name = identity.firmware().as_bytes();
        let name_len =
            u8::try_from(name.len()).map_err(|_| CodecError::FirmwareNameTooLong(name.len()))?;
        let mac = identity.hardware_id().as_bytes();
        let mag = identity.mag_status().code() as i32;

        let mut packet = vec![0u8; HANDSHAKE_FIXED_LEN + name.len() + mac.len()];
        let id = self.next_packet_id();
        let mut w = PacketWriter::new(&mut packet, "handshake");
        w.header(opcode::HANDSHAKE, id)?;
        w.put_i32(identity.board().code() as i32)?;
        w.put_i32(identity.imu().code() as i32)?;
        w.put_i32(identity.mcu().code() as i32)?;
        w.put_i32(mag)?;
        w.put_i32(mag)?;
        w.put_i32(mag)?;
        w.put_i32(identity.protocol_version())?;
        w.put_u8(name_len)?;
        w.put(name)?;
        w.put(mac)?;
        let len = w.finish();
        packet.truncate(len);

        trace!(packet_id = id, len = len, "Encoded handshake");
        Ok(packet)
    }

    pub fn sensor_info(
        &mut self,
        tracker_id: u8,
        imu: ImuType,
        position: TrackerPosition,
        data_type: TrackerDataType,
    ) -> Result<&[u8], CodecError> {
        let id = self.next_packet_id();
        let mut w = PacketWriter::new(&mut self.sensor_info, "sensor info");
        w.header(opcode::SENSOR_INFO, id)?;
        w.put_u8(tracker_id)?;
        w.put_u8(SENSOR_STATUS_OK)?;
        w.put_u8(imu.code())?;
        w.put_i16(SENSOR_CALIBRATION_STATE)?;
        w.put_u8(position.code())?;
        w.put_u8(data_type.code())?;
        let len = w.finish();
        Ok(&self.sensor_info[..len])
    }

    pub fn rotation(&mut self, tracker_id: u8, rotation: &Quaternion<f32>) -> Result<&[u8], CodecError> {
        let id = self.next_packet_id();
        let mut w = PacketWriter::new(&mut self.rotation, "rotation");
        w.header(opcode::ROTATION_DATA, id)?;
        w.put_u8(tracker_id)?;
        w.put_u8(SAMPLE_DATA_TYPE)?;
        w.put_f32(rotation.i)?;
        w.put_f32(rotation.j)?;
        w.put_f32(rotation.k)?;
        w.put_f32(rotation.w)?;
        w.put_u8(SAMPLE_CALIBRATION_INFO)?;
        let len = w.finish();
        Ok(&self.rotation[..len])
    }

    pub fn acceleration(&mut self, tracker_id: u8, accel: &Vector3<f32>) -> Result<&[u8], CodecError> {
        let id = self.next_packet_id();
        let mut w = PacketWriter::new(&mut self.acceleration, "acceleration");
        w.header(opcode::ACCELERATION, id)?;
        w.put_f32(accel.x)?;
        w.put_f32(accel.y)?;
        w.put_f32(accel.z)?;
        w.put_u8(tracker_id)?;
        let len = w.finish();
        Ok(&self.acceleration[..len])
    }

    pub fn gyro(&mut self, tracker_id: u8, gyro: &Vector3<f32>) -> Result<&[u8], CodecError> {
        let id = self.next_packet_id();
        let len = write_vector_sample(&mut self.gyro, "gyro", opcode::GYRO, id, tracker_id, gyro)?;
        Ok(&self.gyro[..len])
    }

    pub fn magnetometer(&mut self, tracker_id: u8, mag: &Vector3<f32>) -> Result<&[u8], CodecError> {
        let id = self.next_packet_id();
        let len = write_vector_sample(&mut self.magnetometer, "magnetometer", opcode::MAG, id, tracker_id, mag)?;
        Ok(&self.magnetometer[..len])
    }

    pub fn flex_data(&mut self, tracker_id: u8, value: f32) -> Result<&[u8], CodecError> {
        let id = self.next_packet_id();
        let mut w = PacketWriter::new(&mut self.flex_data, "flex data");
        w.header(opcode::FLEX_DATA_PACKET, id)?;
        w.put_u8(tracker_id)?;
        w.put_f32(value)?;
        let len = w.finish();
        Ok(&self.flex_data[..len])
    }

    pub fn button_pushed(&mut self, action: UserActionType) -> Result<&[u8], CodecError> {
        let id = self.next_packet_id();
        let mut w = PacketWriter::new(&mut self.button, "button");
        w.header(opcode::BUTTON_PUSHED, id)?;
        w.put_u8(action.code())?;
        let len = w.finish();
        Ok(&self.button[..len])
    }

    /// Battery report; `percent` is 0-100 and goes on the wire as a fraction
    pub fn battery_level(&mut self, percent: f32, voltage: f32) -> Result<&[u8], CodecError> {
        let id = self.next_packet_id();
        let mut w = PacketWriter::new(&mut self.battery, "battery");
        w.header(opcode::BATTERY_LEVEL, id)?;
        w.put_f32(voltage)?;
        w.put_f32(percent / 100.0)?;
        let len = w.finish();
        Ok(&self.battery[..len])
    }

    /// Haptic feedback packet; does not consume a packet id
    pub fn haptic(&mut self, intensity: f32, duration_ms: i32) -> Result<&[u8], CodecError> {
        let mut w = PacketWriter::new(&mut self.haptic, "haptic");
        w.put(&[0, 0, 0])?;
        w.put_u8(opcode::HAPTICS as u8)?;
        w.put_f32(intensity)?;
        w.put_i32(duration_ms)?;
        w.put_u8(1)?;
        let len = w.finish();
        Ok(&self.haptic[..len])
    }
}

fn write_vector_sample(
    buf: &mut [u8],
    packet: &'static str,
    opcode: u32,
    packet_id: u64,
    tracker_id: u8,
    value: &Vector3<f32>,
) -> Result<usize, CodecError> {
    let mut w = PacketWriter::new(buf, packet);
    w.header(opcode, packet_id)?;
    w.put_u8(tracker_id)?;
    w.put_u8(SAMPLE_DATA_TYPE)?;
    w.put_f32(value.x)?;
    w.put_f32(value.y)?;
    w.put_f32(value.z)?;
    w.put_u8(SAMPLE_CALIBRATION_INFO)?;
    Ok(w.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slimebridge_core::{BoardType, HardwareId, MagnetometerStatus, McuType, PROTOCOL_VERSION};

    fn be_u32(buf: &[u8], at: usize) -> u32 {
        u32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
    }

    fn be_u64(buf: &[u8], at: usize) -> u64 {
        u64::from_be_bytes(buf[at..at + 8].try_into().unwrap())
    }

    fn be_f32(buf: &[u8], at: usize) -> f32 {
        f32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_packet_ids_are_sequential() {
        let mut builder = PacketBuilder::new();
        let mut ids = Vec::new();
        for i in 0..6 {
            let packet = if i % 2 == 0 {
                builder.heartbeat(0).unwrap().to_vec()
            } else {
                builder.rotation(0, &Quaternion::identity()).unwrap().to_vec()
            };
            ids.push(be_u64(&packet, 4));
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_packet_id_wraps_after_i64_max() {
        let mut builder = PacketBuilder::starting_at(i64::MAX as u64 - 1);
        let a = be_u64(builder.heartbeat(0).unwrap(), 4);
        let b = be_u64(builder.heartbeat(0).unwrap(), 4);
        let c = be_u64(builder.heartbeat(0).unwrap(), 4);
        assert_eq!(a, i64::MAX as u64 - 1);
        assert_eq!(b, i64::MAX as u64);
        assert_eq!(c, 0);
    }

    #[test]
    fn test_rotation_layout() {
        let mut builder = PacketBuilder::new();
        let q = Quaternion::new(1.0, 0.0, 0.0, 0.0);
        let packet = builder.rotation(5, &q).unwrap();

        assert_eq!(packet.len(), ROTATION_LEN);
        assert_eq!(&packet[0..4], &[0, 0, 0, 17]);
        assert_eq!(be_u64(packet, 4), 0);
        assert_eq!(packet[12], 5);
        assert_eq!(packet[13], 1);
        assert_eq!(be_f32(packet, 14), 0.0);
        assert_eq!(be_f32(packet, 18), 0.0);
        assert_eq!(be_f32(packet, 22), 0.0);
        assert_eq!(be_f32(packet, 26), 1.0);
        assert_eq!(&packet[26..30], &[0x3f, 0x80, 0x00, 0x00]);
        assert_eq!(packet[30], 0);
    }

    #[test]
    fn test_acceleration_puts_tracker_id_last() {
        let mut builder = PacketBuilder::new();
        let packet = builder.acceleration(3, &Vector3::new(1.5, -2.0, 9.81)).unwrap();
        assert_eq!(packet.len(), 25);
        assert_eq!(be_u32(packet, 0), opcode::ACCELERATION);
        assert_eq!(be_f32(packet, 12), 1.5);
        assert_eq!(be_f32(packet, 16), -2.0);
        assert_eq!(be_f32(packet, 20), 9.81);
        assert_eq!(packet[24], 3);
    }

    #[test]
    fn test_gyro_and_magnetometer_layout() {
        let mut builder = PacketBuilder::new();
        let gyro = builder.gyro(2, &Vector3::new(0.1, 0.2, 0.3)).unwrap().to_vec();
        let mag = builder.magnetometer(2, &Vector3::new(0.1, 0.2, 0.3)).unwrap().to_vec();

        assert_eq!(gyro.len(), VECTOR_LEN);
        assert_eq!(be_u32(&gyro, 0), opcode::GYRO);
        assert_eq!(be_u32(&mag, 0), opcode::MAG);
        assert_eq!(be_u64(&mag, 4), 1);
        assert_eq!(&gyro[12..14], &[2, 1]);
        assert_eq!(be_f32(&gyro, 22), 0.3);
        assert_eq!(gyro[26], 0);
        assert_eq!(gyro[12..], mag[12..]);
    }

    #[test]
    fn test_handshake_layout() {
        let identity = DeviceIdentity::new(
            "Bridge_EsbToLan",
            HardwareId::from_bytes(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
            BoardType::Custom,
            ImuType::Bno085,
            McuType::Esp32,
            MagnetometerStatus::Enabled,
        )
        .unwrap();

        let mut builder = PacketBuilder::new();
        let packet = builder.handshake(&identity).unwrap();

        assert_eq!(be_u32(&packet, 0), opcode::HANDSHAKE);
        assert_eq!(be_u64(&packet, 4), 0);
        assert_eq!(be_u32(&packet, 12), BoardType::Custom.code() as u32);
        assert_eq!(be_u32(&packet, 16), ImuType::Bno085.code() as u32);
        assert_eq!(be_u32(&packet, 20), McuType::Esp32.code() as u32);
        assert_eq!(be_u32(&packet, 24), 2);
        assert_eq!(be_u32(&packet, 28), 2);
        assert_eq!(be_u32(&packet, 32), 2);
        assert_eq!(be_u32(&packet, 36), PROTOCOL_VERSION as u32);
        assert_eq!(packet[40] as usize, "Bridge_EsbToLan".len());
        assert_eq!(&packet[41..56], b"Bridge_EsbToLan");
        assert_eq!(&packet[56..], &[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
    }

    #[test]
    fn test_sensor_info_layout() {
        let mut builder = PacketBuilder::new();
        let packet = builder
            .sensor_info(1, ImuType::Bno086, TrackerPosition::LeftFoot, TrackerDataType::Rotation)
            .unwrap();
        assert_eq!(packet.len(), 19);
        assert_eq!(be_u32(packet, 0), opcode::SENSOR_INFO);
        assert_eq!(&packet[12..], &[1, 0, 7, 0, 1, 11, 0]);
    }

    #[test]
    fn test_small_packets() {
        let mut builder = PacketBuilder::new();

        let flex = builder.flex_data(4, 0.75).unwrap().to_vec();
        assert_eq!(flex.len(), 17);
        assert_eq!(be_u32(&flex, 0), opcode::FLEX_DATA_PACKET);
        assert_eq!(flex[12], 4);
        assert_eq!(be_f32(&flex, 13), 0.75);

        let button = builder.button_pushed(UserActionType::ResetYaw).unwrap().to_vec();
        assert_eq!(be_u32(&button, 0), opcode::BUTTON_PUSHED);
        assert_eq!(button[12], 3);

        let battery = builder.battery_level(80.0, 3.9).unwrap().to_vec();
        assert_eq!(battery.len(), 20);
        assert_eq!(be_f32(&battery, 12), 3.9);
        assert_eq!(be_f32(&battery, 16), 0.8);
        assert_eq!(be_u64(&battery, 4), 2);
    }

    #[test]
    fn test_haptic_skips_packet_id() {
        let mut builder = PacketBuilder::new();
        let haptic = builder.haptic(0.5, 250).unwrap().to_vec();
        assert_eq!(haptic.len(), HAPTIC_LEN);
        assert_eq!(&haptic[0..4], &[0, 0, 0, 30]);
        assert_eq!(be_f32(&haptic, 4), 0.5);
        assert_eq!(i32::from_be_bytes(haptic[8..12].try_into().unwrap()), 250);
        assert_eq!(haptic[12], 1);
        assert_eq!(builder.peek_packet_id(), 0);
    }

    #[test]
    fn test_writer_rejects_overflow() {
        let mut buf = [0u8; 3];
        let mut w = PacketWriter::new(&mut buf, "tiny");
        assert_eq!(
            w.put_u32(7),
            Err(CodecError::BufferOverflow {
                packet: "tiny",
                capacity: 3
            })
        );
    }
}
