//! SlimeBridge Core - Shared types for tracker emulation
//!
//! This crate provides the foundational pieces the other crates build on:
//! - Firmware enumerations with their fixed wire values
//! - Hardware identifiers and the immutable device identity
//! - Calibration and coordinate-frame math for incoming poses

pub mod calibration;
pub mod device;
pub mod firmware;

pub use calibration::{
    calibrated_rotation, floor_height, quat_from_gravity, rhs_to_lhs_position,
    rhs_to_lhs_rotation, CalibrationBaseline, PoseCalibration,
};
pub use device::{DeviceIdentity, HardwareId, IdentityError};
pub use firmware::{
    BoardType, ImuType, MagnetometerStatus, McuType, TrackerDataType, TrackerPosition,
    UserActionType, PROTOCOL_VERSION,
};
