//! Firmware enumerations shared with the tracking host
//!
//! Every value in this module is a wire constant defined by the host
//! protocol. Variants map to fixed integers and must never be renumbered.

use serde::{Deserialize, Serialize};

/// Handshake protocol version reported by emulated firmware
pub const PROTOCOL_VERSION: i32 = 19;

/// Board the virtual tracker claims to be built on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BoardType {
    #[default]
    Unknown = 0,
    SlimevrLegacy = 1,
    SlimevrDev = 2,
    Nodemcu = 3,
    Custom = 4,
    Wroom32 = 5,
    Wemosd1mini = 6,
    TtgoTbase = 7,
    Esp01 = 8,
    Slimevr = 9,
    LolinC3Mini = 10,
    Beetle32c32 = 11,
    Es32c3devkitm1 = 12,
    Owotrack = 13,
    Wrangler = 14,
    Mocopi = 15,
    Wemoswroom02 = 16,
    XiaoEsp32c3 = 17,
    Haritora = 18,
    DevReserved = 250,
}

/// Inertial measurement unit model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ImuType {
    #[default]
    Unknown = 0,
    Mpu9250 = 1,
    Mpu6500 = 2,
    Bno080 = 3,
    Bno085 = 4,
    Bno055 = 5,
    Mpu6050 = 6,
    Bno086 = 7,
    Bmi160 = 8,
    Icm20948 = 9,
    Icm42688 = 10,
    Bmi270 = 11,
    Lsm6ds3trc = 12,
    Lsm6dsv = 13,
    Lsm6dso = 14,
    Lsm6dsr = 15,
    DevReserved = 250,
}

/// Microcontroller family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum McuType {
    #[default]
    Unknown = 0,
    Esp8266 = 1,
    Esp32 = 2,
    OwotrackAndroid = 3,
    Wrangler = 4,
    OwotrackIos = 5,
    Esp32C3 = 6,
    Mocopi = 7,
    Haritora = 8,
    DevReserved = 250,
}

/// Magnetometer capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MagnetometerStatus {
    #[default]
    NotSupported = 0,
    Disabled = 1,
    Enabled = 2,
}

/// Kind of data a sensor channel streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TrackerDataType {
    #[default]
    Rotation = 0,
    FlexResistance = 1,
    FlexAngle = 2,
}

/// Action reported through the button-pushed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum UserActionType {
    ResetFull = 2,
    ResetYaw = 3,
    ResetMounting = 4,
    PauseTracking = 5,
}

/// Body location a sensor channel is mounted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TrackerPosition {
    #[default]
    None = 0,
    Head = 1,
    Neck = 2,
    UpperChest = 3,
    Chest = 4,
    Waist = 5,
    Hip = 6,
    LeftUpperLeg = 7,
    RightUpperLeg = 8,
    LeftLowerLeg = 9,
    RightLowerLeg = 10,
    LeftFoot = 11,
    RightFoot = 12,
    LeftLowerArm = 13,
    RightLowerArm = 14,
    LeftUpperArm = 15,
    RightUpperArm = 16,
    LeftHand = 17,
    RightHand = 18,
    LeftShoulder = 19,
    RightShoulder = 20,
    LeftThumbMetacarpal = 21,
    LeftThumbProximal = 22,
    LeftThumbDistal = 23,
    LeftIndexProximal = 24,
    LeftIndexIntermediate = 25,
    LeftIndexDistal = 26,
    LeftMiddleProximal = 27,
    LeftMiddleIntermediate = 28,
    LeftMiddleDistal = 29,
    LeftRingProximal = 30,
    LeftRingIntermediate = 31,
    LeftRingDistal = 32,
    LeftLittleProximal = 33,
    LeftLittleIntermediate = 34,
    LeftLittleDistal = 35,
    RightThumbMetacarpal = 36,
    RightThumbProximal = 37,
    RightThumbDistal = 38,
    RightIndexProximal = 39,
    RightIndexIntermediate = 40,
    RightIndexDistal = 41,
    RightMiddleProximal = 42,
    RightMiddleIntermediate = 43,
    RightMiddleDistal = 44,
    RightRingProximal = 45,
    RightRingIntermediate = 46,
    RightRingDistal = 47,
    RightLittleProximal = 48,
    RightLittleIntermediate = 49,
    RightLittleDistal = 50,
}

macro_rules! wire_code {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                /// Wire value of this variant
                pub const fn code(self) -> u8 {
                    self as u8
                }
            }
        )*
    };
}

wire_code!(
    BoardType,
    ImuType,
    McuType,
    MagnetometerStatus,
    TrackerDataType,
    UserActionType,
    TrackerPosition,
);
