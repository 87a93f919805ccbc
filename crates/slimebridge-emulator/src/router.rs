//! Routing of upstream pose samples onto virtual devices
//!
//! Each `(source ip, body part)` pair becomes its own single-channel
//! device whose hardware id is derived from that pair, registered the
//! first time a sample for it arrives.

use nalgebra::{Quaternion, Vector3};
use slimebridge_core::{
    floor_height, rhs_to_lhs_position, rhs_to_lhs_rotation, BoardType, HardwareId, ImuType,
    MagnetometerStatus, McuType, TrackerDataType, TrackerPosition,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::registry::{ChannelSpec, DeviceSpec, Registry, RegistryError, VirtualDevice};
use crate::session::SessionError;

/// One pose reading from an upstream source, in its right-handed frame
#[derive(Debug, Clone, PartialEq)]
pub struct PoseSample {
    pub body_part: String,
    pub source_ip: IpAddr,
    pub tracker_position: TrackerPosition,
    pub position: Vector3<f32>,
    pub rotation: Quaternion<f32>,
}

impl PoseSample {
    /// Key the sample is routed under
    pub fn route_key(&self) -> String {
        format!("{}/{}", self.source_ip, self.body_part)
    }
}

/// Identity shared by every device the router creates
#[derive(Debug, Clone)]
pub struct DeviceTemplate {
    pub firmware: String,
    pub board: BoardType,
    pub imu: ImuType,
    pub mcu: McuType,
    pub mag_status: MagnetometerStatus,
}

impl Default for DeviceTemplate {
    fn default() -> Self {
        Self {
            firmware: "SlimeBridge".to_string(),
            board: BoardType::Custom,
            imu: ImuType::Bno085,
            mcu: McuType::Esp32,
            mag_status: MagnetometerStatus::NotSupported,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct PoseRouter {
    registry: Arc<Registry>,
    template: DeviceTemplate,
    routes: RwLock<HashMap<String, HardwareId>>,
}

impl PoseRouter {
    pub fn new(registry: Arc<Registry>, template: DeviceTemplate) -> Self {
        Self {
            registry,
            template,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Deliver a sample, registering its device on first sight
    ///
    /// Returns true when a rotation went out to the host.
    pub async fn route(&self, sample: &PoseSample) -> Result<bool, RouterError> {
        let device = self.device_for(sample).await?;
        let Some(tracker) = device.tracker(0) else {
            return Ok(false);
        };
        let position = rhs_to_lhs_position(sample.position);
        let rotation = rhs_to_lhs_rotation(sample.rotation);
        Ok(tracker.push_pose(position, rotation).await?)
    }

    async fn device_for(&self, sample: &PoseSample) -> Result<Arc<VirtualDevice>, RouterError> {
        let key = sample.route_key();
        if let Some(hwid) = self.routes.read().await.get(&key) {
            if let Some(device) = self.registry.get(hwid).await {
                return Ok(device);
            }
        }

        let hardware_id = HardwareId::derive(&key);
        let device = match self.registry.get(&hardware_id).await {
            Some(device) => device,
            None => {
                let spec = DeviceSpec {
                    firmware: self.template.firmware.clone(),
                    hardware_id: hardware_id.clone(),
                    board: self.template.board,
                    imu: self.template.imu,
                    mcu: self.template.mcu,
                    mag_status: self.template.mag_status,
                    channels: vec![ChannelSpec {
                        position: sample.tracker_position,
                        data_type: TrackerDataType::Rotation,
                    }],
                };
                match self.registry.register(spec).await {
                    Ok(device) => {
                        info!(route = %key, hwid = %hardware_id, "New pose route");
                        device
                    }
                    Err(RegistryError::Duplicate(_)) => match self.registry.get(&hardware_id).await {
                        Some(device) => device,
                        None => return Err(RegistryError::Duplicate(hardware_id).into()),
                    },
                    Err(e) => return Err(e.into()),
                }
            }
        };

        self.routes.write().await.insert(key, hardware_id);
        Ok(device)
    }

    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    async fn routed_devices(&self) -> Vec<Arc<VirtualDevice>> {
        let routes = self.routes.read().await;
        let mut devices = Vec::with_capacity(routes.len());
        for hwid in routes.values() {
            if let Some(device) = self.registry.get(hwid).await {
                devices.push(device);
            }
        }
        devices
    }

    /// Lowest calibrated height across every routed tracker
    pub async fn floor_height(&self) -> Option<f32> {
        let poses: Vec<_> = self
            .routed_devices()
            .await
            .iter()
            .filter_map(|device| device.tracker(0).map(|t| t.pose()))
            .filter(|pose| pose.baseline().is_some())
            .collect();
        let floor = floor_height(poses.iter());
        debug!(floor = ?floor, trackers = poses.len(), "Computed floor height");
        floor
    }

    /// Calibrated position of one route relative to the current floor
    pub async fn floor_relative_position(&self, source_ip: IpAddr, body_part: &str) -> Option<Vector3<f32>> {
        let floor = self.floor_height().await?;
        let key = format!("{}/{}", source_ip, body_part);
        let hwid = self.routes.read().await.get(&key).cloned()?;
        let device = self.registry.get(&hwid).await?;
        let pose = device.tracker(0)?.pose();
        Some(pose.floor_relative_position(floor))
    }
}
