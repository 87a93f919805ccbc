//! Virtual sensor channel
//!
//! A tracker keeps the latest values pushed into it and forwards each one
//! to its device session, either by sending straight away or through the
//! shared dispatch queue. Nothing is stored or sent until the session has
//! completed its handshake.

use nalgebra::{Quaternion, Vector3};
use serde::{Deserialize, Serialize};
use slimebridge_core::{PoseCalibration, TrackerPosition, UserActionType};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::dispatch::{DispatchKey, DispatchQueue};
use crate::session::{DeviceSession, Outbound, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Await the send on the caller's task
    #[default]
    Direct,
    /// Coalesce through the dispatch queue
    Queued,
}

/// Where a tracker's packets go
#[derive(Clone)]
pub enum Delivery {
    Direct,
    Queued(Arc<DispatchQueue>),
}

impl Delivery {
    pub fn mode(&self) -> DeliveryMode {
        match self {
            Delivery::Direct => DeliveryMode::Direct,
            Delivery::Queued(_) => DeliveryMode::Queued,
        }
    }
}

#[derive(Debug, Clone)]
struct TrackerData {
    rotation: Quaternion<f32>,
    acceleration: Vector3<f32>,
    gyro: Vector3<f32>,
    mag: Vector3<f32>,
    flex: f32,
    battery_percent: f32,
    battery_voltage: f32,
    pose: PoseCalibration,
}

impl Default for TrackerData {
    fn default() -> Self {
        Self {
            rotation: Quaternion::identity(),
            acceleration: Vector3::zeros(),
            gyro: Vector3::zeros(),
            mag: Vector3::zeros(),
            flex: 0.0,
            battery_percent: 100.0,
            battery_voltage: 4.2,
            pose: PoseCalibration::new(),
        }
    }
}

pub struct Tracker {
    tracker_id: u8,
    position: TrackerPosition,
    session: Arc<DeviceSession>,
    delivery: Delivery,
    data: Mutex<TrackerData>,
}

impl Tracker {
    pub fn new(
        session: Arc<DeviceSession>,
        tracker_id: u8,
        position: TrackerPosition,
        delivery: Delivery,
    ) -> Self {
        Self {
            tracker_id,
            position,
            session,
            delivery,
            data: Mutex::new(TrackerData::default()),
        }
    }

    fn data(&self) -> MutexGuard<'_, TrackerData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tracker_id(&self) -> u8 {
        self.tracker_id
    }

    pub fn position(&self) -> TrackerPosition {
        self.position
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery.mode()
    }

    /// True once the owning session is active
    pub fn is_ready(&self) -> bool {
        self.session.is_active()
    }

    pub fn rotation(&self) -> Quaternion<f32> {
        self.data().rotation
    }

    pub fn acceleration(&self) -> Vector3<f32> {
        self.data().acceleration
    }

    pub fn gyro(&self) -> Vector3<f32> {
        self.data().gyro
    }

    pub fn mag_vector(&self) -> Vector3<f32> {
        self.data().mag
    }

    pub fn flex_value(&self) -> f32 {
        self.data().flex
    }

    /// Battery `(percent, voltage)`
    pub fn battery(&self) -> (f32, f32) {
        let data = self.data();
        (data.battery_percent, data.battery_voltage)
    }

    /// Calibration state of the pose stream
    pub fn pose(&self) -> PoseCalibration {
        self.data().pose.clone()
    }

    pub async fn set_rotation(&self, rotation: Quaternion<f32>) -> Result<bool, SessionError> {
        if !self.is_ready() {
            return Ok(false);
        }
        self.data().rotation = rotation;
        self.deliver(Outbound::Rotation {
            tracker_id: self.tracker_id,
            rotation,
        })
        .await
    }

    pub async fn set_acceleration(&self, acceleration: Vector3<f32>) -> Result<bool, SessionError> {
        if !self.is_ready() {
            return Ok(false);
        }
        self.data().acceleration = acceleration;
        self.deliver(Outbound::Acceleration {
            tracker_id: self.tracker_id,
            acceleration,
        })
        .await
    }

    pub async fn set_gyro(&self, gyro: Vector3<f32>) -> Result<bool, SessionError> {
        if !self.is_ready() {
            return Ok(false);
        }
        self.data().gyro = gyro;
        self.deliver(Outbound::Gyro {
            tracker_id: self.tracker_id,
            gyro,
        })
        .await
    }

    pub async fn set_mag_vector(&self, mag: Vector3<f32>) -> Result<bool, SessionError> {
        if !self.is_ready() {
            return Ok(false);
        }
        self.data().mag = mag;
        self.deliver(Outbound::Magnetometer {
            tracker_id: self.tracker_id,
            mag,
        })
        .await
    }

    pub async fn set_flex_value(&self, value: f32) -> Result<bool, SessionError> {
        if !self.is_ready() {
            return Ok(false);
        }
        self.data().flex = value;
        self.deliver(Outbound::FlexData {
            tracker_id: self.tracker_id,
            value,
        })
        .await
    }

    /// `percent` is 0-100
    pub async fn set_battery(&self, percent: f32, voltage: f32) -> Result<bool, SessionError> {
        if !self.is_ready() {
            return Ok(false);
        }
        {
            let mut data = self.data();
            data.battery_percent = percent;
            data.battery_voltage = voltage;
        }
        self.deliver(Outbound::Battery { percent, voltage }).await
    }

    /// Feed a pose sample already in the host's frame
    ///
    /// The first accepted sample becomes the calibration baseline; the
    /// rotation sent is relative to it.
    pub async fn push_pose(&self, position: Vector3<f32>, rotation: Quaternion<f32>) -> Result<bool, SessionError> {
        if !self.is_ready() {
            return Ok(false);
        }
        let calibrated = {
            let mut data = self.data();
            if data.pose.update(position, rotation) {
                debug!(
                    hwid = %self.session.hardware_id(),
                    tracker = self.tracker_id,
                    "Calibration baseline captured"
                );
            }
            data.rotation = data.pose.calibrated_rotation();
            data.rotation
        };
        self.deliver(Outbound::Rotation {
            tracker_id: self.tracker_id,
            rotation: calibrated,
        })
        .await
    }

    /// Clear the baseline so the next pose sample is captured again
    pub fn reset_calibration(&self) {
        self.data().pose.reset();
        info!(hwid = %self.session.hardware_id(), tracker = self.tracker_id, "Calibration reset");
    }

    pub async fn send_user_action(&self, action: UserActionType) -> Result<bool, SessionError> {
        if !self.is_ready() {
            return Ok(false);
        }
        self.deliver(Outbound::UserAction(action)).await
    }

    pub async fn send_haptic(&self, intensity: f32, duration_ms: i32) -> Result<bool, SessionError> {
        if !self.is_ready() {
            return Ok(false);
        }
        self.deliver(Outbound::Haptic {
            intensity,
            duration_ms,
        })
        .await
    }

    async fn deliver(&self, packet: Outbound) -> Result<bool, SessionError> {
        match &self.delivery {
            Delivery::Direct => self.session.send(packet).await,
            Delivery::Queued(queue) => {
                let key = DispatchKey::new(self.session.hardware_id(), self.tracker_id, packet.kind());
                let session = Arc::clone(&self.session);
                queue.enqueue(key, async move {
                    if let Err(e) = session.send(packet).await {
                        error!(hwid = %session.hardware_id(), error = %e, "Queued send failed");
                    }
                });
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::HandshakeGate;
    use crate::mock::{ack_from, test_identity, MockTransport};
    use crate::session::{SensorChannel, SessionConfig, SessionState};
    use nalgebra::UnitQuaternion;
    use slimebridge_core::TrackerDataType;
    use slimebridge_protocol::opcode;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn rotation_w(packet: &[u8]) -> f32 {
        f32::from_be_bytes(packet[26..30].try_into().unwrap())
    }

    fn rotation_packets(transport: &MockTransport) -> Vec<Vec<u8>> {
        transport
            .sent()
            .into_iter()
            .filter(|p| p[0..4] == opcode::ROTATION_DATA.to_be_bytes())
            .collect()
    }

    async fn tracker_with(delivery: Delivery) -> (Tracker, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let gate = Arc::new(HandshakeGate::new(Duration::from_millis(10)));
        let channel = SensorChannel {
            tracker_id: 0,
            position: TrackerPosition::Chest,
            data_type: TrackerDataType::Rotation,
        };
        let config = SessionConfig {
            handshake_interval: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        let session = DeviceSession::new(test_identity(), vec![channel], transport.clone(), gate, config);
        session.start().unwrap();
        (Tracker::new(session, 0, TrackerPosition::Chest, delivery), transport)
    }

    async fn activate(tracker: &Tracker, transport: &MockTransport) {
        transport.push(&ack_from(), SocketAddr::from(([10, 0, 0, 5], 6969)));
        let mut rx = tracker.session().subscribe();
        timeout(Duration::from_secs(2), rx.wait_for(|s| *s == SessionState::Active))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rotation_only_after_handshake() {
        let (tracker, transport) = tracker_with(Delivery::Direct).await;

        let q = *UnitQuaternion::from_euler_angles(0.0, 0.0, 0.5).quaternion();
        assert!(!tracker.set_rotation(q).await.unwrap());
        assert_eq!(tracker.rotation(), Quaternion::identity());
        assert!(rotation_packets(&transport).is_empty());

        activate(&tracker, &transport).await;
        assert!(tracker.is_ready());
        assert!(tracker.set_rotation(q).await.unwrap());
        assert_eq!(tracker.rotation(), q);
        assert_eq!(rotation_packets(&transport).len(), 1);

        tracker.session().dispose().await;
    }

    #[tokio::test]
    async fn test_setters_store_values() {
        let (tracker, transport) = tracker_with(Delivery::Direct).await;
        activate(&tracker, &transport).await;

        tracker.set_acceleration(Vector3::new(0.0, 9.8, 0.0)).await.unwrap();
        tracker.set_gyro(Vector3::new(0.1, 0.0, 0.0)).await.unwrap();
        tracker.set_mag_vector(Vector3::new(0.0, 0.0, 1.0)).await.unwrap();
        tracker.set_flex_value(0.25).await.unwrap();
        tracker.set_battery(55.0, 3.7).await.unwrap();
        tracker.send_user_action(UserActionType::ResetFull).await.unwrap();

        assert_eq!(tracker.acceleration(), Vector3::new(0.0, 9.8, 0.0));
        assert_eq!(tracker.gyro(), Vector3::new(0.1, 0.0, 0.0));
        assert_eq!(tracker.mag_vector(), Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(tracker.flex_value(), 0.25);
        assert_eq!(tracker.battery(), (55.0, 3.7));

        for op in [
            opcode::ACCELERATION,
            opcode::GYRO,
            opcode::MAG,
            opcode::FLEX_DATA_PACKET,
            opcode::BATTERY_LEVEL,
            opcode::BUTTON_PUSHED,
        ] {
            assert_eq!(transport.count_opcode(op), 1, "opcode {}", op);
        }
        tracker.session().dispose().await;
    }

    #[tokio::test]
    async fn test_push_pose_sends_calibrated_rotation() {
        let (tracker, transport) = tracker_with(Delivery::Direct).await;
        activate(&tracker, &transport).await;

        let r0 = *UnitQuaternion::from_euler_angles(0.0, 0.4, 0.0).quaternion();
        tracker.push_pose(Vector3::new(0.0, 1.0, 0.0), r0).await.unwrap();
        let packets = rotation_packets(&transport);
        assert!((rotation_w(&packets[0]) - 1.0).abs() < 1e-6);

        tracker.push_pose(Vector3::new(0.0, 1.0, 0.0), r0).await.unwrap();
        assert!(tracker.pose().baseline().is_some());

        tracker.reset_calibration();
        assert!(tracker.pose().baseline().is_none());
        tracker.session().dispose().await;
    }

    #[tokio::test]
    async fn test_queued_delivery_coalesces() {
        let queue = Arc::new(DispatchQueue::new(1000));
        let (tracker, transport) = tracker_with(Delivery::Queued(queue.clone())).await;
        assert_eq!(tracker.delivery_mode(), DeliveryMode::Queued);
        activate(&tracker, &transport).await;

        for angle in [0.1f32, 0.2, 0.3] {
            let q = *UnitQuaternion::from_euler_angles(0.0, 0.0, angle).quaternion();
            assert!(tracker.set_rotation(q).await.unwrap());
        }
        assert_eq!(queue.len(), 1);
        assert!(rotation_packets(&transport).is_empty());

        assert_eq!(queue.run_cycle().await, 1);
        let packets = rotation_packets(&transport);
        assert_eq!(packets.len(), 1);
        let expected = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3f32);
        assert!((rotation_w(&packets[0]) - expected.w).abs() < 1e-6);

        tracker.session().dispose().await;
    }
}
