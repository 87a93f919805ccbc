//! Synthetic pose source
//!
//! Generates a slow sway for every configured body part and routes it
//! through the pose router, and spins the trackers of statically
//! configured devices. Lets the whole pipeline run without a real feed.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use slimebridge_core::TrackerPosition;
use slimebridge_emulator::{PoseSample, RouterError, SessionError, Tracker};
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Period of the generated sway
const SWAY_PERIOD_SECS: f32 = 4.0;
/// Peak sway angle in radians
const SWAY_AMPLITUDE: f32 = 0.35;
/// Battery report cadence, in generated frames
const BATTERY_EVERY_FRAMES: u64 = 600;

/// Pose of one body part at `t` seconds, in the source's right-handed frame
pub fn synthetic_pose(part_index: usize, t: f32) -> (Vector3<f32>, Quaternion<f32>) {
    let phase = part_index as f32 * 0.5;
    let angle = SWAY_AMPLITUDE * (TAU * t / SWAY_PERIOD_SECS + phase).sin();
    let rotation = UnitQuaternion::from_euler_angles(0.0, angle, angle * 0.5);

    // Parts are stacked vertically, the first one highest
    let height = 1.0 - 0.45 * part_index as f32;
    let position = Vector3::new(0.1 * angle, height.max(0.0), 0.0);
    (position, *rotation.quaternion())
}

/// Orientation applied to statically configured trackers at `t` seconds
pub fn spin(t: f32) -> Quaternion<f32> {
    *UnitQuaternion::from_euler_angles(0.0, 0.0, (TAU * t / SWAY_PERIOD_SECS) % TAU).quaternion()
}

/// Start producing frames until `shutdown` flips to true
pub fn spawn(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let rate_hz = state.config.synthetic.rate_hz.max(1);
    let period = Duration::from_secs(1) / rate_hz;
    info!(
        rate_hz = rate_hz,
        parts = state.config.synthetic.body_parts.len(),
        "Synthetic pose source started"
    );

    tokio::spawn(async move {
        let start = Instant::now();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut frame: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let t = start.elapsed().as_secs_f32();
                    if let Err(e) = produce_frame(&state, t, frame).await {
                        warn!(error = %e, "Synthetic frame failed");
                    }
                    frame += 1;
                }
            }
        }
        debug!(frames = frame, "Synthetic pose source stopped");
    })
}

async fn produce_frame(state: &AppState, t: f32, frame: u64) -> Result<(), RouterError> {
    let synthetic = &state.config.synthetic;
    for (index, part) in synthetic.body_parts.iter().enumerate() {
        let (position, rotation) = synthetic_pose(index, t);
        let sample = PoseSample {
            body_part: part.clone(),
            source_ip: synthetic.source_ip,
            tracker_position: TrackerPosition::None,
            position,
            rotation,
        };
        state.router.route(&sample).await?;
    }

    let rotation = spin(t);
    for configured in &state.config.devices {
        let Ok(hwid) = configured.hardware_id() else {
            continue;
        };
        let Some(device) = state.registry.get(&hwid).await else {
            continue;
        };
        for tracker in device.trackers() {
            tracker.set_rotation(rotation).await?;
            if frame % BATTERY_EVERY_FRAMES == 0 {
                send_battery(tracker, frame).await?;
            }
        }
    }
    Ok(())
}

async fn send_battery(tracker: &Tracker, frame: u64) -> Result<bool, SessionError> {
    // Drains one percent per report, never below 5
    let percent = (100.0 - (frame / BATTERY_EVERY_FRAMES) as f32).max(5.0);
    let voltage = 3.3 + 0.9 * percent / 100.0;
    tracker.set_battery(percent, voltage).await
}
