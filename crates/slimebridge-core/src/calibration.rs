//! Pose calibration and coordinate-frame math
//!
//! Upstream pose sources report right-handed coordinates while the host
//! expects left-handed ones. After conversion every tracker is expressed
//! relative to the first sample it received (its calibration baseline).
//!
//! For sources that only report an accelerometer reading,
//! [`quat_from_gravity`] infers an orientation from the gravity vector.

use nalgebra::{Quaternion, Vector3};

/// Tolerance on the gravity/reference dot product for the degenerate cases
pub const GRAVITY_EPSILON: f32 = 1e-5;

/// Calibrated height under which a tracker counts as back at its baseline floor
pub const NEAR_FLOOR_THRESHOLD: f32 = 0.060;

/// Reference "down" direction used for gravity inference
pub const GRAVITY_REFERENCE: [f32; 3] = [0.0, 0.0, -1.0];

/// Convert a right-handed position into the host's left-handed frame
pub fn rhs_to_lhs_position(position: Vector3<f32>) -> Vector3<f32> {
    Vector3::new(position.x, position.y, -position.z)
}

/// Convert a right-handed rotation into the host's left-handed frame
///
/// `(x, y, z, w)` becomes `(x, y, -z, -w)`.
pub fn rhs_to_lhs_rotation(rotation: Quaternion<f32>) -> Quaternion<f32> {
    Quaternion::new(-rotation.w, rotation.i, rotation.j, -rotation.k)
}

/// `inverse(baseline) * current`, normalized
///
/// Degenerate inputs (zero quaternions) fall back to identity.
pub fn calibrated_rotation(baseline: &Quaternion<f32>, current: &Quaternion<f32>) -> Quaternion<f32> {
    let inverse = baseline.try_inverse().unwrap_or_else(Quaternion::identity);
    normalize_or_identity(inverse * current)
}

fn normalize_or_identity(q: Quaternion<f32>) -> Quaternion<f32> {
    let norm = q.norm();
    if norm > 0.0 && norm.is_finite() {
        q / norm
    } else {
        Quaternion::identity()
    }
}

/// First sample captured for a tracker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationBaseline {
    pub rotation: Quaternion<f32>,
    pub position: Vector3<f32>,
}

/// Latest pose of a tracker together with its calibration baseline
#[derive(Debug, Clone, PartialEq)]
pub struct PoseCalibration {
    rotation: Quaternion<f32>,
    position: Vector3<f32>,
    baseline: Option<CalibrationBaseline>,
}

impl Default for PoseCalibration {
    fn default() -> Self {
        Self::new()
    }
}

impl PoseCalibration {
    pub fn new() -> Self {
        Self {
            rotation: Quaternion::identity(),
            position: Vector3::zeros(),
            baseline: None,
        }
    }

    /// Store a new sample, capturing it as the baseline if none is set
    ///
    /// Returns true when this sample became the baseline.
    pub fn update(&mut self, position: Vector3<f32>, rotation: Quaternion<f32>) -> bool {
        self.position = position;
        self.rotation = rotation;
        if self.baseline.is_none() {
            self.baseline = Some(CalibrationBaseline { rotation, position });
            true
        } else {
            false
        }
    }

    /// Forget the baseline; the next sample is captured in its place
    pub fn reset(&mut self) {
        self.baseline = None;
    }

    pub fn baseline(&self) -> Option<&CalibrationBaseline> {
        self.baseline.as_ref()
    }

    pub fn rotation(&self) -> Quaternion<f32> {
        self.rotation
    }

    pub fn position(&self) -> Vector3<f32> {
        self.position
    }

    pub fn calibrated_rotation(&self) -> Quaternion<f32> {
        let baseline = self
            .baseline
            .map(|b| b.rotation)
            .unwrap_or_else(Quaternion::identity);
        calibrated_rotation(&baseline, &self.rotation)
    }

    pub fn calibrated_position(&self) -> Vector3<f32> {
        match self.baseline {
            Some(baseline) => self.position - baseline.position,
            None => self.position,
        }
    }

    pub fn floor_relative_position(&self, floor_y: f32) -> Vector3<f32> {
        let calibrated = self.calibrated_position();
        Vector3::new(calibrated.x, calibrated.y - floor_y, calibrated.z)
    }

    /// Calibrated Y below [`NEAR_FLOOR_THRESHOLD`]
    pub fn is_near_floor(&self) -> bool {
        self.calibrated_position().y < NEAR_FLOOR_THRESHOLD
    }
}

/// Lowest calibrated Y across a set of trackers
///
/// Computed on every call; returns `None` for an empty set.
pub fn floor_height<'a, I>(trackers: I) -> Option<f32>
where
    I: IntoIterator<Item = &'a PoseCalibration>,
{
    trackers
        .into_iter()
        .map(|t| t.calibrated_position().y)
        .fold(None, |min, y| match min {
            Some(m) if m <= y => Some(m),
            _ => Some(y),
        })
}

/// Raw accelerometer reading to orientation
///
/// Each axis is offset-corrected, scaled, clamped to `[-1, 1]` and the
/// result normalized. The rotation axis is `gravity x reference` and the
/// angle `acos(gravity . reference)`, so the result carries the measured
/// gravity onto [`GRAVITY_REFERENCE`]. Aligned input yields identity,
/// antiparallel input a 180 degree turn about X, and a zero reading identity.
pub fn quat_from_gravity(raw: Vector3<f32>, offset: Vector3<f32>, scale: f32) -> Quaternion<f32> {
    let scaled = (raw - offset) / scale;
    let clamped = scaled.map(|v| v.clamp(-1.0, 1.0));

    let norm = clamped.norm();
    if norm == 0.0 || !norm.is_finite() {
        return Quaternion::identity();
    }
    let gravity = clamped / norm;
    let reference = Vector3::from(GRAVITY_REFERENCE);

    let dot = gravity.dot(&reference).clamp(-1.0, 1.0);
    if (dot - 1.0).abs() < GRAVITY_EPSILON {
        return Quaternion::identity();
    }
    if (dot + 1.0).abs() < GRAVITY_EPSILON {
        return Quaternion::new(0.0, 1.0, 0.0, 0.0);
    }

    let axis = gravity.cross(&reference).normalize();
    let half_angle = dot.acos() * 0.5;
    let sin_half = half_angle.sin();
    Quaternion::new(
        half_angle.cos(),
        axis.x * sin_half,
        axis.y * sin_half,
        axis.z * sin_half,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn assert_quat_close(a: Quaternion<f32>, b: Quaternion<f32>) {
        let diff = (a.coords - b.coords).norm();
        assert!(diff < 1e-5, "{:?} != {:?}", a, b);
    }

    #[test]
    fn test_rhs_to_lhs() {
        let p = rhs_to_lhs_position(Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(p, Vector3::new(1.0, 2.0, -3.0));

        // Quaternion::new takes (w, x, y, z)
        let q = rhs_to_lhs_rotation(Quaternion::new(0.4, 0.1, 0.2, 0.3));
        assert_eq!((q.i, q.j, q.k, q.w), (0.1, 0.2, -0.3, -0.4));
    }

    #[test]
    fn test_first_sample_becomes_baseline() {
        let mut pose = PoseCalibration::new();
        let r0 = *UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3).quaternion();
        assert!(pose.update(Vector3::new(0.0, 1.0, 0.0), r0));
        assert!(!pose.update(Vector3::new(0.0, 1.5, 0.0), r0));

        assert_eq!(pose.baseline().unwrap().rotation, r0);
        assert_quat_close(pose.calibrated_rotation(), Quaternion::identity());
        assert!((pose.calibrated_position().y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_calibrated_rotation_is_inverse_baseline_times_current() {
        let r0 = *UnitQuaternion::from_euler_angles(0.3, -0.2, 1.1).quaternion();
        let r1 = *UnitQuaternion::from_euler_angles(-0.7, 0.4, 0.2).quaternion();

        let mut pose = PoseCalibration::new();
        pose.update(Vector3::zeros(), r0);
        pose.update(Vector3::zeros(), r1);

        let expected = r0.try_inverse().unwrap() * r1;
        assert_quat_close(pose.calibrated_rotation(), expected);
    }

    #[test]
    fn test_reset_recaptures_baseline() {
        let mut pose = PoseCalibration::new();
        let r0 = *UnitQuaternion::from_euler_angles(0.0, 0.0, 0.5).quaternion();
        let r1 = *UnitQuaternion::from_euler_angles(0.0, 0.0, 1.0).quaternion();
        pose.update(Vector3::zeros(), r0);
        pose.reset();
        assert!(pose.baseline().is_none());
        assert!(pose.update(Vector3::zeros(), r1));
        assert_quat_close(pose.calibrated_rotation(), Quaternion::identity());
    }

    #[test]
    fn test_floor_height_and_relative_position() {
        let mut head = PoseCalibration::new();
        head.update(Vector3::new(0.0, 1.7, 0.0), Quaternion::identity());
        head.update(Vector3::new(0.0, 1.6, 0.0), Quaternion::identity());

        let mut foot = PoseCalibration::new();
        foot.update(Vector3::new(0.0, 0.1, 0.0), Quaternion::identity());
        foot.update(Vector3::new(0.0, -0.2, 0.0), Quaternion::identity());

        let floor = floor_height([&head, &foot]).unwrap();
        assert!((floor - -0.3).abs() < 1e-6);
        assert!((head.floor_relative_position(floor).y - 0.2).abs() < 1e-6);

        assert_eq!(floor_height(std::iter::empty()), None);
    }

    #[test]
    fn test_near_floor_uses_calibrated_height() {
        let mut foot = PoseCalibration::new();
        foot.update(Vector3::new(0.0, 0.1, 0.0), Quaternion::identity());
        foot.update(Vector3::new(0.0, 0.15, 0.0), Quaternion::identity());
        assert!(foot.is_near_floor());

        foot.update(Vector3::new(0.0, 0.2, 0.0), Quaternion::identity());
        assert!(!foot.is_near_floor());

        // Only the offset from the tracker's own baseline matters
        let mut head = PoseCalibration::new();
        head.update(Vector3::new(0.0, 1.7, 0.0), Quaternion::identity());
        head.update(Vector3::new(0.0, 1.75, 0.0), Quaternion::identity());
        assert!(head.is_near_floor());
    }

    #[test]
    fn test_gravity_aligned_with_reference_is_identity() {
        let q = quat_from_gravity(Vector3::new(0.0, 0.0, -1.0), Vector3::zeros(), 1.0);
        assert_eq!(q, Quaternion::identity());

        // Out-of-range magnitudes are clamped before normalizing
        let q = quat_from_gravity(Vector3::new(0.0, 0.0, -9.8), Vector3::zeros(), 1.0);
        assert_eq!(q, Quaternion::identity());
    }

    #[test]
    fn test_gravity_opposite_reference_is_half_turn_about_x() {
        let q = quat_from_gravity(Vector3::new(0.0, 0.0, 1.0), Vector3::zeros(), 1.0);
        assert_eq!((q.i, q.j, q.k, q.w), (1.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_gravity_sideways_is_quarter_turn() {
        let q = quat_from_gravity(Vector3::new(1.0, 0.0, 0.0), Vector3::zeros(), 1.0);
        let half = std::f32::consts::FRAC_PI_4;
        assert!((q.w - half.cos()).abs() < 1e-6);
        assert!((q.norm() - 1.0).abs() < 1e-6);

        // The rotation carries the measured gravity onto the reference
        let unit = UnitQuaternion::from_quaternion(q);
        let mapped = unit.transform_vector(&Vector3::new(1.0, 0.0, 0.0));
        assert!((mapped - Vector3::new(0.0, 0.0, -1.0)).norm() < 1e-5);
    }

    #[test]
    fn test_gravity_offset_and_scale() {
        let raw = Vector3::new(100.0, 100.0, 100.0 - 512.0);
        let q = quat_from_gravity(raw, Vector3::new(100.0, 100.0, 100.0), 512.0);
        assert_eq!(q, Quaternion::identity());

        let q = quat_from_gravity(Vector3::new(3.0, 3.0, 3.0), Vector3::new(3.0, 3.0, 3.0), 1.0);
        assert_eq!(q, Quaternion::identity());
    }
}
