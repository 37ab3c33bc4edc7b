//! Ground-point projection from camera pose.
//!
//! Flat-ground pinhole approximation: an image point is turned into a forward and
//! lateral offset on the ground plane, rotated by the camera heading into east/north,
//! and then walked from the camera position with a Vincenty direct solve on WGS84.
//!
//! This is a coarse estimate. `GeoPoint::error_m` is a fixed placeholder, not a
//! derived uncertainty.

use crate::{BBox, CameraPose, GeoPoint};

/// Placeholder horizontal error attached to every estimate, in meters.
pub const GEO_ERROR_PLACEHOLDER_M: f64 = 2.5;

/// Minimum pitch used for projection; shallower angles blow up the forward distance.
pub const MIN_PITCH_DEG: f64 = 1.0;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const VINCENTY_TOLERANCE: f64 = 1e-12;
const VINCENTY_MAX_ITERATIONS: usize = 200;

/// Stateless projector; all inputs arrive per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct GeoEstimator;

impl GeoEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Project a normalized image point (`0..=1` on both axes, origin top-left) to the ground.
    pub fn estimate(&self, point: (f64, f64), pose: &CameraPose) -> GeoPoint {
        let (east, north) = ground_offset(point, pose);
        let distance = east.hypot(north);
        let azimuth = normalize_degrees(east.atan2(north).to_degrees());
        let (lat, lon) = destination(pose.lat, pose.lon, azimuth, distance);
        GeoPoint {
            lat,
            lon,
            altitude_m: 0.0,
            error_m: GEO_ERROR_PLACEHOLDER_M,
        }
    }

    /// Project the center of a pixel-space box in a `width` x `height` frame.
    pub fn estimate_bbox(
        &self,
        bbox: &BBox,
        width: u32,
        height: u32,
        pose: &CameraPose,
    ) -> GeoPoint {
        let (cx, cy) = bbox.center();
        let w = f64::from(width.max(1));
        let h = f64::from(height.max(1));
        self.estimate((f64::from(cx) / w, f64::from(cy) / h), pose)
    }
}

/// East/north offset in meters of the ground point seen at `point`.
pub fn ground_offset(point: (f64, f64), pose: &CameraPose) -> (f64, f64) {
    let cx = point.0.clamp(0.0, 1.0);
    let cy = point.1.clamp(0.0, 1.0);
    let pitch = pose.pitch_deg.clamp(MIN_PITCH_DEG, 90.0).to_radians();

    let forward = pose.altitude_m.max(0.0) / pitch.tan();
    let lateral_span = 2.0 * forward * (pose.fov_deg.to_radians() / 2.0).tan();
    let dx = (cx - 0.5) * lateral_span;
    let dy = forward * (1.0 - cy);

    let yaw = pose.yaw_deg.to_radians();
    let (sin_yaw, cos_yaw) = yaw.sin_cos();
    let east = dx * cos_yaw + dy * sin_yaw;
    let north = -dx * sin_yaw + dy * cos_yaw;
    (east, north)
}

/// Vincenty direct solution on the WGS84 ellipsoid.
///
/// Returns the `(lat, lon)` in degrees reached from `(lat, lon)` after travelling
/// `distance_m` along the initial bearing `azimuth_deg` (clockwise from north).
pub fn destination(lat: f64, lon: f64, azimuth_deg: f64, distance_m: f64) -> (f64, f64) {
    if distance_m == 0.0 {
        return (lat, lon);
    }
    let a = WGS84_A;
    let f = WGS84_F;
    let b = (1.0 - f) * a;

    let phi1 = lat.to_radians();
    let alpha1 = azimuth_deg.to_radians();
    let (sin_alpha1, cos_alpha1) = alpha1.sin_cos();

    let tan_u1 = (1.0 - f) * phi1.tan();
    let cos_u1 = 1.0 / (1.0 + tan_u1 * tan_u1).sqrt();
    let sin_u1 = tan_u1 * cos_u1;

    let sigma1 = tan_u1.atan2(cos_alpha1);
    let sin_alpha = cos_u1 * sin_alpha1;
    let cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
    let u_sq = cos_sq_alpha * (a * a - b * b) / (b * b);
    let big_a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
    let big_b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));

    let sigma0 = distance_m / (b * big_a);
    let mut sigma = sigma0;
    for _ in 0..VINCENTY_MAX_ITERATIONS {
        let (cos_2sigma_m, sin_sigma, cos_sigma) = sigma_terms(sigma1, sigma);
        let delta_sigma = delta_sigma(big_b, cos_2sigma_m, sin_sigma, cos_sigma);
        let next = sigma0 + delta_sigma;
        let converged = (next - sigma).abs() <= VINCENTY_TOLERANCE;
        sigma = next;
        if converged {
            break;
        }
    }

    let (cos_2sigma_m, sin_sigma, cos_sigma) = sigma_terms(sigma1, sigma);
    let tmp = sin_u1 * sin_sigma - cos_u1 * cos_sigma * cos_alpha1;
    let phi2 = (sin_u1 * cos_sigma + cos_u1 * sin_sigma * cos_alpha1)
        .atan2((1.0 - f) * (sin_alpha * sin_alpha + tmp * tmp).sqrt());
    let lambda = (sin_sigma * sin_alpha1)
        .atan2(cos_u1 * cos_sigma - sin_u1 * sin_sigma * cos_alpha1);
    let c = f / 16.0 * cos_sq_alpha * (4.0 + f * (4.0 - 3.0 * cos_sq_alpha));
    let l = lambda
        - (1.0 - c)
            * f
            * sin_alpha
            * (sigma
                + c * sin_sigma
                    * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)));

    (phi2.to_degrees(), normalize_longitude(lon + l.to_degrees()))
}

fn sigma_terms(sigma1: f64, sigma: f64) -> (f64, f64, f64) {
    let cos_2sigma_m = (2.0 * sigma1 + sigma).cos();
    let (sin_sigma, cos_sigma) = sigma.sin_cos();
    (cos_2sigma_m, sin_sigma, cos_sigma)
}

fn delta_sigma(big_b: f64, cos_2sigma_m: f64, sin_sigma: f64, cos_sigma: f64) -> f64 {
    let c2 = cos_2sigma_m * cos_2sigma_m;
    big_b
        * sin_sigma
        * (cos_2sigma_m
            + big_b / 4.0
                * (cos_sigma * (-1.0 + 2.0 * c2)
                    - big_b / 6.0
                        * cos_2sigma_m
                        * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                        * (-3.0 + 4.0 * c2)))
}

fn normalize_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

fn normalize_longitude(deg: f64) -> f64 {
    (deg + 180.0).rem_euclid(360.0) - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose() -> CameraPose {
        CameraPose {
            lat: 6.1164,
            lon: 125.1716,
            altitude_m: 35.0,
            pitch_deg: 60.0,
            yaw_deg: 0.0,
            fov_deg: 78.0,
        }
    }

    /// Meridional radius of curvature, for short due-north displacements.
    fn meridian_radius(lat_deg: f64) -> f64 {
        let e2 = WGS84_F * (2.0 - WGS84_F);
        let s = lat_deg.to_radians().sin();
        WGS84_A * (1.0 - e2) / (1.0 - e2 * s * s).powf(1.5)
    }

    #[test]
    fn center_point_projects_due_north_at_half_forward_distance() {
        let pose = pose();
        let forward = 35.0 / 60f64.to_radians().tan();
        assert!((forward - 20.207).abs() < 1e-3);

        let (east, north) = ground_offset((0.5, 0.5), &pose);
        assert!(east.abs() < 1e-12);
        assert!((north - forward / 2.0).abs() < 1e-9);

        let point = GeoEstimator::new().estimate((0.5, 0.5), &pose);
        let (lat, lon) = destination(pose.lat, pose.lon, 0.0, forward / 2.0);
        assert!((point.lat - lat).abs() < 1e-12);
        assert!((point.lon - lon).abs() < 1e-12);

        // Independent check against the meridian arc.
        let expected_dlat = (forward / 2.0 / meridian_radius(pose.lat)).to_degrees();
        assert!((point.lat - pose.lat - expected_dlat).abs() < 1e-9);
        assert!((point.lon - pose.lon).abs() < 1e-12);
        assert_eq!(point.error_m, GEO_ERROR_PLACEHOLDER_M);
        assert_eq!(point.altitude_m, 0.0);
    }

    #[test]
    fn yaw_rotates_the_offset() {
        let pose = CameraPose {
            yaw_deg: 90.0,
            ..pose()
        };
        let (east, north) = ground_offset((0.5, 0.5), &pose);
        assert!(east > 10.0);
        assert!(north.abs() < 1e-9);

        let point = GeoEstimator::new().estimate((0.5, 0.5), &pose);
        assert!(point.lon > pose.lon);
        assert!((point.lat - pose.lat).abs() < 1e-7);
    }

    #[test]
    fn right_of_center_is_east_when_facing_north() {
        let (east, _) = ground_offset((1.0, 0.5), &pose());
        assert!(east > 0.0);
        let (east, _) = ground_offset((0.0, 0.5), &pose());
        assert!(east < 0.0);
    }

    #[test]
    fn bottom_of_frame_is_directly_below() {
        let (east, north) = ground_offset((0.5, 1.0), &pose());
        assert!(east.abs() < 1e-12);
        assert!(north.abs() < 1e-12);
        let point = GeoEstimator::new().estimate((0.5, 1.0), &pose());
        assert_eq!((point.lat, point.lon), (pose().lat, pose().lon));
    }

    #[test]
    fn shallow_pitch_is_clamped() {
        let flat = CameraPose {
            pitch_deg: 0.0,
            ..pose()
        };
        let (_, north) = ground_offset((0.5, 0.0), &flat);
        let expected = 35.0 / MIN_PITCH_DEG.to_radians().tan();
        assert!(north.is_finite());
        assert!((north - expected).abs() < 1e-6);
    }

    #[test]
    fn longitude_wraps_across_antimeridian() {
        let (_, lon) = destination(0.0, 179.9999, 90.0, 1_000.0);
        assert!(lon < -179.0);
        let (lat, lon) = destination(10.0, 20.0, 45.0, 0.0);
        assert_eq!((lat, lon), (10.0, 20.0));
    }

    #[test]
    fn long_lines_match_known_geodesic() {
        // One degree of longitude along the equator is a*pi/180 on the ellipsoid.
        let distance = WGS84_A * 1f64.to_radians();
        let (lat, lon) = destination(0.0, 0.0, 90.0, distance);
        assert!(lat.abs() < 1e-9);
        assert!((lon - 1.0).abs() < 1e-9);
    }
}
