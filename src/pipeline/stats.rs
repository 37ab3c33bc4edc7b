use std::time::Instant;

use crate::geo::GEO_ERROR_PLACEHOLDER_M;
use crate::GeoPoint;

/// Weight of the newest sample in the smoothed frame rate.
const FPS_SMOOTHING: f64 = 0.1;

/// Exponentially smoothed tick rate.
#[derive(Debug, Default)]
pub struct RollingStats {
    fps: f64,
    samples: u64,
    last_publish: Option<Instant>,
}

impl RollingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a published tick at `now` and return the smoothed fps.
    ///
    /// The first interval seeds the average directly.
    pub fn record(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last_publish {
            let dt = now.saturating_duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instant = 1.0 / dt;
                self.fps = if self.samples == 0 {
                    instant
                } else {
                    (1.0 - FPS_SMOOTHING) * self.fps + FPS_SMOOTHING * instant
                };
                self.samples += 1;
            }
        }
        self.last_publish = Some(now);
        self.fps
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}

/// Mean of the per-track error estimates, or the placeholder when nothing is tracked.
pub fn mean_geo_error<'a>(points: impl IntoIterator<Item = &'a GeoPoint>) -> f64 {
    let (sum, count) = points
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), p| (sum + p.error_m, count + 1));
    if count == 0 {
        GEO_ERROR_PLACEHOLDER_M
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_interval_seeds_then_smooths() {
        let mut stats = RollingStats::new();
        let t0 = Instant::now();
        assert_eq!(stats.record(t0), 0.0);

        let fps = stats.record(t0 + Duration::from_millis(100));
        assert!((fps - 10.0).abs() < 1e-9);

        let fps = stats.record(t0 + Duration::from_millis(150));
        assert!((fps - (0.9 * 10.0 + 0.1 * 20.0)).abs() < 1e-9);
    }

    #[test]
    fn mean_error_defaults_without_tracks() {
        assert_eq!(mean_geo_error([].iter()), GEO_ERROR_PLACEHOLDER_M);
        let points = [
            GeoPoint { lat: 0.0, lon: 0.0, altitude_m: 0.0, error_m: 1.0 },
            GeoPoint { lat: 0.0, lon: 0.0, altitude_m: 0.0, error_m: 3.0 },
        ];
        assert_eq!(mean_geo_error(points.iter()), 2.0);
    }
}
