//! Temporal alignment of tracking positions to ultrasound frames.
//!
//! Frames and positions are sampled by independent clocks. The aligner maps
//! the position timestamps onto the frame clock, either with an explicit
//! calibration or with an estimate, and then interpolates one pose per frame.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::enums::AlignmentMethod;
use crate::error::{Diagnostic, ReconstructError};
use crate::geometry::{Transform3D, slerp_interpolate};
use crate::input::TimedPosition;

/// Largest allowed gap between the two positions bracketing a frame (ms).
pub const DEFAULT_MAX_TIME_DIFF: f64 = 100.0;

/// Position timestamps are rewritten to `scale * (t - offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeCalibration {
    pub offset: f64,
    pub scale: f64,
}

impl Default for TimeCalibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            scale: 1.0,
        }
    }
}

impl TimeCalibration {
    pub fn new(offset: f64, scale: f64) -> Self {
        Self { offset, scale }
    }

    #[inline]
    pub fn apply(&self, t: f64) -> f64 {
        self.scale * (t - self.offset)
    }

    pub fn validate(&self) -> Result<(), ReconstructError> {
        if !self.offset.is_finite() {
            return Err(ReconstructError::invalid_option(
                "time_calibration.offset",
                "must be finite",
            ));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(ReconstructError::invalid_option(
                "time_calibration.scale",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Search window for [`MotionCorrelation`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSettings {
    /// Largest offset tried in either direction (ms).
    pub max_lag: f64,
    /// Offset increment (ms).
    pub step: f64,
    /// Peak correlation required to accept the estimate.
    pub min_confidence: f64,
    /// Fewest overlapping samples a lag must have to be scored.
    pub min_samples: usize,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            max_lag: 500.0,
            step: 5.0,
            min_confidence: 0.5,
            min_samples: 8,
        }
    }
}

impl CorrelationSettings {
    pub fn validate(&self) -> Result<(), ReconstructError> {
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(ReconstructError::invalid_option("correlation.step", "must be positive"));
        }
        if !(self.max_lag.is_finite() && self.max_lag >= 0.0) {
            return Err(ReconstructError::invalid_option(
                "correlation.max_lag",
                "must be zero or positive",
            ));
        }
        if self.min_samples < 3 {
            return Err(ReconstructError::invalid_option(
                "correlation.min_samples",
                "must be at least 3",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeEstimate {
    pub calibration: TimeCalibration,
    /// In [0, 1]; 1 for exact fits.
    pub confidence: f64,
}

/// What an estimator can look at.
pub struct AlignmentSignals<'a> {
    pub frame_timestamps: &'a [f64],
    /// One value per consecutive frame pair, see
    /// [`frame_motion_signal`](crate::input::frame_motion_signal).
    pub frame_motion: Option<&'a [f64]>,
    pub positions: &'a [TimedPosition],
}

pub trait TimeOffsetEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when no trustworthy estimate exists.
    fn estimate(&self, signals: &AlignmentSignals<'_>) -> Option<TimeEstimate>;
}

/// Stretches the position time span onto the frame time span.
pub struct SpanFit;

impl TimeOffsetEstimator for SpanFit {
    fn name(&self) -> &'static str {
        "span fit"
    }

    fn estimate(&self, signals: &AlignmentSignals<'_>) -> Option<TimeEstimate> {
        let (f0, f1) = (signals.frame_timestamps.first()?, signals.frame_timestamps.last()?);
        let (p0, p1) = (signals.positions.first()?, signals.positions.last()?);
        let frame_span = f1 - f0;
        let position_span = p1.timestamp - p0.timestamp;
        if frame_span <= 0.0 || position_span <= 0.0 {
            return None;
        }
        let scale = frame_span / position_span;
        Some(TimeEstimate {
            calibration: TimeCalibration::new(p0.timestamp - f0 / scale, scale),
            confidence: 1.0,
        })
    }
}

/// Finds the offset at which frame-to-frame image change best correlates
/// with the tracked probe speed.
pub struct MotionCorrelation {
    pub settings: CorrelationSettings,
}

impl MotionCorrelation {
    /// Probe speed (mm/ms) at the midpoint of every position pair.
    fn speed_series(positions: &[TimedPosition]) -> Vec<(f64, f64)> {
        positions
            .windows(2)
            .map(|w| {
                let dt = w[1].timestamp - w[0].timestamp;
                let distance = (w[1].pose.translation() - w[0].pose.translation()).norm();
                ((w[0].timestamp + w[1].timestamp) / 2.0, distance / dt)
            })
            .collect()
    }

    fn sample(series: &[(f64, f64)], t: f64) -> Option<f64> {
        let (first, last) = (series.first()?, series.last()?);
        if t < first.0 || t > last.0 {
            return None;
        }
        let k = series.partition_point(|&(ts, _)| ts < t);
        if k == 0 {
            return Some(first.1);
        }
        let (t0, v0) = series[k - 1];
        let (t1, v1) = series[k];
        Some(v0 + (v1 - v0) * (t - t0) / (t1 - t0))
    }

    fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
        let n = pairs.len() as f64;
        let (mean_a, mean_b) = pairs
            .iter()
            .fold((0.0, 0.0), |(sa, sb), &(a, b)| (sa + a / n, sb + b / n));
        let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
        for &(a, b) in pairs {
            cov += (a - mean_a) * (b - mean_b);
            var_a += (a - mean_a).powi(2);
            var_b += (b - mean_b).powi(2);
        }
        let denominator = (var_a * var_b).sqrt();
        if denominator <= f64::EPSILON {
            return None;
        }
        Some(cov / denominator)
    }
}

impl TimeOffsetEstimator for MotionCorrelation {
    fn name(&self) -> &'static str {
        "motion correlation"
    }

    fn estimate(&self, signals: &AlignmentSignals<'_>) -> Option<TimeEstimate> {
        let motion = signals.frame_motion?;
        let frame_times = signals.frame_timestamps;
        if motion.len() + 1 != frame_times.len() || signals.positions.len() < 2 {
            return None;
        }
        let speed = Self::speed_series(signals.positions);
        let frame_samples: Vec<(f64, f64)> = frame_times
            .windows(2)
            .zip(motion)
            .map(|(w, &m)| ((w[0] + w[1]) / 2.0, m))
            .collect();

        let steps = (self.settings.max_lag / self.settings.step).floor() as i64;
        let scores: Vec<(f64, Option<f64>)> = (-steps..=steps)
            .into_par_iter()
            .map(|k| {
                let lag = k as f64 * self.settings.step;
                let pairs: Vec<(f64, f64)> = frame_samples
                    .iter()
                    .filter_map(|&(t, m)| Self::sample(&speed, t + lag).map(|s| (m, s)))
                    .collect();
                if pairs.len() < self.settings.min_samples {
                    return (lag, None);
                }
                (lag, Self::pearson(&pairs))
            })
            .collect();

        let mut best: Option<(f64, f64)> = None;
        for (lag, score) in scores {
            if let Some(r) = score
                && best.is_none_or(|(_, best_r)| r > best_r)
            {
                best = Some((lag, r));
            }
        }
        let (lag, r) = best?;
        log::debug!("motion correlation peak {r:.3} at {lag} ms");
        if r < self.settings.min_confidence {
            return None;
        }
        Some(TimeEstimate {
            calibration: TimeCalibration::new(lag, 1.0),
            confidence: r,
        })
    }
}

/// Returns a new position sequence on the calibrated clock.
pub fn apply_time_calibration(
    positions: &[TimedPosition],
    calibration: &TimeCalibration,
) -> Vec<TimedPosition> {
    positions
        .iter()
        .map(|p| TimedPosition {
            timestamp: calibration.apply(p.timestamp),
            pose: p.pose,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterpolatedPositions {
    /// `pr_m_s` for every frame in `valid_frames`, same order.
    pub poses: Vec<Transform3D>,
    pub valid_frames: Vec<usize>,
    pub excluded_frames: Vec<usize>,
}

/// One pose per frame from the two positions bracketing its timestamp.
/// Frames outside the tracked time span, or whose bracketing positions are
/// more than `max_time_diff` apart, are excluded.
pub fn interpolate_positions(
    frame_timestamps: &[f64],
    positions: &[TimedPosition],
    max_time_diff: f64,
) -> InterpolatedPositions {
    let mut result = InterpolatedPositions {
        poses: Vec::with_capacity(frame_timestamps.len()),
        valid_frames: Vec::with_capacity(frame_timestamps.len()),
        excluded_frames: Vec::new(),
    };

    for (i, &t) in frame_timestamps.iter().enumerate() {
        let k = positions.partition_point(|p| p.timestamp < t);
        let pose = if k < positions.len() && positions[k].timestamp == t {
            Some(positions[k].pose)
        } else if k == 0 || k == positions.len() {
            None
        } else {
            let (a, b) = (&positions[k - 1], &positions[k]);
            let gap = b.timestamp - a.timestamp;
            (gap <= max_time_diff)
                .then(|| slerp_interpolate(&a.pose, &b.pose, (t - a.timestamp) / gap))
        };

        match pose {
            Some(pose) => {
                result.poses.push(pose);
                result.valid_frames.push(i);
            }
            None => result.excluded_frames.push(i),
        }
    }
    result
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentResult {
    pub time_offset: f64,
    pub time_scale: f64,
    /// `pr_m_s` for every frame in `valid_frames`.
    pub frame_poses: Vec<Transform3D>,
    /// Indices into the frame sequence handed to the aligner.
    pub valid_frames: Vec<usize>,
    pub excluded_frames: Vec<usize>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone)]
pub struct TemporalAligner {
    pub max_time_diff: f64,
    pub method: AlignmentMethod,
    pub correlation: CorrelationSettings,
}

impl Default for TemporalAligner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TIME_DIFF)
    }
}

impl TemporalAligner {
    pub fn new(max_time_diff: f64) -> Self {
        Self {
            max_time_diff,
            method: AlignmentMethod::default(),
            correlation: CorrelationSettings::default(),
        }
    }

    pub fn with_method(mut self, method: AlignmentMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationSettings) -> Self {
        self.correlation = correlation;
        self
    }

    fn estimator(&self) -> Option<Box<dyn TimeOffsetEstimator>> {
        match self.method {
            AlignmentMethod::Disabled => None,
            AlignmentMethod::SpanFit => Some(Box::new(SpanFit)),
            AlignmentMethod::MotionCorrelation => Some(Box::new(MotionCorrelation {
                settings: self.correlation,
            })),
        }
    }

    /// Estimates a calibration. Never fails: without a usable estimate the
    /// identity calibration is returned together with a warning.
    pub fn align_time_series(&self, signals: &AlignmentSignals<'_>) -> (TimeCalibration, Vec<Diagnostic>) {
        let Some(estimator) = self.estimator() else {
            return (TimeCalibration::default(), Vec::new());
        };
        match estimator.estimate(signals) {
            Some(estimate) => {
                let c = estimate.calibration;
                let message = format!(
                    "Estimated time calibration with {}: offset {:.1} ms, scale {:.5} (confidence {:.2})",
                    estimator.name(),
                    c.offset,
                    c.scale,
                    estimate.confidence
                );
                (c, vec![Diagnostic::info(message)])
            }
            None => (
                TimeCalibration::default(),
                vec![Diagnostic::warning(format!(
                    "Time alignment by {} failed, using zero offset",
                    estimator.name()
                ))],
            ),
        }
    }

    /// Calibrate the position clock, then interpolate one pose per frame.
    pub fn align(
        &self,
        frame_timestamps: &[f64],
        frame_motion: Option<&[f64]>,
        positions: &[TimedPosition],
        calibration: Option<TimeCalibration>,
    ) -> Result<AlignmentResult, ReconstructError> {
        if frame_timestamps.is_empty() {
            return Err(ReconstructError::NoFrames);
        }
        if positions.is_empty() {
            return Err(ReconstructError::NoPositions);
        }
        if !(self.max_time_diff.is_finite() && self.max_time_diff > 0.0) {
            return Err(ReconstructError::invalid_option("max_time_diff", "must be positive"));
        }

        let mut diagnostics = Vec::new();
        let calibration = match calibration {
            Some(c) => {
                c.validate()?;
                if c != TimeCalibration::default() {
                    diagnostics.push(Diagnostic::info(format!(
                        "Applying time calibration to tracking data: offset {} ms, scale {}",
                        c.offset, c.scale
                    )));
                }
                c
            }
            None => {
                let signals = AlignmentSignals {
                    frame_timestamps,
                    frame_motion,
                    positions,
                };
                let (c, messages) = self.align_time_series(&signals);
                diagnostics.extend(messages);
                c
            }
        };

        let calibrated = apply_time_calibration(positions, &calibration);
        let interpolated = interpolate_positions(frame_timestamps, &calibrated, self.max_time_diff);

        if !interpolated.excluded_frames.is_empty() {
            diagnostics.push(Diagnostic::warning(format!(
                "Removed {} of {} frames because of missing positions",
                interpolated.excluded_frames.len(),
                frame_timestamps.len()
            )));
        }
        if interpolated.valid_frames.is_empty() {
            return Err(ReconstructError::NoUsablePositions);
        }

        Ok(AlignmentResult {
            time_offset: calibration.offset,
            time_scale: calibration.scale,
            frame_poses: interpolated.poses,
            valid_frames: interpolated.valid_frames,
            excluded_frames: interpolated.excluded_frames,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;
    use crate::geometry::Vector3D;
    use crate::input::frame_motion_signal;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, UnitQuaternion};
    use ndarray::Array3;
    use std::f64::consts::FRAC_PI_2;

    fn position(timestamp: f64, pose: Transform3D) -> TimedPosition {
        TimedPosition { timestamp, pose }
    }

    fn rot_z(angle: f64) -> Transform3D {
        Transform3D::from_rotation(&UnitQuaternion::from_axis_angle(&Vector3D::z_axis(), angle))
    }

    #[test]
    fn test_translation_is_linear_and_rotation_kept() {
        let q = UnitQuaternion::from_euler_angles(0.2, 0.4, -0.3);
        let positions = vec![
            position(0.0, Transform3D::from_rotation_translation(&q, &Vector3D::zeros())),
            position(
                100.0,
                Transform3D::from_rotation_translation(&q, &Vector3D::new(10.0, 20.0, -30.0)),
            ),
        ];
        let result = interpolate_positions(&[25.0, 100.0], &positions, 100.0);

        assert_eq!(result.valid_frames, vec![0, 1]);
        assert_relative_eq!(
            result.poses[0].translation(),
            Vector3D::new(2.5, 5.0, -7.5),
            epsilon = 1e-12
        );
        assert_relative_eq!(result.poses[0].linear(), positions[0].pose.linear(), epsilon = 1e-12);
        assert_eq!(result.poses[1], positions[1].pose);
    }

    #[test]
    fn test_slerp_scenario_with_quarter_turn() {
        let positions = vec![
            position(0.0, Transform3D::identity()),
            position(50.0, Transform3D::identity()),
            position(100.0, Transform3D::identity()),
            position(150.0, Transform3D::identity()),
            position(200.0, rot_z(FRAC_PI_2)),
        ];
        let result = interpolate_positions(&[0.0, 100.0, 175.0, 200.0], &positions, 100.0);
        assert_eq!(result.valid_frames, vec![0, 1, 2, 3]);

        assert_relative_eq!(result.poses[1].linear(), Matrix3::identity(), epsilon = 1e-12);

        // halfway between identity at 150 and the quarter turn at 200
        let halfway = result.poses[2].linear();
        assert_relative_eq!(halfway, rot_z(FRAC_PI_2 / 2.0).linear(), epsilon = 1e-12);
        assert_relative_eq!(halfway * halfway.transpose(), Matrix3::identity(), epsilon = 1e-12);

        assert_relative_eq!(result.poses[3].linear(), rot_z(FRAC_PI_2).linear(), epsilon = 1e-12);
    }

    #[test]
    fn test_frames_outside_range_or_gap_are_excluded() {
        let positions = vec![
            position(0.0, Transform3D::identity()),
            position(20.0, Transform3D::identity()),
            position(200.0, Transform3D::identity()),
        ];
        let frames = [-10.0, 10.0, 50.0, 200.0, 210.0];
        let result = interpolate_positions(&frames, &positions, 100.0);

        assert_eq!(result.valid_frames, vec![1, 3]);
        assert_eq!(result.excluded_frames, vec![0, 2, 4]);
        assert_eq!(result.poses.len(), 2);
    }

    #[test]
    fn test_calibration_commutes_with_frame_shift() {
        let positions: Vec<TimedPosition> = (0..20)
            .map(|i| {
                let t = i as f64 * 40.0;
                position(
                    t,
                    Transform3D::from_rotation_translation(
                        &UnitQuaternion::from_euler_angles(0.01 * t, 0.0, -0.005 * t),
                        &Vector3D::new(t * 0.1, (t * 0.01).sin(), 2.0),
                    ),
                )
            })
            .collect();
        let frames: Vec<f64> = (0..30).map(|i| 5.0 + i as f64 * 23.0).collect();

        for calibration in [TimeCalibration::new(15.0, 1.0), TimeCalibration::new(-30.0, 1.25)] {
            let calibrated = apply_time_calibration(&positions, &calibration);
            let direct = interpolate_positions(&frames, &calibrated, 100.0);

            let shifted: Vec<f64> = frames
                .iter()
                .map(|t| t / calibration.scale + calibration.offset)
                .collect();
            let reference = interpolate_positions(&shifted, &positions, 100.0 / calibration.scale);

            assert_eq!(direct.valid_frames, reference.valid_frames);
            for (a, b) in direct.poses.iter().zip(&reference.poses) {
                assert_relative_eq!(*a.matrix(), *b.matrix(), epsilon = 1e-9);
            }
        }
        // the input is left untouched
        assert_eq!(positions[1].timestamp, 40.0);
    }

    #[test]
    fn test_align_failures() {
        let aligner = TemporalAligner::new(100.0).with_method(AlignmentMethod::Disabled);
        assert!(matches!(
            aligner.align(&[0.0, 10.0], None, &[], None),
            Err(ReconstructError::NoPositions)
        ));
        assert!(matches!(
            aligner.align(&[], None, &[position(0.0, Transform3D::identity())], None),
            Err(ReconstructError::NoFrames)
        ));

        let positions = vec![
            position(1000.0, Transform3D::identity()),
            position(1010.0, Transform3D::identity()),
        ];
        assert!(matches!(
            aligner.align(&[0.0, 10.0], None, &positions, None),
            Err(ReconstructError::NoUsablePositions)
        ));
        assert!(matches!(
            aligner.align(&[0.0], None, &positions, Some(TimeCalibration::new(0.0, 0.0))),
            Err(ReconstructError::InvalidOption { .. })
        ));
    }

    #[test]
    fn test_exclusions_reported_once() {
        let aligner = TemporalAligner::new(100.0).with_method(AlignmentMethod::Disabled);
        let positions = vec![
            position(0.0, Transform3D::identity()),
            position(50.0, Transform3D::identity()),
        ];
        let frames = [0.0, 25.0, 60.0, 70.0, 80.0];
        let result = aligner.align(&frames, None, &positions, None).unwrap();

        assert_eq!(result.valid_frames, vec![0, 1]);
        let warnings: Vec<_> = result
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("Removed 3 of 5 frames"));
    }

    #[test]
    fn test_span_fit_maps_end_points() {
        let positions = vec![
            position(1000.0, Transform3D::identity()),
            position(1500.0, Transform3D::identity()),
            position(2000.0, Transform3D::identity()),
        ];
        let frame_times = [0.0, 400.0, 800.0];
        let signals = AlignmentSignals {
            frame_timestamps: &frame_times,
            frame_motion: None,
            positions: &positions,
        };
        let estimate = SpanFit.estimate(&signals).unwrap();
        let c = estimate.calibration;
        assert_relative_eq!(c.apply(1000.0), 0.0, epsilon = 1e-9);
        assert_relative_eq!(c.apply(2000.0), 800.0, epsilon = 1e-9);
    }

    #[test]
    fn test_failed_estimate_falls_back_to_zero_offset() {
        let positions: Vec<TimedPosition> = (0..50)
            .map(|i| {
                let t = i as f64 * 10.0;
                position(t, Transform3D::from_translation(&Vector3D::new(t * t * 1e-3, 0.0, 0.0)))
            })
            .collect();
        let frame_times: Vec<f64> = (0..20).map(|i| i as f64 * 20.0).collect();
        // static image content: no motion to correlate with
        let motion = vec![0.0; frame_times.len() - 1];

        let aligner = TemporalAligner::new(100.0);
        let result = aligner.align(&frame_times, Some(&motion), &positions, None).unwrap();

        assert_eq!(result.time_offset, 0.0);
        assert_eq!(result.time_scale, 1.0);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.severity == Severity::Warning && d.message.contains("failed"))
        );
        assert_eq!(result.valid_frames.len(), frame_times.len());
    }

    /// Probe travel in mm at integer milliseconds from -1000 to 6000, with a
    /// velocity that varies irregularly every 100 ms.
    fn travel_profile() -> Vec<f64> {
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = || {
            seed = seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (seed >> 33) as f64 / (1u64 << 31) as f64
        };
        let knots: Vec<f64> = (0..=71).map(|_| 0.1 * next()).collect();
        let mut x = 0.0;
        (0..=7000)
            .map(|ms| {
                let k = ms / 100;
                let frac = (ms % 100) as f64 / 100.0;
                let v = knots[k] + (knots[(k + 1).min(71)] - knots[k]) * frac;
                x += v;
                x
            })
            .collect()
    }

    #[test]
    fn test_motion_correlation_recovers_offset() {
        let travel = travel_profile();
        let x_at = |t: i64| travel[(t + 1000) as usize];
        let true_offset = 120;

        let positions: Vec<TimedPosition> = (-60..=460)
            .map(|i| {
                let t = i * 10;
                position(t as f64, Transform3D::from_translation(&Vector3D::new(x_at(t), 0.0, 0.0)))
            })
            .collect();

        // each frame shows a triangle-wave pattern shifted by the probe travel
        let frame_times: Vec<i64> = (0..=200).map(|i| i * 20).collect();
        let mut stack = Array3::<u8>::zeros((frame_times.len(), 8, 64));
        for (i, &t) in frame_times.iter().enumerate() {
            let shift = (5.0 * x_at(t + true_offset)).round() as i64;
            for col in 0..64 {
                let u = (col + shift).rem_euclid(400);
                let value = 20 + (u - 200).abs();
                for row in 0..8 {
                    stack[[i, row, col as usize]] = value as u8;
                }
            }
        }
        let motion = frame_motion_signal(&stack);
        let frame_times: Vec<f64> = frame_times.iter().map(|&t| t as f64).collect();

        let estimator = MotionCorrelation {
            settings: CorrelationSettings::default(),
        };
        let signals = AlignmentSignals {
            frame_timestamps: &frame_times,
            frame_motion: Some(&motion),
            positions: &positions,
        };
        let estimate = estimator.estimate(&signals).unwrap();

        assert!((estimate.calibration.offset - true_offset as f64).abs() <= 20.0);
        assert_eq!(estimate.calibration.scale, 1.0);
        assert!(estimate.confidence > 0.5);
    }
}
