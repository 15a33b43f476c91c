// src/analysis/speed_fusion.rs
//
// Per-object speed estimate from frame-to-frame box geometry.
//
// Signal flow (per call, per tracking id):
//   centroid displacement ─→ lateral km/h ─┐
//                                           ├→ 0.65 / 0.35 fusion → direction
//   box area % change ────→ depth km/h ────┘        → absolute target speed
//                                                    → median(5) → EMA
//
// The calculator never owns identities. It keys its state on the ids the
// tracker hands it and drops state when the tracker stops reporting an id.

use super::adaptive::tunables::{AREA_SCALE_FACTOR, EMA_ALPHA, SPEED_SCALE_FACTOR};
use super::adaptive::CalibrationSource;
use super::object_tracker::TrackId;
use crate::smoother::SpeedSmoother;
use crate::types::{BoundingBox, Detection};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Intervals shorter than this reuse the previous estimate
const MIN_INTERVAL_MS: f64 = 50.0;
const FIRST_OBSERVATION_CONFIDENCE: f32 = 0.25;
const SHORT_INTERVAL_CONFIDENCE: f32 = 0.5;

/// Pixel rates are expressed relative to a 1280x720 frame diagonal
const REFERENCE_DIAGONAL_PX: f32 = 1468.6;

/// Stationary dead-zone: 6px base, scaled by REFERENCE_FRACTION / area fraction
const DEAD_ZONE_BASE_PX: f32 = 6.0;
const DEAD_ZONE_REFERENCE_FRACTION: f32 = 0.05;
const DEAD_ZONE_MIN_SCALE: f32 = 0.5;
const DEAD_ZONE_MAX_SCALE: f32 = 3.0;
const STATIONARY_DECAY: f32 = 0.9;

/// Below this ground speed the observer counts as stationary
const OBSERVER_STATIONARY_KMH: f32 = 3.0;

/// Depth signal threshold (% area change), relaxed for small boxes
const DEPTH_THRESHOLD_LARGE_PCT: f32 = 2.0;
const DEPTH_THRESHOLD_SMALL_PCT: f32 = 0.8;
const LARGE_BOX_FRACTION: f32 = 0.10;

const LATERAL_WEIGHT: f32 = 0.65;
const DEPTH_WEIGHT: f32 = 0.35;

const SIDEWAYS_MIN_DISPLACEMENT_PX: f32 = 15.0;
const DIRECTION_AREA_CHANGE_PCT: f32 = 3.0;
const SIDEWAYS_RELATIVE_WEIGHT: f32 = 0.5;
const SIDEWAYS_SNAP_RATIO: f32 = 0.15;

pub const MAX_SPEED_KMH: f32 = 250.0;
const SPEED_WINDOW: usize = 5;

// Confidence penalties
const NOMINAL_INTERVAL_MS: f64 = 300.0;
const INTERVAL_TOLERANCE_MS: f64 = 150.0;
const EDGE_MARGIN_FRACTION: f32 = 0.08;
const MAX_PLAUSIBLE_DISPLACEMENT_FRACTION: f32 = 0.40;
const MIN_CONFIDENCE: f32 = 0.1;
const MAX_CONFIDENCE: f32 = 1.0;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MotionDirection {
    Approaching,
    Receding,
    Sideways,
    Stationary,
    Unknown,
}

impl MotionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approaching => "APPROACHING",
            Self::Receding => "RECEDING",
            Self::Sideways => "SIDEWAYS",
            Self::Stationary => "STATIONARY",
            Self::Unknown => "UNKNOWN",
        }
    }
}

pub struct SpeedInput<'a> {
    pub tracking_id: TrackId,
    pub detection: &'a Detection,
    pub frame_width: f32,
    pub frame_height: f32,
    pub ground_speed_kmh: f32,
    pub timestamp_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeedEstimate {
    /// Smoothed absolute speed of the observed object
    pub target_speed_kmh: f32,
    /// Signed speed relative to the observer (negative = receding)
    pub relative_speed_kmh: f32,
    pub direction: MotionDirection,
    pub confidence: f32,
    /// Raw lateral component before fusion
    pub lateral_kmh: f32,
    /// Raw depth component before fusion (0 when under threshold)
    pub depth_kmh: f32,
}

/// Previous observation for one tracking id
#[derive(Debug, Clone, Copy)]
struct FrameRecord {
    bbox: BoundingBox,
    timestamp_ms: f64,
    direction: MotionDirection,
    relative_kmh: f32,
}

// ============================================================================
// CALCULATOR
// ============================================================================

pub struct SpeedFusionCalculator {
    calibration: Option<Arc<dyn CalibrationSource>>,
    frames: HashMap<TrackId, FrameRecord>,
    smoothers: HashMap<TrackId, SpeedSmoother>,
}

impl SpeedFusionCalculator {
    /// Without a calibration source the documented defaults are used
    pub fn new(calibration: Option<Arc<dyn CalibrationSource>>) -> Self {
        Self {
            calibration,
            frames: HashMap::new(),
            smoothers: HashMap::new(),
        }
    }

    fn speed_scale(&self) -> f32 {
        self.calibration
            .as_ref()
            .map_or(SPEED_SCALE_FACTOR.nominal, |c| c.speed_scale_factor())
    }

    fn area_scale(&self) -> f32 {
        self.calibration
            .as_ref()
            .map_or(AREA_SCALE_FACTOR.nominal, |c| c.area_scale_factor())
    }

    fn ema_alpha(&self) -> f32 {
        self.calibration
            .as_ref()
            .map_or(EMA_ALPHA.nominal, |c| c.ema_alpha())
    }

    pub fn calculate_speed(&mut self, input: &SpeedInput<'_>) -> SpeedEstimate {
        let ground = if input.ground_speed_kmh.is_finite() {
            input.ground_speed_kmh.max(0.0)
        } else {
            0.0
        };
        let (fw, fh) = (input.frame_width, input.frame_height);
        let bbox = input.detection.bbox;

        if !(fw.is_finite() && fh.is_finite() && fw > 0.0 && fh > 0.0)
            || !bbox.is_valid()
            || !input.timestamp_ms.is_finite()
        {
            debug!(
                "Malformed speed input for {} (frame {}x{}), neutral result",
                input.tracking_id, fw, fh
            );
            return Self::neutral(ground);
        }

        let id = input.tracking_id;
        let now = input.timestamp_ms;

        // ── First observation: baseline only ──
        let Some(prev) = self.frames.get(&id).copied() else {
            self.frames.insert(
                id,
                FrameRecord {
                    bbox,
                    timestamp_ms: now,
                    direction: MotionDirection::Unknown,
                    relative_kmh: 0.0,
                },
            );
            let mut smoother = SpeedSmoother::new(SPEED_WINDOW);
            smoother.seed(ground);
            self.smoothers.insert(id, smoother);
            return SpeedEstimate {
                target_speed_kmh: ground.min(MAX_SPEED_KMH),
                relative_speed_kmh: 0.0,
                direction: MotionDirection::Unknown,
                confidence: FIRST_OBSERVATION_CONFIDENCE,
                lateral_kmh: 0.0,
                depth_kmh: 0.0,
            };
        };

        // ── Near-zero interval: keep the previous estimate ──
        let dt_ms = now - prev.timestamp_ms;
        if dt_ms < MIN_INTERVAL_MS {
            let previous = self
                .smoothers
                .get(&id)
                .and_then(|s| s.smoothed())
                .unwrap_or(ground);
            return SpeedEstimate {
                target_speed_kmh: previous,
                relative_speed_kmh: prev.relative_kmh,
                direction: prev.direction,
                confidence: SHORT_INTERVAL_CONFIDENCE,
                lateral_kmh: 0.0,
                depth_kmh: 0.0,
            };
        }
        let dt_s = (dt_ms / 1000.0) as f32;

        // ── Lateral signal ──
        let (px, py) = prev.bbox.center();
        let (cx, cy) = bbox.center();
        let displacement = ((cx - px).powi(2) + (cy - py).powi(2)).sqrt();
        let diagonal = (fw * fw + fh * fh).sqrt();
        let lateral_kmh =
            displacement / dt_s * (REFERENCE_DIAGONAL_PX / diagonal) * self.speed_scale();

        let area_fraction = bbox.area() / (fw * fh);
        let dead_zone = dead_zone_px(area_fraction);
        let confidence = frame_confidence(
            input.detection.confidence,
            &bbox,
            fw,
            fh,
            dt_ms,
            displacement,
        );
        let base_alpha = self.ema_alpha();
        let area_scale = self.area_scale();
        let smoother = self
            .smoothers
            .entry(id)
            .or_insert_with(|| SpeedSmoother::new(SPEED_WINDOW));

        // ── Dead-zone: both observer and object effectively stationary ──
        if displacement < dead_zone && ground < OBSERVER_STATIONARY_KMH {
            let decayed = smoother.decay(STATIONARY_DECAY);
            self.frames.insert(
                id,
                FrameRecord {
                    bbox,
                    timestamp_ms: now,
                    direction: MotionDirection::Stationary,
                    relative_kmh: 0.0,
                },
            );
            return SpeedEstimate {
                target_speed_kmh: decayed.clamp(0.0, MAX_SPEED_KMH),
                relative_speed_kmh: 0.0,
                direction: MotionDirection::Stationary,
                confidence,
                lateral_kmh,
                depth_kmh: 0.0,
            };
        }

        // ── Depth signal (per frame pair, not a rate) ──
        let prev_area = prev.bbox.area();
        let area_change_pct = (bbox.area() - prev_area) / prev_area * 100.0;
        let depth_kmh = if area_change_pct.abs() > depth_threshold_pct(area_fraction) {
            area_change_pct.abs() * area_scale
        } else {
            0.0
        };

        // ── Fusion + direction ──
        let magnitude = LATERAL_WEIGHT * lateral_kmh + DEPTH_WEIGHT * depth_kmh;
        let direction = classify_direction(displacement, area_change_pct, dead_zone);
        let relative_kmh = if direction == MotionDirection::Receding {
            -magnitude
        } else {
            magnitude
        };

        let raw_target = absolute_target(ground, relative_kmh, direction);
        let target = smoother.smooth(raw_target, base_alpha).clamp(0.0, MAX_SPEED_KMH);

        debug!(
            "{}: disp={:.1}px dA={:+.1}% lat={:.1} depth={:.1} rel={:+.1} raw={:.1} → {:.1} km/h {} (conf {:.2})",
            id,
            displacement,
            area_change_pct,
            lateral_kmh,
            depth_kmh,
            relative_kmh,
            raw_target,
            target,
            direction.as_str(),
            confidence
        );

        self.frames.insert(
            id,
            FrameRecord {
                bbox,
                timestamp_ms: now,
                direction,
                relative_kmh,
            },
        );

        SpeedEstimate {
            target_speed_kmh: target,
            relative_speed_kmh: relative_kmh,
            direction,
            confidence,
            lateral_kmh,
            depth_kmh,
        }
    }

    fn neutral(ground: f32) -> SpeedEstimate {
        SpeedEstimate {
            target_speed_kmh: ground.min(MAX_SPEED_KMH),
            relative_speed_kmh: 0.0,
            direction: MotionDirection::Unknown,
            confidence: MIN_CONFIDENCE,
            lateral_kmh: 0.0,
            depth_kmh: 0.0,
        }
    }

    /// Drop state for ids the tracker no longer reports
    pub fn prune_history(&mut self, active_ids: &HashSet<TrackId>) {
        self.frames.retain(|id, _| active_ids.contains(id));
        self.smoothers.retain(|id, _| active_ids.contains(id));
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.smoothers.clear();
    }

    pub fn smoothed_speed(&self, id: TrackId) -> Option<f32> {
        self.smoothers.get(&id).and_then(|s| s.smoothed())
    }

    pub fn tracked_ids(&self) -> usize {
        self.frames.len()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Displacement below which an object counts as not moving. Smaller boxes
/// get a wider dead-zone (up to 3x), large boxes down to 0.5x.
fn dead_zone_px(area_fraction: f32) -> f32 {
    let scale = if area_fraction > 0.0 {
        (DEAD_ZONE_REFERENCE_FRACTION / area_fraction).clamp(DEAD_ZONE_MIN_SCALE, DEAD_ZONE_MAX_SCALE)
    } else {
        DEAD_ZONE_MAX_SCALE
    };
    DEAD_ZONE_BASE_PX * scale
}

/// 2% for boxes covering more than 10% of the frame, relaxing linearly to
/// 0.8% as the box shrinks toward nothing
fn depth_threshold_pct(area_fraction: f32) -> f32 {
    if area_fraction > LARGE_BOX_FRACTION {
        DEPTH_THRESHOLD_LARGE_PCT
    } else {
        let t = (area_fraction / LARGE_BOX_FRACTION).clamp(0.0, 1.0);
        DEPTH_THRESHOLD_SMALL_PCT + t * (DEPTH_THRESHOLD_LARGE_PCT - DEPTH_THRESHOLD_SMALL_PCT)
    }
}

fn classify_direction(displacement: f32, area_change_pct: f32, dead_zone: f32) -> MotionDirection {
    if displacement > SIDEWAYS_MIN_DISPLACEMENT_PX
        && area_change_pct.abs() <= DIRECTION_AREA_CHANGE_PCT
    {
        MotionDirection::Sideways
    } else if area_change_pct > DIRECTION_AREA_CHANGE_PCT {
        MotionDirection::Approaching
    } else if area_change_pct < -DIRECTION_AREA_CHANGE_PCT {
        MotionDirection::Receding
    } else if displacement < dead_zone {
        MotionDirection::Stationary
    } else {
        MotionDirection::Unknown
    }
}

fn absolute_target(ground: f32, relative_kmh: f32, direction: MotionDirection) -> f32 {
    let rel = relative_kmh.abs();
    let target = if ground < OBSERVER_STATIONARY_KMH {
        rel
    } else {
        match direction {
            MotionDirection::Approaching => ground + rel,
            MotionDirection::Receding => ground - rel,
            MotionDirection::Sideways => {
                let t = ground + SIDEWAYS_RELATIVE_WEIGHT * rel;
                if (t - ground).abs() <= SIDEWAYS_SNAP_RATIO * ground {
                    ground
                } else {
                    t
                }
            }
            MotionDirection::Stationary | MotionDirection::Unknown => ground,
        }
    };
    target.clamp(0.0, MAX_SPEED_KMH)
}

fn frame_confidence(
    detection_confidence: f32,
    bbox: &BoundingBox,
    fw: f32,
    fh: f32,
    dt_ms: f64,
    displacement: f32,
) -> f32 {
    let mut confidence = if detection_confidence.is_finite() {
        detection_confidence
    } else {
        MIN_CONFIDENCE
    };

    let area_fraction = bbox.area() / (fw * fh);
    if area_fraction < 0.02 {
        confidence *= 0.5;
    } else if area_fraction < 0.05 {
        confidence *= 0.7;
    }

    let (mx, my) = (fw * EDGE_MARGIN_FRACTION, fh * EDGE_MARGIN_FRACTION);
    if bbox.left < mx || bbox.top < my || bbox.right > fw - mx || bbox.bottom > fh - my {
        confidence *= 0.8;
    }

    if (dt_ms - NOMINAL_INTERVAL_MS).abs() > INTERVAL_TOLERANCE_MS {
        confidence *= 0.85;
    }

    if displacement > fw * MAX_PLAUSIBLE_DISPLACEMENT_FRACTION {
        confidence *= 0.5;
    }

    confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::object_tracker::ObjectTracker;

    const FW: f32 = 1280.0;
    const FH: f32 = 720.0;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(2, "car", 0.8, BoundingBox::new(x1, y1, x2, y2))
    }

    fn track_id() -> TrackId {
        let mut tracker = ObjectTracker::default();
        tracker.update(&[det(0.0, 0.0, 10.0, 10.0)], 0.0)[0].tracking_id
    }

    fn run(
        calc: &mut SpeedFusionCalculator,
        id: TrackId,
        d: &Detection,
        ground: f32,
        t: f64,
    ) -> SpeedEstimate {
        calc.calculate_speed(&SpeedInput {
            tracking_id: id,
            detection: d,
            frame_width: FW,
            frame_height: FH,
            ground_speed_kmh: ground,
            timestamp_ms: t,
        })
    }

    #[test]
    fn test_first_observation_returns_ground() {
        let mut calc = SpeedFusionCalculator::new(None);
        let id = track_id();
        let est = run(&mut calc, id, &det(100.0, 100.0, 200.0, 160.0), 42.0, 0.0);
        assert_eq!(est.target_speed_kmh, 42.0);
        assert_eq!(est.confidence, 0.25);
        assert_eq!(est.direction, MotionDirection::Unknown);
    }

    #[test]
    fn test_short_interval_repeats_previous() {
        let mut calc = SpeedFusionCalculator::new(None);
        let id = track_id();
        run(&mut calc, id, &det(100.0, 100.0, 200.0, 160.0), 0.0, 0.0);
        let moved = run(&mut calc, id, &det(160.0, 100.0, 260.0, 160.0), 0.0, 300.0);

        let est = run(&mut calc, id, &det(400.0, 100.0, 500.0, 160.0), 0.0, 320.0);
        assert_eq!(est.target_speed_kmh, moved.target_speed_kmh);
        assert_eq!(est.confidence, 0.5);
        assert_eq!(est.direction, moved.direction);
    }

    #[test]
    fn test_sideways_scenario() {
        let mut calc = SpeedFusionCalculator::new(None);
        let id = track_id();
        run(&mut calc, id, &det(100.0, 100.0, 200.0, 160.0), 0.0, 0.0);
        let est = run(&mut calc, id, &det(130.0, 100.0, 230.0, 160.0), 0.0, 300.0);

        assert_eq!(est.direction, MotionDirection::Sideways);
        assert!(est.target_speed_kmh > 0.0);
        assert!((0.1..=1.0).contains(&est.confidence));
        // 30px over 0.3s at the reference diagonal: 100 px/s * 0.035
        assert!((est.lateral_kmh - 3.5).abs() < 0.01);
    }

    #[test]
    fn test_stationary_decays_to_zero() {
        let mut calc = SpeedFusionCalculator::new(None);
        let id = track_id();
        let d = det(500.0, 300.0, 700.0, 420.0);
        // Seed a non-zero estimate first
        run(&mut calc, id, &det(400.0, 300.0, 600.0, 420.0), 0.0, 0.0);
        let moving = run(&mut calc, id, &d, 0.0, 300.0);
        assert!(moving.target_speed_kmh > 0.0);

        let mut last = moving.target_speed_kmh;
        for i in 2..12 {
            let est = run(&mut calc, id, &d, 0.0, i as f64 * 300.0);
            assert_eq!(est.direction, MotionDirection::Stationary);
            assert!(est.target_speed_kmh <= last);
            last = est.target_speed_kmh;
        }
        assert!(last < moving.target_speed_kmh * 0.4);
    }

    #[test]
    fn test_identical_detections_stay_stationary() {
        let mut calc = SpeedFusionCalculator::new(None);
        let id = track_id();
        let d = det(500.0, 300.0, 600.0, 360.0);
        for i in 0..10 {
            let est = run(&mut calc, id, &d, 0.0, i as f64 * 300.0);
            if i >= 1 {
                assert_eq!(est.direction, MotionDirection::Stationary);
                assert!(est.target_speed_kmh.abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_lateral_speed_monotonic_in_displacement() {
        let id = track_id();
        let mut prev_lateral = 0.0;
        for d in [20.0, 40.0, 80.0, 160.0] {
            let mut calc = SpeedFusionCalculator::new(None);
            run(&mut calc, id, &det(300.0, 300.0, 400.0, 360.0), 0.0, 0.0);
            let est = run(
                &mut calc,
                id,
                &det(300.0 + d, 300.0, 400.0 + d, 360.0),
                0.0,
                300.0,
            );
            assert!(est.lateral_kmh >= prev_lateral);
            prev_lateral = est.lateral_kmh;
        }
    }

    #[test]
    fn test_approaching_adds_to_ground() {
        let mut calc = SpeedFusionCalculator::new(None);
        let id = track_id();
        run(&mut calc, id, &det(500.0, 300.0, 600.0, 360.0), 60.0, 0.0);
        // Grows 20% in width and height about the same center
        let est = run(&mut calc, id, &det(490.0, 294.0, 610.0, 366.0), 60.0, 300.0);
        assert_eq!(est.direction, MotionDirection::Approaching);
        assert!(est.depth_kmh > 0.0);
        assert!(est.relative_speed_kmh > 0.0);
        assert!(est.target_speed_kmh > 60.0);
    }

    #[test]
    fn test_depth_is_area_change_times_scale() {
        // 100x60 → 120x72 about the same center: +44% area, 0.8 * 44 = 35.2
        for dt in [300.0, 600.0] {
            let mut calc = SpeedFusionCalculator::new(None);
            let id = track_id();
            run(&mut calc, id, &det(500.0, 300.0, 600.0, 360.0), 60.0, 0.0);
            let est = run(&mut calc, id, &det(490.0, 294.0, 610.0, 366.0), 60.0, dt);
            assert!(
                (est.depth_kmh - 35.2).abs() < 1e-3,
                "depth at dt={} was {}",
                dt,
                est.depth_kmh
            );
            assert!((est.relative_speed_kmh - 0.35 * 35.2).abs() < 1e-3);
        }
    }

    #[test]
    fn test_receding_negates_relative() {
        let mut calc = SpeedFusionCalculator::new(None);
        let id = track_id();
        run(&mut calc, id, &det(490.0, 294.0, 610.0, 366.0), 60.0, 0.0);
        let est = run(&mut calc, id, &det(500.0, 300.0, 600.0, 360.0), 60.0, 300.0);
        assert_eq!(est.direction, MotionDirection::Receding);
        assert!(est.relative_speed_kmh < 0.0);
        assert!(est.target_speed_kmh < 60.0);
    }

    #[test]
    fn test_absolute_target_rules() {
        assert_eq!(absolute_target(2.0, -15.0, MotionDirection::Receding), 15.0);
        assert_eq!(absolute_target(50.0, 10.0, MotionDirection::Approaching), 60.0);
        assert_eq!(absolute_target(50.0, -80.0, MotionDirection::Receding), 0.0);
        // 50 + 0.5 * 10 = 55 is within 15% of 50 → snapped
        assert_eq!(absolute_target(50.0, 10.0, MotionDirection::Sideways), 50.0);
        assert_eq!(absolute_target(50.0, 40.0, MotionDirection::Sideways), 70.0);
        assert_eq!(absolute_target(50.0, 40.0, MotionDirection::Unknown), 50.0);
        assert_eq!(absolute_target(240.0, 40.0, MotionDirection::Approaching), 250.0);
    }

    #[test]
    fn test_dead_zone_scaling() {
        assert_eq!(dead_zone_px(0.001), 18.0);
        assert_eq!(dead_zone_px(0.05), 6.0);
        assert_eq!(dead_zone_px(0.5), 3.0);
        assert_eq!(dead_zone_px(0.0), 18.0);
    }

    #[test]
    fn test_depth_threshold_relaxes_for_small_boxes() {
        assert_eq!(depth_threshold_pct(0.2), 2.0);
        assert!((depth_threshold_pct(0.05) - 1.4).abs() < 1e-5);
        assert!((depth_threshold_pct(0.0) - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_confidence_penalties() {
        let centered_large = BoundingBox::new(400.0, 200.0, 880.0, 520.0);
        assert!((frame_confidence(0.9, &centered_large, FW, FH, 300.0, 10.0) - 0.9).abs() < 1e-5);
        // Off-cadence interval
        assert!(
            (frame_confidence(0.9, &centered_large, FW, FH, 600.0, 10.0) - 0.765).abs() < 1e-5
        );
        // Tiny box at the edge with an implausible jump, clamped to the floor
        let tiny_edge = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        assert_eq!(frame_confidence(0.3, &tiny_edge, FW, FH, 1000.0, 900.0), 0.1);
    }

    #[test]
    fn test_malformed_input_is_neutral() {
        let mut calc = SpeedFusionCalculator::new(None);
        let id = track_id();
        let est = calc.calculate_speed(&SpeedInput {
            tracking_id: id,
            detection: &det(100.0, 100.0, 100.0, 100.0),
            frame_width: FW,
            frame_height: FH,
            ground_speed_kmh: 30.0,
            timestamp_ms: 0.0,
        });
        assert_eq!(est.target_speed_kmh, 30.0);
        assert_eq!(est.direction, MotionDirection::Unknown);

        let est = calc.calculate_speed(&SpeedInput {
            tracking_id: id,
            detection: &det(100.0, 100.0, 200.0, 200.0),
            frame_width: 0.0,
            frame_height: FH,
            ground_speed_kmh: 30.0,
            timestamp_ms: 0.0,
        });
        assert_eq!(est.confidence, 0.1);
        assert_eq!(calc.tracked_ids(), 0, "Malformed input must not create state");
    }

    #[test]
    fn test_prune_and_reset() {
        let mut tracker = ObjectTracker::default();
        let tracks = tracker.update(
            &[det(0.0, 0.0, 100.0, 100.0), det(500.0, 0.0, 600.0, 100.0)],
            0.0,
        );
        let (a, b) = (tracks[0].tracking_id, tracks[1].tracking_id);

        let mut calc = SpeedFusionCalculator::new(None);
        run(&mut calc, a, &det(0.0, 0.0, 100.0, 100.0), 0.0, 0.0);
        run(&mut calc, b, &det(500.0, 0.0, 600.0, 100.0), 0.0, 0.0);
        assert_eq!(calc.tracked_ids(), 2);

        calc.prune_history(&HashSet::from([b]));
        assert_eq!(calc.tracked_ids(), 1);
        assert!(calc.smoothed_speed(a).is_none());
        assert!(calc.smoothed_speed(b).is_some());

        calc.reset();
        assert_eq!(calc.tracked_ids(), 0);
    }

    struct FixedCalibration(f32);

    impl CalibrationSource for FixedCalibration {
        fn speed_scale_factor(&self) -> f32 {
            self.0
        }
        fn area_scale_factor(&self) -> f32 {
            AREA_SCALE_FACTOR.nominal
        }
        fn ema_alpha(&self) -> f32 {
            EMA_ALPHA.nominal
        }
        fn detection_confidence_floor(&self) -> f32 {
            0.3
        }
        fn frame_delay_ms(&self) -> f64 {
            300.0
        }
        fn plate_vote_threshold(&self) -> u32 {
            2
        }
        fn ocr_crop_pad_x(&self) -> f32 {
            0.05
        }
        fn ocr_crop_pad_bot(&self) -> f32 {
            0.10
        }
    }

    #[test]
    fn test_injected_calibration_scales_lateral() {
        let id = track_id();
        let mut calc = SpeedFusionCalculator::new(Some(Arc::new(FixedCalibration(0.05))));
        run(&mut calc, id, &det(100.0, 100.0, 200.0, 160.0), 0.0, 0.0);
        let est = run(&mut calc, id, &det(130.0, 100.0, 230.0, 160.0), 0.0, 300.0);
        assert!((est.lateral_kmh - 5.0).abs() < 0.01);
    }
}
