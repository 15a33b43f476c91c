// src/pipeline/frame_context.rs
//
// Everything the session needs about one frame, gathered before any
// subsystem runs, plus the per-frame report handed back to the caller.

use crate::analysis::{MotionDirection, SpeedEstimate, TrackId};
use crate::types::{BoundingBox, Detection, GroundSpeed};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct FrameContext {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub frame_width: f32,
    pub frame_height: f32,
    pub detections: Vec<Detection>,
    pub ground: GroundSpeed,
    /// Time already spent on this frame before the session sees it (capture + detection)
    pub upstream_ms: f64,
}

impl FrameContext {
    pub fn new(frame_id: u64, timestamp_ms: f64, frame_width: f32, frame_height: f32) -> Self {
        Self {
            frame_id,
            timestamp_ms,
            frame_width,
            frame_height,
            detections: Vec::new(),
            ground: GroundSpeed::default(),
            upstream_ms: 0.0,
        }
    }

    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.detections = detections;
        self
    }

    pub fn with_ground(mut self, speed_kmh: f32, accuracy_m: f32) -> Self {
        self.ground = GroundSpeed {
            speed_kmh,
            accuracy_m,
        };
        self
    }

    /// Ground speed usable as a calibration reference
    pub fn ground_is_trusted(&self, max_accuracy_m: f32) -> bool {
        self.ground.speed_kmh.is_finite()
            && self.ground.accuracy_m.is_finite()
            && self.ground.accuracy_m <= max_accuracy_m
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackReport {
    pub tracking_id: TrackId,
    pub class_name: String,
    pub bbox: BoundingBox,
    pub frame_count: u32,
    pub is_locked: bool,
    pub estimate: SpeedEstimate,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameReport {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    /// Tracks matched on this frame, with their fresh estimates
    pub tracks: Vec<TrackReport>,
    /// Tracks still alive but not matched on this frame
    pub coasting: usize,
    pub locked: Option<TrackId>,
    /// An improvement cycle is due and was left to the caller
    pub cycle_due: bool,
    pub processing_ms: f64,
}

impl FrameReport {
    pub fn locked_report(&self) -> Option<&TrackReport> {
        self.tracks.iter().find(|t| t.is_locked)
    }

    pub fn moving(&self) -> impl Iterator<Item = &TrackReport> {
        self.tracks
            .iter()
            .filter(|t| t.estimate.direction != MotionDirection::Stationary)
    }
}
