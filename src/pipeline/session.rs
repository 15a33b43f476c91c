// src/pipeline/session.rs
//
// One measurement session: detections → tracker → speed fusion, with the
// calibration engine observing along the way.
//
// The session owns the tracker and the calculator outright, so a frame is
// always folded through both completely before the next one starts. The
// engine is shared because its tunables outlive any session.

use super::frame_context::{FrameContext, FrameReport, TrackReport};
use super::metrics::PipelineMetrics;
use crate::analysis::adaptive::{CalibrationEngine, CalibrationSource, CycleReport};
use crate::analysis::{ObjectTracker, SpeedFusionCalculator, SpeedInput, TrackId, TrackerConfig};
use crate::types::{Detection, PlateRead, SessionConfig, TargetCommand};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct SpeedSession {
    tracker: ObjectTracker,
    calculator: SpeedFusionCalculator,
    engine: Arc<CalibrationEngine>,
    metrics: PipelineMetrics,
    max_ground_accuracy_m: f32,
    /// When set, due improvement cycles are reported instead of run inline
    background_cycles: bool,
}

impl SpeedSession {
    pub fn new(engine: Arc<CalibrationEngine>, config: &SessionConfig) -> Self {
        let source: Arc<dyn CalibrationSource> = engine.clone();
        Self {
            tracker: ObjectTracker::new(TrackerConfig::default()),
            calculator: SpeedFusionCalculator::new(Some(source)),
            engine,
            metrics: PipelineMetrics::new(),
            max_ground_accuracy_m: config.max_ground_accuracy_m,
            background_cycles: false,
        }
    }

    pub fn set_background_cycles(&mut self, enabled: bool) {
        self.background_cycles = enabled;
    }

    pub fn engine(&self) -> Arc<CalibrationEngine> {
        self.engine.clone()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn tracker(&self) -> &ObjectTracker {
        &self.tracker
    }

    /// Fold one frame through the tracker and the calculator
    pub fn process_frame(&mut self, ctx: FrameContext) -> FrameReport {
        let started = Instant::now();
        self.metrics.inc(&self.metrics.total_frames);

        self.engine.feed_detection_stability(ctx.detections.len());

        // Fallback detections are the caller's policy and skip the floor
        let floor = self.engine.detection_confidence_floor();
        let accepted: Vec<Detection> = ctx
            .detections
            .iter()
            .filter(|d| d.is_fallback || d.confidence >= floor)
            .cloned()
            .collect();
        if accepted.len() < ctx.detections.len() {
            debug!(
                "Frame {}: {} of {} detections below floor {:.2}",
                ctx.frame_id,
                ctx.detections.len() - accepted.len(),
                ctx.detections.len(),
                floor
            );
        }

        let previous_ids = self.tracker.active_ids();
        let tracks = self.tracker.update(&accepted, ctx.timestamp_ms).to_vec();
        let created = tracks
            .iter()
            .filter(|t| !previous_ids.contains(&t.tracking_id))
            .count();
        self.metrics
            .add(&self.metrics.tracks_created, created as u64);
        if !tracks.is_empty() {
            self.metrics.inc(&self.metrics.frames_with_tracks);
        }

        let ground_trusted = ctx.ground_is_trusted(self.max_ground_accuracy_m);
        let mut reports = Vec::with_capacity(tracks.len());
        let mut coasting = 0;

        for track in &tracks {
            if !track.seen_at(ctx.timestamp_ms) {
                coasting += 1;
                continue;
            }

            let estimate = self.calculator.calculate_speed(&SpeedInput {
                tracking_id: track.tracking_id,
                detection: &track.detection,
                frame_width: ctx.frame_width,
                frame_height: ctx.frame_height,
                ground_speed_kmh: ctx.ground.speed_kmh,
                timestamp_ms: ctx.timestamp_ms,
            });
            self.tracker
                .set_estimated_speed(track.tracking_id, estimate.target_speed_kmh);
            self.metrics.inc(&self.metrics.speed_estimates);

            if track.is_locked && ground_trusted {
                self.engine.feed_speed_observation(
                    estimate.relative_speed_kmh,
                    ctx.ground.speed_kmh,
                    estimate.target_speed_kmh,
                );
            }

            reports.push(TrackReport {
                tracking_id: track.tracking_id,
                class_name: track.detection.class_name.clone(),
                bbox: track.detection.bbox,
                frame_count: track.frame_count,
                is_locked: track.is_locked,
                estimate,
            });
        }

        self.calculator.prune_history(&self.tracker.active_ids());

        let processing_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .set_timing(&self.metrics.frame_time_us, (processing_ms * 1000.0) as u64);
        self.engine.feed_frame_timing(ctx.upstream_ms + processing_ms);

        let mut cycle_due = self.engine.record_frame();
        if cycle_due && !self.background_cycles {
            self.run_cycle();
            cycle_due = false;
        }

        FrameReport {
            frame_id: ctx.frame_id,
            timestamp_ms: ctx.timestamp_ms,
            tracks: reports,
            coasting,
            locked: self.tracker.locked().map(|t| t.tracking_id),
            cycle_due,
            processing_ms,
        }
    }

    /// Run an improvement cycle on the calling thread
    pub fn run_cycle(&self) -> Option<CycleReport> {
        let report = self.engine.improve_and_persist();
        if report.is_some() {
            self.metrics.inc(&self.metrics.calibration_cycles);
        }
        report
    }

    pub fn on_plate_read(&self, read: &PlateRead) {
        self.metrics.inc(&self.metrics.plate_reads);
        record_plate_read(&self.engine, read);
    }

    pub fn apply_command(&mut self, command: TargetCommand) -> Option<TrackId> {
        match command {
            TargetCommand::LockPrimary => self.lock_target(None),
            TargetCommand::Unlock => {
                self.unlock_target();
                None
            }
        }
    }

    /// Lock `id`, or the primary track when `None`
    pub fn lock_target(&mut self, id: Option<TrackId>) -> Option<TrackId> {
        let locked = self.tracker.lock_target(id);
        if locked.is_none() {
            warn!("No track available to lock");
        }
        locked
    }

    pub fn unlock_target(&mut self) {
        self.tracker.unlock();
    }

    /// Flush a final improvement cycle and clear per-session state. Waits
    /// for a periodic cycle still in flight. The calibration record itself
    /// is left as the final cycle wrote it.
    pub fn stop(&mut self) -> CycleReport {
        let report = self.engine.flush();
        self.metrics.inc(&self.metrics.calibration_cycles);
        info!(
            "🛑 Session stopped (final cycle persisted: {})",
            report.persisted
        );
        self.tracker.reset();
        self.calculator.reset();
        report
    }
}

/// An empty read counts as an OCR miss; only non-empty reads carry a
/// correctness verdict worth learning from.
pub fn record_plate_read(engine: &CalibrationEngine, read: &PlateRead) {
    let success = !read.text.trim().is_empty();
    engine.feed_ocr_result(success);
    if success {
        engine.feed_plate_correction(read.correct);
    }
}
