// src/pipeline/metrics.rs
//
// Session counters. Cheap to clone; clones share the same atomics so the
// runner and background cycles can report into one summary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub frames_with_tracks: Arc<AtomicU64>,
    pub tracks_created: Arc<AtomicU64>,
    pub speed_estimates: Arc<AtomicU64>,
    pub detection_timeouts: Arc<AtomicU64>,
    pub detection_failures: Arc<AtomicU64>,
    pub calibration_cycles: Arc<AtomicU64>,
    pub plate_reads: Arc<AtomicU64>,
    pub frame_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            frames_with_tracks: Arc::new(AtomicU64::new(0)),
            tracks_created: Arc::new(AtomicU64::new(0)),
            speed_estimates: Arc::new(AtomicU64::new(0)),
            detection_timeouts: Arc::new(AtomicU64::new(0)),
            detection_failures: Arc::new(AtomicU64::new(0)),
            calibration_cycles: Arc::new(AtomicU64::new(0)),
            plate_reads: Arc::new(AtomicU64::new(0)),
            frame_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            fps: self.fps(),
            frames_with_tracks: self.frames_with_tracks.load(Ordering::Relaxed),
            tracks_created: self.tracks_created.load(Ordering::Relaxed),
            speed_estimates: self.speed_estimates.load(Ordering::Relaxed),
            detection_timeouts: self.detection_timeouts.load(Ordering::Relaxed),
            detection_failures: self.detection_failures.load(Ordering::Relaxed),
            calibration_cycles: self.calibration_cycles.load(Ordering::Relaxed),
            plate_reads: self.plate_reads.load(Ordering::Relaxed),
            last_frame_us: self.frame_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub fps: f64,
    pub frames_with_tracks: u64,
    pub tracks_created: u64,
    pub speed_estimates: u64,
    pub detection_timeouts: u64,
    pub detection_failures: u64,
    pub calibration_cycles: u64,
    pub plate_reads: u64,
    pub last_frame_us: u64,
    pub elapsed_secs: f64,
}
