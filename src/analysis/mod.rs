// src/analysis/mod.rs
//
// Per-frame analysis.
//
// Signal flow:
//   Detections → object_tracker ─→ TrackedObject (stable id) ─┐
//   Ground speed ──────────────────────────────────────────────┼→ speed_fusion → SpeedEstimate
//   adaptive::CalibrationEngine ── tunables ───────────────────┘
//
// Orchestrated by pipeline::SpeedSession.

pub mod adaptive;
pub mod object_tracker;
pub mod speed_fusion;

pub use adaptive::{CalibrationEngine, CalibrationSource};
pub use object_tracker::{ObjectTracker, TrackId, TrackedObject, TrackerConfig};
pub use speed_fusion::{MotionDirection, SpeedEstimate, SpeedFusionCalculator, SpeedInput};
