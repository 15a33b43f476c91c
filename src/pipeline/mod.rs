// src/pipeline/mod.rs

pub mod frame_context;
pub mod metrics;
pub mod replay;
pub mod runner;
pub mod session;

pub use frame_context::{FrameContext, FrameReport, TrackReport};
pub use metrics::{MetricsSummary, PipelineMetrics};
pub use runner::{
    spawn_session, CapturedFrame, Detector, FrameSource, RunnerConfig, SessionHandle,
    SessionStopper,
};
pub use session::SpeedSession;
