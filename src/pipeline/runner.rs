// src/pipeline/runner.rs
//
// Self-pacing capture loop.
//
//   next_frame → detect (blocking pool, bounded) → session.process_frame
//        ↑                                                   │
//        └──── sleep(frame_delay_ms − elapsed) ◄─────────────┘
//
// The delay is re-read from the calibration engine every iteration, so a
// slow device stretches its own cadence instead of queueing frames.

use super::frame_context::{FrameContext, FrameReport};
use super::metrics::{MetricsSummary, PipelineMetrics};
use super::session::{record_plate_read, SpeedSession};
use crate::analysis::adaptive::CalibrationSource;
use crate::types::{Detection, GroundSpeed, PlateRead, SessionConfig, TargetCommand};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_CONSECUTIVE_SOURCE_ERRORS: u32 = 5;

/// One captured frame as handed over by the capture side. Pixel data stays
/// with the detector; the session only ever sees its detections.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub width: Option<f32>,
    pub height: Option<f32>,
    pub ground: GroundSpeed,
    pub plate_read: Option<PlateRead>,
    pub target: Option<TargetCommand>,
}

pub trait FrameSource: Send + 'static {
    /// `Ok(None)` once the source is exhausted
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>>;
}

pub trait Detector: Send + Sync + 'static {
    fn detect(&self, frame: &CapturedFrame) -> Result<Vec<Detection>>;
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub detection_timeout: Duration,
    pub frame_width: f32,
    pub frame_height: f32,
}

impl From<&SessionConfig> for RunnerConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            detection_timeout: Duration::from_millis(config.detection_timeout_ms),
            frame_width: config.frame_width,
            frame_height: config.frame_height,
        }
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Requests a stop without owning the task
#[derive(Clone)]
pub struct SessionStopper {
    tx: Arc<watch::Sender<bool>>,
}

impl SessionStopper {
    pub fn stop(&self) {
        // Receiver gone means the loop already finished
        let _ = self.tx.send(true);
    }
}

pub struct SessionHandle {
    stopper: SessionStopper,
    join: JoinHandle<MetricsSummary>,
}

impl SessionHandle {
    pub fn stopper(&self) -> SessionStopper {
        self.stopper.clone()
    }

    /// Wait for the loop to end on its own (source exhausted or stopped)
    pub async fn join(self) -> Option<MetricsSummary> {
        match self.join.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!("Session task failed: {}", e);
                None
            }
        }
    }

    /// Signal shutdown and wait for the final calibration flush
    pub async fn stop(self) -> Option<MetricsSummary> {
        self.stopper.stop();
        self.join().await
    }
}

// ============================================================================
// LOOP
// ============================================================================

/// Start the loop on the current runtime. `reports` receives every frame
/// report when given; a full channel drops reports rather than stalling.
pub fn spawn_session(
    mut session: SpeedSession,
    source: Box<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    config: RunnerConfig,
    reports: Option<mpsc::Sender<FrameReport>>,
) -> SessionHandle {
    let (tx, rx) = watch::channel(false);
    session.set_background_cycles(true);
    let join = tokio::spawn(run_loop(session, source, detector, config, reports, rx));
    SessionHandle {
        stopper: SessionStopper { tx: Arc::new(tx) },
        join,
    }
}

async fn run_loop(
    mut session: SpeedSession,
    mut source: Box<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    config: RunnerConfig,
    reports: Option<mpsc::Sender<FrameReport>>,
    mut stop_rx: watch::Receiver<bool>,
) -> MetricsSummary {
    let engine = session.engine();
    let metrics = session.metrics().clone();
    let mut source_errors = 0u32;
    let mut pending_cycle: Option<JoinHandle<()>> = None;

    info!("▶️ Session loop started");

    loop {
        if *stop_rx.borrow() {
            break;
        }
        let iteration_start = Instant::now();

        let frame = match source.next_frame() {
            Ok(Some(frame)) => {
                source_errors = 0;
                Some(frame)
            }
            Ok(None) => {
                info!("Frame source exhausted");
                break;
            }
            Err(e) => {
                source_errors += 1;
                warn!("Frame source error ({}): {:#}", source_errors, e);
                if source_errors >= MAX_CONSECUTIVE_SOURCE_ERRORS {
                    error!("Frame source failing repeatedly, ending session");
                    break;
                }
                None
            }
        };

        if let Some(frame) = frame {
            if let Some(read) = frame.plate_read.clone() {
                metrics.inc(&metrics.plate_reads);
                let engine = engine.clone();
                // Plate feedback persists immediately; keep the disk write off the loop
                if let Err(e) =
                    tokio::task::spawn_blocking(move || record_plate_read(&engine, &read)).await
                {
                    error!("Plate feedback task failed: {}", e);
                }
            }

            if let Some(detections) = detect(&detector, &frame, &config, &metrics).await {
                let ctx = FrameContext {
                    frame_id: frame.frame_id,
                    timestamp_ms: frame.timestamp_ms,
                    frame_width: frame.width.unwrap_or(config.frame_width),
                    frame_height: frame.height.unwrap_or(config.frame_height),
                    detections,
                    ground: frame.ground,
                    upstream_ms: iteration_start.elapsed().as_secs_f64() * 1000.0,
                };
                let report = session.process_frame(ctx);

                if let Some(command) = frame.target {
                    session.apply_command(command);
                }

                let cycle_idle = pending_cycle.as_ref().map_or(true, JoinHandle::is_finished);
                if report.cycle_due && cycle_idle {
                    let engine = engine.clone();
                    let metrics = metrics.clone();
                    pending_cycle = Some(tokio::task::spawn_blocking(move || {
                        if engine.improve_and_persist().is_some() {
                            metrics.inc(&metrics.calibration_cycles);
                        }
                    }));
                }

                if let Some(tx) = &reports {
                    if tx.try_send(report).is_err() {
                        debug!("Report channel full or closed, frame report dropped");
                    }
                }
            }
        }

        let delay = Duration::from_secs_f64(engine.frame_delay_ms().max(0.0) / 1000.0);
        let remaining = delay.saturating_sub(iteration_start.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            changed = stop_rx.changed() => {
                // Handle dropped
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(cycle) = pending_cycle.take() {
        if let Err(e) = cycle.await {
            error!("Calibration cycle task failed: {}", e);
        }
    }

    // Final flush touches the store; run it where blocking is allowed
    if let Err(e) = tokio::task::spawn_blocking(move || session.stop()).await {
        error!("Final calibration flush failed: {}", e);
    }

    let summary = metrics.summary();
    info!(
        "⏹️ Session loop ended: {} frames, {} estimates, {} timeouts",
        summary.total_frames, summary.speed_estimates, summary.detection_timeouts
    );
    summary
}

/// Run the detector on the blocking pool under the configured timeout.
/// `None` skips the frame; tracks simply age by timestamp.
async fn detect(
    detector: &Arc<dyn Detector>,
    frame: &CapturedFrame,
    config: &RunnerConfig,
    metrics: &PipelineMetrics,
) -> Option<Vec<Detection>> {
    let detector = detector.clone();
    let captured = frame.clone();
    let task = tokio::task::spawn_blocking(move || detector.detect(&captured));

    match tokio::time::timeout(config.detection_timeout, task).await {
        Ok(Ok(Ok(detections))) => Some(detections),
        Ok(Ok(Err(e))) => {
            metrics.inc(&metrics.detection_failures);
            warn!("Detection failed on frame {}: {:#}", frame.frame_id, e);
            None
        }
        Ok(Err(e)) => {
            metrics.inc(&metrics.detection_failures);
            error!("Detection task panicked on frame {}: {}", frame.frame_id, e);
            None
        }
        Err(_) => {
            metrics.inc(&metrics.detection_timeouts);
            warn!(
                "Detection timed out on frame {} after {:?}",
                frame.frame_id, config.detection_timeout
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::adaptive::{
        CalibrationEngine, CalibrationState, CalibrationStore, MemoryStore,
        DEFAULT_CYCLE_EVERY_FRAMES,
    };
    use crate::types::BoundingBox;
    use std::collections::VecDeque;

    struct SharedStore(Arc<MemoryStore>);

    impl CalibrationStore for SharedStore {
        fn load(&self) -> anyhow::Result<Option<CalibrationState>> {
            self.0.load()
        }
        fn save(&self, state: &CalibrationState) -> anyhow::Result<()> {
            self.0.save(state)
        }
    }

    struct VecSource(VecDeque<CapturedFrame>);

    impl FrameSource for VecSource {
        fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
            Ok(self.0.pop_front())
        }
    }

    /// Emits a car sliding right by 30px per frame
    struct SlidingDetector;

    impl Detector for SlidingDetector {
        fn detect(&self, frame: &CapturedFrame) -> Result<Vec<Detection>> {
            let x = 200.0 + frame.frame_id as f32 * 30.0;
            Ok(vec![Detection::new(
                2,
                "car",
                0.9,
                BoundingBox::new(x, 300.0, x + 120.0, 380.0),
            )])
        }
    }

    struct SlowDetector;

    impl Detector for SlowDetector {
        fn detect(&self, _frame: &CapturedFrame) -> Result<Vec<Detection>> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Vec::new())
        }
    }

    struct EndlessSource(u64);

    impl FrameSource for EndlessSource {
        fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
            self.0 += 1;
            Ok(Some(frame(self.0)))
        }
    }

    fn frame(id: u64) -> CapturedFrame {
        CapturedFrame {
            frame_id: id,
            timestamp_ms: id as f64 * 300.0,
            width: None,
            height: None,
            ground: GroundSpeed::default(),
            plate_read: None,
            target: None,
        }
    }

    fn fast_engine(store: Arc<MemoryStore>) -> Arc<CalibrationEngine> {
        fast_engine_cycling_every(store, DEFAULT_CYCLE_EVERY_FRAMES)
    }

    fn fast_engine_cycling_every(store: Arc<MemoryStore>, frames: u64) -> Arc<CalibrationEngine> {
        let mut state = CalibrationState::default();
        // Clamped up to the 200ms minimum by sanitize
        state.frame_delay_ms = 0.0;
        store.save(&state).unwrap();
        Arc::new(CalibrationEngine::with_cycle_interval(
            Box::new(SharedStore(store)),
            frames,
        ))
    }

    fn config(timeout_ms: u64) -> RunnerConfig {
        RunnerConfig {
            detection_timeout: Duration::from_millis(timeout_ms),
            frame_width: 1280.0,
            frame_height: 720.0,
        }
    }

    #[tokio::test]
    async fn test_loop_runs_source_to_exhaustion() {
        let store = Arc::new(MemoryStore::new());
        let engine = fast_engine(store.clone());
        let session = SpeedSession::new(engine.clone(), &SessionConfig::default());
        let frames: VecDeque<_> = (0..3).map(frame).collect();
        let (tx, mut rx) = mpsc::channel(16);

        let handle = spawn_session(
            session,
            Box::new(VecSource(frames)),
            Arc::new(SlidingDetector),
            config(1000),
            Some(tx),
        );
        let summary = handle.join().await.expect("loop should finish cleanly");

        assert_eq!(summary.total_frames, 3);
        assert_eq!(summary.tracks_created, 1);
        assert_eq!(summary.speed_estimates, 3);

        let mut last = None;
        while let Ok(report) = rx.try_recv() {
            last = Some(report);
        }
        let last = last.expect("reports should be delivered");
        assert!(last.tracks[0].estimate.target_speed_kmh > 0.0);

        // Final flush merged the session into the lifetime record
        assert_eq!(engine.snapshot().total_sessions, 1);
        assert_eq!(store.stored().unwrap().total_frames, 3);
    }

    #[tokio::test]
    async fn test_periodic_cycles_run_in_background() {
        let store = Arc::new(MemoryStore::new());
        let engine = fast_engine_cycling_every(store.clone(), 2);
        let session = SpeedSession::new(engine.clone(), &SessionConfig::default());

        let handle = spawn_session(
            session,
            Box::new(VecSource((0..4).map(frame).collect())),
            Arc::new(SlidingDetector),
            config(1000),
            None,
        );
        let summary = handle.join().await.expect("loop should finish cleanly");

        // Due after frames 2 and 4, then the final flush
        assert_eq!(summary.total_frames, 4);
        assert_eq!(summary.calibration_cycles, 3);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.total_sessions, summary.calibration_cycles);
        assert_eq!(snapshot.total_frames, 4);
        assert_eq!(store.stored().unwrap().total_sessions, 3);
    }

    #[tokio::test]
    async fn test_detection_timeout_skips_frame() {
        let store = Arc::new(MemoryStore::new());
        let engine = fast_engine(store);
        let session = SpeedSession::new(engine, &SessionConfig::default());

        let handle = spawn_session(
            session,
            Box::new(VecSource((0..2).map(frame).collect())),
            Arc::new(SlowDetector),
            config(20),
            None,
        );
        let summary = handle.join().await.expect("loop should finish cleanly");
        assert_eq!(summary.detection_timeouts, 2);
        assert_eq!(summary.total_frames, 0);
    }

    #[tokio::test]
    async fn test_stop_interrupts_endless_source() {
        let store = Arc::new(MemoryStore::new());
        let engine = fast_engine(store.clone());
        let session = SpeedSession::new(engine.clone(), &SessionConfig::default());

        let handle = spawn_session(
            session,
            Box::new(EndlessSource(0)),
            Arc::new(SlidingDetector),
            config(1000),
            None,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = handle.stop().await.expect("stop should join the loop");

        assert!(summary.total_frames >= 1);
        assert_eq!(engine.snapshot().total_sessions, 1);
        assert!(store.save_count() >= 2);
    }
}
