// src/analysis/adaptive/engine.rs
//
// Online calibration of every tunable the tracker, speed calculator and
// capture loop read. Observations are pushed in continuously from the live
// session; an improvement cycle folds them into the lifetime record,
// adjusts the tunables and persists the result.
//
// Concurrency:
//   - All state sits behind one mutex, held only for in-memory work.
//   - Improvement cycles are single-flight: a periodic trigger that finds
//     one running returns `None`, while `flush` waits for it and then runs
//     its own. The cycle lock is a mutex so a panicking cycle cannot wedge it.
//   - Store writes happen outside the state lock, serialised by their own
//     lock, so frame processing is never blocked by disk I/O.

use super::store::CalibrationStore;
use super::tunables::{
    CalibrationState, AREA_SCALE_FACTOR, DETECTION_CONFIDENCE_FLOOR, EMA_ALPHA, FRAME_DELAY_MS,
    FRAME_TIMING_WINDOW, OCR_CROP_PAD_BOT, OCR_CROP_PAD_X, PLATE_VOTE_THRESHOLD_MAX,
    PLATE_VOTE_THRESHOLD_MIN, SPEED_SCALE_FACTOR,
};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{debug, info, warn};

// ============================================================================
// CALIBRATION SOURCE
// ============================================================================

/// Read side of the calibration engine, injected into consumers.
/// Consumers constructed without one use the documented defaults.
pub trait CalibrationSource: Send + Sync {
    fn speed_scale_factor(&self) -> f32;
    fn area_scale_factor(&self) -> f32;
    fn ema_alpha(&self) -> f32;
    fn detection_confidence_floor(&self) -> f32;
    fn frame_delay_ms(&self) -> f64;
    fn plate_vote_threshold(&self) -> u32;
    fn ocr_crop_pad_x(&self) -> f32;
    fn ocr_crop_pad_bot(&self) -> f32;
}

// ============================================================================
// CONSTANTS
// ============================================================================

pub const DEFAULT_CYCLE_EVERY_FRAMES: u64 = 200;

const MIN_SPEED_SAMPLES: u64 = 10;
const MIN_VARIANCE_SAMPLES: usize = 10;
const MIN_OCR_SAMPLES: u64 = 5;
const MIN_DETECTION_SAMPLES: u64 = 50;
const MIN_TIMING_SAMPLES: usize = 20;

/// Speed observations are only trusted above this ground speed
const MIN_VALIDATED_GROUND_KMH: f32 = 10.0;
const MIN_VALIDATED_RELATIVE_KMH: f32 = 1.0;
/// Recent absolute errors kept for the EMA variance check
const RECENT_ERROR_WINDOW: usize = 50;

const MEAN_ERROR_TOLERANCE_KMH: f64 = 5.0;
const SPEED_SCALE_STEP: f64 = 0.01;
const AREA_SCALE_GAIN: f64 = 10.0;

const HIGH_VARIANCE: f64 = 100.0;
const LOW_VARIANCE: f64 = 20.0;
const ALPHA_STEP: f32 = 0.005;

const PLATE_CORRECT_TIGHTEN: f32 = 0.003;
const PLATE_WRONG_WIDEN: f32 = 0.008;

const FRAME_DELAY_HEADROOM_MS: f64 = 100.0;

// ============================================================================
// STATE
// ============================================================================

/// Counters for the current session; merged into the lifetime record at
/// the end of each improvement cycle.
#[derive(Debug, Default, Clone)]
struct SessionAccumulators {
    speed_error_sum: f64,
    speed_error_count: u64,
    recent_abs_errors: VecDeque<f32>,
    ocr_success: u64,
    ocr_total: u64,
    detection_flicker: u64,
    detection_stable: u64,
    frames: u64,
}

struct EngineInner {
    state: CalibrationState,
    session: SessionAccumulators,
    last_detection_count: Option<usize>,
    frames_since_cycle: u64,
}

/// Summary of one improvement cycle, mostly for logging and tests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub speed_adjusted: bool,
    pub alpha_adjusted: bool,
    pub ocr_adjusted: bool,
    pub floor_adjusted: bool,
    pub frame_delay_adjusted: bool,
    pub persisted: bool,
}

pub struct CalibrationEngine {
    inner: Mutex<EngineInner>,
    store: Box<dyn CalibrationStore>,
    persist_lock: Mutex<()>,
    cycle_lock: Mutex<()>,
    cycle_every_frames: u64,
}

impl CalibrationEngine {
    /// Load the persisted record; a missing or unreadable record falls back
    /// to the documented defaults.
    pub fn new(store: Box<dyn CalibrationStore>) -> Self {
        Self::with_cycle_interval(store, DEFAULT_CYCLE_EVERY_FRAMES)
    }

    pub fn with_cycle_interval(store: Box<dyn CalibrationStore>, cycle_every_frames: u64) -> Self {
        let state = match store.load() {
            Ok(Some(mut state)) => {
                state.sanitize();
                info!(
                    "🔧 Calibration loaded: sessions={}, frames={}, speed_scale={:.4}, alpha={:.3}",
                    state.total_sessions,
                    state.total_frames,
                    state.speed_scale_factor,
                    state.ema_alpha
                );
                state
            }
            Ok(None) => {
                info!("🔧 No stored calibration, starting from defaults");
                CalibrationState::default()
            }
            Err(e) => {
                warn!("⚠️ Calibration load failed, using defaults: {:#}", e);
                CalibrationState::default()
            }
        };

        Self {
            inner: Mutex::new(EngineInner {
                state,
                session: SessionAccumulators::default(),
                last_detection_count: Some(0),
                frames_since_cycle: 0,
            }),
            store,
            persist_lock: Mutex::new(()),
            cycle_lock: Mutex::new(()),
            cycle_every_frames: cycle_every_frames.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current calibration record
    pub fn snapshot(&self) -> CalibrationState {
        self.lock().state.clone()
    }

    // ========================================================================
    // FEEDS
    // ========================================================================

    /// Record a speed comparison point. Only accepted when the observer is
    /// moving (ground ≥ 10 km/h) and the relative estimate is non-trivial,
    /// i.e. passing something near-stationary where |relative| ≈ ground.
    pub fn feed_speed_observation(&self, relative_kmh: f32, ground_kmh: f32, target_kmh: f32) {
        if !relative_kmh.is_finite() || !ground_kmh.is_finite() {
            return;
        }
        if ground_kmh < MIN_VALIDATED_GROUND_KMH || relative_kmh.abs() < MIN_VALIDATED_RELATIVE_KMH
        {
            return;
        }
        let error = relative_kmh.abs() - ground_kmh;
        let mut inner = self.lock();
        let session = &mut inner.session;
        session.speed_error_sum += error as f64;
        session.speed_error_count += 1;
        session.recent_abs_errors.push_back(error.abs());
        while session.recent_abs_errors.len() > RECENT_ERROR_WINDOW {
            session.recent_abs_errors.pop_front();
        }
        debug!(
            "🔧 Speed observation: rel={:.1} ground={:.1} target={:.1} err={:+.1}",
            relative_kmh, ground_kmh, target_kmh, error
        );
    }

    /// End-to-end processing latency of one frame
    pub fn feed_frame_timing(&self, elapsed_ms: f64) {
        if !elapsed_ms.is_finite() || elapsed_ms < 0.0 {
            return;
        }
        let mut inner = self.lock();
        let timings = &mut inner.state.frame_timings_ms;
        timings.push(elapsed_ms);
        if timings.len() > FRAME_TIMING_WINDOW {
            let excess = timings.len() - FRAME_TIMING_WINDOW;
            timings.drain(..excess);
        }
    }

    /// A change in detected-object count from the previous call counts as
    /// flicker, anything else as stable. The count before the first frame is 0.
    pub fn feed_detection_stability(&self, count: usize) {
        let mut inner = self.lock();
        match inner.last_detection_count {
            Some(prev) if prev != count => inner.session.detection_flicker += 1,
            Some(_) => inner.session.detection_stable += 1,
            None => {}
        }
        inner.last_detection_count = Some(count);
    }

    pub fn feed_ocr_result(&self, success: bool) {
        let mut inner = self.lock();
        inner.session.ocr_total += 1;
        if success {
            inner.session.ocr_success += 1;
        }
    }

    /// User feedback on a plate read. Applied and persisted immediately.
    pub fn feed_plate_correction(&self, was_correct: bool) {
        {
            let mut inner = self.lock();
            let state = &mut inner.state;
            if was_correct {
                state.ocr_crop_pad_x = (state.ocr_crop_pad_x - PLATE_CORRECT_TIGHTEN)
                    .max(OCR_CROP_PAD_X.min);
                state.ocr_crop_pad_bot = (state.ocr_crop_pad_bot - PLATE_CORRECT_TIGHTEN)
                    .max(OCR_CROP_PAD_BOT.min);
                state.plate_vote_threshold =
                    (state.plate_vote_threshold + 1).min(PLATE_VOTE_THRESHOLD_MAX);
            } else {
                state.ocr_crop_pad_x =
                    (state.ocr_crop_pad_x + PLATE_WRONG_WIDEN).min(OCR_CROP_PAD_X.max);
                state.ocr_crop_pad_bot =
                    (state.ocr_crop_pad_bot + PLATE_WRONG_WIDEN).min(OCR_CROP_PAD_BOT.max);
                state.plate_vote_threshold = state
                    .plate_vote_threshold
                    .saturating_sub(1)
                    .max(PLATE_VOTE_THRESHOLD_MIN);
            }
            info!(
                "🔧 Plate correction (correct={}): pad_x={:.3} pad_bot={:.3} votes={}",
                was_correct, state.ocr_crop_pad_x, state.ocr_crop_pad_bot, state.plate_vote_threshold
            );
        }
        self.persist();
    }

    /// Count one processed frame. Returns true when an improvement cycle is due.
    pub fn record_frame(&self) -> bool {
        let mut inner = self.lock();
        inner.session.frames += 1;
        inner.frames_since_cycle += 1;
        inner.frames_since_cycle >= self.cycle_every_frames
    }

    // ========================================================================
    // IMPROVEMENT CYCLE
    // ========================================================================

    /// Run one improvement cycle and persist. Returns `None` if another
    /// cycle is already in flight.
    pub fn improve_and_persist(&self) -> Option<CycleReport> {
        let _cycle = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("🔧 Improvement cycle already running, skipped");
                return None;
            }
        };
        Some(self.run_cycle())
    }

    /// Final cycle for a stopping session. Waits out any cycle in flight,
    /// then runs one more so observations fed after that cycle's snapshot
    /// are merged and persisted too.
    pub fn flush(&self) -> CycleReport {
        let _cycle = self
            .cycle_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.run_cycle()
    }

    /// Caller holds the cycle lock
    fn run_cycle(&self) -> CycleReport {
        let mut report = {
            let mut inner = self.lock();
            let report = Self::improve(&mut inner);
            Self::merge_session(&mut inner);
            report
        };
        report.persisted = self.persist();
        report
    }

    fn improve(inner: &mut EngineInner) -> CycleReport {
        let mut report = CycleReport::default();
        let session = &inner.session;
        let state = &mut inner.state;

        // ── Speed scale ──
        let speed_count = state.speed_error_count + session.speed_error_count;
        if speed_count >= MIN_SPEED_SAMPLES {
            let mean_error =
                (state.speed_error_sum + session.speed_error_sum) / speed_count as f64;
            if mean_error.abs() > MEAN_ERROR_TOLERANCE_KMH {
                let step = SPEED_SCALE_STEP / (state.total_sessions.max(1) as f64).sqrt();
                let delta = -step * mean_error.signum();
                let before = state.speed_scale_factor;
                state.speed_scale_factor =
                    SPEED_SCALE_FACTOR.clamp(state.speed_scale_factor + delta as f32);
                state.area_scale_factor = AREA_SCALE_FACTOR
                    .clamp(state.area_scale_factor + (delta * AREA_SCALE_GAIN) as f32);
                report.speed_adjusted = true;
                info!(
                    "🔧 [{}] mean err {:+.1} km/h: {:.4} → {:.4} (area {:.3})",
                    SPEED_SCALE_FACTOR.name,
                    mean_error,
                    before,
                    state.speed_scale_factor,
                    state.area_scale_factor
                );
            }
        } else {
            debug!("🔧 [{}] insufficient data ({})", SPEED_SCALE_FACTOR.name, speed_count);
        }

        // ── EMA alpha ──
        if session.recent_abs_errors.len() >= MIN_VARIANCE_SAMPLES {
            let n = session.recent_abs_errors.len() as f64;
            let mean = session.recent_abs_errors.iter().map(|&e| e as f64).sum::<f64>() / n;
            let variance = session
                .recent_abs_errors
                .iter()
                .map(|&e| (e as f64 - mean).powi(2))
                .sum::<f64>()
                / n;
            state.variance_sum += variance;
            state.variance_count += 1;
            let lifetime_variance = state.variance_sum / state.variance_count as f64;

            let before = state.ema_alpha;
            if lifetime_variance > HIGH_VARIANCE {
                state.ema_alpha = EMA_ALPHA.clamp(state.ema_alpha - ALPHA_STEP);
            } else if lifetime_variance < LOW_VARIANCE {
                state.ema_alpha = EMA_ALPHA.clamp(state.ema_alpha + ALPHA_STEP);
            }
            if state.ema_alpha != before {
                report.alpha_adjusted = true;
                info!(
                    "🔧 [{}] variance {:.1}: {:.3} → {:.3}",
                    EMA_ALPHA.name, lifetime_variance, before, state.ema_alpha
                );
            }
        }

        // ── OCR crop padding / vote threshold ──
        let ocr_total = state.ocr_total + session.ocr_total;
        if ocr_total >= MIN_OCR_SAMPLES {
            let hit_rate = (state.ocr_success + session.ocr_success) as f64 / ocr_total as f64;
            if hit_rate < 0.15 {
                state.ocr_crop_pad_x = OCR_CROP_PAD_X.clamp(state.ocr_crop_pad_x + 0.01);
                state.ocr_crop_pad_bot = OCR_CROP_PAD_BOT.clamp(state.ocr_crop_pad_bot + 0.01);
            } else if hit_rate > 0.40 {
                state.ocr_crop_pad_x = OCR_CROP_PAD_X.clamp(state.ocr_crop_pad_x - 0.005);
                state.ocr_crop_pad_bot = OCR_CROP_PAD_BOT.clamp(state.ocr_crop_pad_bot - 0.005);
            }
            if hit_rate > 0.50 {
                state.plate_vote_threshold =
                    (state.plate_vote_threshold + 1).min(PLATE_VOTE_THRESHOLD_MAX);
            } else if hit_rate < 0.10 {
                state.plate_vote_threshold = state
                    .plate_vote_threshold
                    .saturating_sub(1)
                    .max(PLATE_VOTE_THRESHOLD_MIN);
            }
            report.ocr_adjusted = true;
            info!(
                "🔧 [ocr] hit rate {:.0}%: pad_x={:.3} pad_bot={:.3} votes={}",
                hit_rate * 100.0,
                state.ocr_crop_pad_x,
                state.ocr_crop_pad_bot,
                state.plate_vote_threshold
            );
        }

        // ── Detection confidence floor ──
        let flicker = state.detection_flicker + session.detection_flicker;
        let detection_total = flicker + state.detection_stable + session.detection_stable;
        if detection_total >= MIN_DETECTION_SAMPLES {
            let flicker_rate = flicker as f64 / detection_total as f64;
            let before = state.detection_confidence_floor;
            if flicker_rate > 0.40 {
                state.detection_confidence_floor =
                    DETECTION_CONFIDENCE_FLOOR.clamp(state.detection_confidence_floor + 0.02);
            } else if flicker_rate < 0.15 {
                state.detection_confidence_floor =
                    DETECTION_CONFIDENCE_FLOOR.clamp(state.detection_confidence_floor - 0.01);
            }
            if state.detection_confidence_floor != before {
                report.floor_adjusted = true;
                info!(
                    "🔧 [{}] flicker {:.0}%: {:.2} → {:.2}",
                    DETECTION_CONFIDENCE_FLOOR.name,
                    flicker_rate * 100.0,
                    before,
                    state.detection_confidence_floor
                );
            }
        }

        // ── Frame delay ──
        if state.frame_timings_ms.len() >= MIN_TIMING_SAMPLES {
            let p90 = percentile(&state.frame_timings_ms, 0.90);
            let target = FRAME_DELAY_MS.clamp(p90 + FRAME_DELAY_HEADROOM_MS);
            let before = state.frame_delay_ms;
            state.frame_delay_ms = FRAME_DELAY_MS.clamp(before * 0.7 + target * 0.3);
            report.frame_delay_adjusted = true;
            info!(
                "🔧 [{}] p90={:.0}ms target={:.0}ms: {:.0} → {:.0}",
                FRAME_DELAY_MS.name, p90, target, before, state.frame_delay_ms
            );
        }

        report
    }

    fn merge_session(inner: &mut EngineInner) {
        let session = std::mem::take(&mut inner.session);
        let state = &mut inner.state;
        state.speed_error_sum += session.speed_error_sum;
        state.speed_error_count += session.speed_error_count;
        state.ocr_success += session.ocr_success;
        state.ocr_total += session.ocr_total;
        state.detection_flicker += session.detection_flicker;
        state.detection_stable += session.detection_stable;
        state.total_frames += session.frames;
        state.total_sessions += 1;
        inner.frames_since_cycle = 0;
    }

    /// Write the current record. Failures are logged and swallowed.
    fn persist(&self) -> bool {
        let _guard = self
            .persist_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.snapshot();
        match self.store.save(&snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!("⚠️ Calibration persist failed (kept in memory): {:#}", e);
                false
            }
        }
    }

    /// Restore every tunable to its default, zero all accumulators and persist
    pub fn reset_to_defaults(&self) {
        {
            let mut inner = self.lock();
            inner.state = CalibrationState::default();
            inner.session = SessionAccumulators::default();
            inner.last_detection_count = Some(0);
            inner.frames_since_cycle = 0;
        }
        info!("🔧 Calibration reset to defaults");
        self.persist();
    }
}

impl CalibrationSource for CalibrationEngine {
    fn speed_scale_factor(&self) -> f32 {
        self.lock().state.speed_scale_factor
    }

    fn area_scale_factor(&self) -> f32 {
        self.lock().state.area_scale_factor
    }

    fn ema_alpha(&self) -> f32 {
        self.lock().state.ema_alpha
    }

    fn detection_confidence_floor(&self) -> f32 {
        self.lock().state.detection_confidence_floor
    }

    fn frame_delay_ms(&self) -> f64 {
        self.lock().state.frame_delay_ms
    }

    fn plate_vote_threshold(&self) -> u32 {
        self.lock().state.plate_vote_threshold
    }

    fn ocr_crop_pad_x(&self) -> f32 {
        self.lock().state.ocr_crop_pad_x
    }

    fn ocr_crop_pad_bot(&self) -> f32 {
        self.lock().state.ocr_crop_pad_bot
    }
}

/// Nearest-rank percentile, `q` in [0, 1]
fn percentile(samples: &[f64], q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}
