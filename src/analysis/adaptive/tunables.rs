// src/analysis/adaptive/tunables.rs
//
// Tunable ranges and the persisted calibration record.

use serde::{Deserialize, Serialize};

/// Bounded rolling window of end-to-end frame latencies
pub const FRAME_TIMING_WINDOW: usize = 100;

/// A tunable scalar with its documented default and hard bounds
#[derive(Clone, Copy, Debug)]
pub struct TunableRange {
    pub name: &'static str,
    pub nominal: f32,
    pub min: f32,
    pub max: f32,
}

impl TunableRange {
    pub const fn new(name: &'static str, nominal: f32, min: f32, max: f32) -> Self {
        Self {
            name,
            nominal,
            min,
            max,
        }
    }

    /// Clamp into range; non-finite values fall back to the nominal default
    pub fn clamp(&self, value: f32) -> f32 {
        if !value.is_finite() {
            return self.nominal;
        }
        value.max(self.min).min(self.max)
    }
}

/// Duration tunable (milliseconds)
#[derive(Clone, Copy, Debug)]
pub struct DurationRange {
    pub name: &'static str,
    pub nominal: f64,
    pub min: f64,
    pub max: f64,
}

impl DurationRange {
    pub fn clamp(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return self.nominal;
        }
        value.max(self.min).min(self.max)
    }
}

pub const SPEED_SCALE_FACTOR: TunableRange =
    TunableRange::new("speed_scale_factor", 0.035, 0.015, 0.060);
pub const AREA_SCALE_FACTOR: TunableRange = TunableRange::new("area_scale_factor", 0.8, 0.3, 1.5);
pub const EMA_ALPHA: TunableRange = TunableRange::new("ema_alpha", 0.15, 0.05, 0.30);
pub const DETECTION_CONFIDENCE_FLOOR: TunableRange =
    TunableRange::new("detection_confidence_floor", 0.30, 0.20, 0.55);
pub const OCR_CROP_PAD_X: TunableRange = TunableRange::new("ocr_crop_pad_x", 0.05, 0.02, 0.12);
pub const OCR_CROP_PAD_BOT: TunableRange =
    TunableRange::new("ocr_crop_pad_bot", 0.10, 0.05, 0.18);
pub const FRAME_DELAY_MS: DurationRange = DurationRange {
    name: "frame_delay_ms",
    nominal: 300.0,
    min: 200.0,
    max: 800.0,
};

pub const PLATE_VOTE_THRESHOLD_DEFAULT: u32 = 2;
pub const PLATE_VOTE_THRESHOLD_MIN: u32 = 1;
pub const PLATE_VOTE_THRESHOLD_MAX: u32 = 4;

/// Lifetime calibration record. Serialised as one flat key/value object;
/// keys missing from a stored record take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationState {
    // Tunables
    pub speed_scale_factor: f32,
    pub area_scale_factor: f32,
    pub ema_alpha: f32,
    pub detection_confidence_floor: f32,
    pub frame_delay_ms: f64,
    pub plate_vote_threshold: u32,
    pub ocr_crop_pad_x: f32,
    pub ocr_crop_pad_bot: f32,

    // Lifetime accumulators
    pub speed_error_sum: f64,
    pub speed_error_count: u64,
    pub variance_sum: f64,
    pub variance_count: u64,
    pub ocr_success: u64,
    pub ocr_total: u64,
    pub detection_flicker: u64,
    pub detection_stable: u64,
    pub frame_timings_ms: Vec<f64>,
    pub total_sessions: u64,
    pub total_frames: u64,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            speed_scale_factor: SPEED_SCALE_FACTOR.nominal,
            area_scale_factor: AREA_SCALE_FACTOR.nominal,
            ema_alpha: EMA_ALPHA.nominal,
            detection_confidence_floor: DETECTION_CONFIDENCE_FLOOR.nominal,
            frame_delay_ms: FRAME_DELAY_MS.nominal,
            plate_vote_threshold: PLATE_VOTE_THRESHOLD_DEFAULT,
            ocr_crop_pad_x: OCR_CROP_PAD_X.nominal,
            ocr_crop_pad_bot: OCR_CROP_PAD_BOT.nominal,
            speed_error_sum: 0.0,
            speed_error_count: 0,
            variance_sum: 0.0,
            variance_count: 0,
            ocr_success: 0,
            ocr_total: 0,
            detection_flicker: 0,
            detection_stable: 0,
            frame_timings_ms: Vec::with_capacity(FRAME_TIMING_WINDOW),
            total_sessions: 0,
            total_frames: 0,
        }
    }
}

impl CalibrationState {
    /// Force every tunable back into its range and repair accumulators
    /// read from an older or hand-edited record.
    pub fn sanitize(&mut self) {
        self.speed_scale_factor = SPEED_SCALE_FACTOR.clamp(self.speed_scale_factor);
        self.area_scale_factor = AREA_SCALE_FACTOR.clamp(self.area_scale_factor);
        self.ema_alpha = EMA_ALPHA.clamp(self.ema_alpha);
        self.detection_confidence_floor =
            DETECTION_CONFIDENCE_FLOOR.clamp(self.detection_confidence_floor);
        self.frame_delay_ms = FRAME_DELAY_MS.clamp(self.frame_delay_ms);
        self.plate_vote_threshold = self
            .plate_vote_threshold
            .clamp(PLATE_VOTE_THRESHOLD_MIN, PLATE_VOTE_THRESHOLD_MAX);
        self.ocr_crop_pad_x = OCR_CROP_PAD_X.clamp(self.ocr_crop_pad_x);
        self.ocr_crop_pad_bot = OCR_CROP_PAD_BOT.clamp(self.ocr_crop_pad_bot);

        if !self.speed_error_sum.is_finite() {
            self.speed_error_sum = 0.0;
            self.speed_error_count = 0;
        }
        if !self.variance_sum.is_finite() {
            self.variance_sum = 0.0;
            self.variance_count = 0;
        }
        self.ocr_success = self.ocr_success.min(self.ocr_total);
        self.frame_timings_ms.retain(|t| t.is_finite() && *t >= 0.0);
        if self.frame_timings_ms.len() > FRAME_TIMING_WINDOW {
            let excess = self.frame_timings_ms.len() - FRAME_TIMING_WINDOW;
            self.frame_timings_ms.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_respects_range_and_nan() {
        assert_eq!(EMA_ALPHA.clamp(0.9), 0.30);
        assert_eq!(EMA_ALPHA.clamp(0.0), 0.05);
        assert_eq!(EMA_ALPHA.clamp(f32::NAN), 0.15);
        assert_eq!(FRAME_DELAY_MS.clamp(50.0), 200.0);
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let state: CalibrationState =
            serde_json::from_str(r#"{"speed_scale_factor": 0.04, "total_sessions": 7}"#).unwrap();
        assert_eq!(state.speed_scale_factor, 0.04);
        assert_eq!(state.total_sessions, 7);
        assert_eq!(state.area_scale_factor, 0.8);
        assert_eq!(state.plate_vote_threshold, 2);
        assert_eq!(state.frame_delay_ms, 300.0);
    }

    #[test]
    fn test_sanitize_repairs_out_of_range_record() {
        let mut state = CalibrationState {
            speed_scale_factor: 1.0,
            plate_vote_threshold: 9,
            ocr_crop_pad_x: -1.0,
            ocr_success: 10,
            ocr_total: 4,
            frame_timings_ms: vec![100.0; 150],
            ..CalibrationState::default()
        };
        state.sanitize();
        assert_eq!(state.speed_scale_factor, 0.060);
        assert_eq!(state.plate_vote_threshold, 4);
        assert_eq!(state.ocr_crop_pad_x, 0.02);
        assert_eq!(state.ocr_success, 4);
        assert_eq!(state.frame_timings_ms.len(), FRAME_TIMING_WINDOW);
    }
}
