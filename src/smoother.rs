// src/smoother.rs

use std::collections::VecDeque;

/// Jumps larger than this (km/h) between the median and the smoothed value
/// use the fast alpha so genuine speed changes are not lagged for seconds.
const JUMP_THRESHOLD_KMH: f32 = 20.0;
const FAST_ALPHA: f32 = 0.35;

/// Per-object speed smoother: rolling median window followed by an
/// exponential moving average.
#[derive(Debug, Clone)]
pub struct SpeedSmoother {
    history: VecDeque<f32>,
    window_size: usize,
    smoothed: Option<f32>,
}

impl SpeedSmoother {
    /// Create a new smoother with the given median window size
    ///
    /// # Arguments
    /// * `window_size` - Number of raw samples kept for the median (e.g. 5)
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            history: VecDeque::with_capacity(window_size),
            window_size,
            smoothed: None,
        }
    }

    /// Set the EMA state without touching the median window
    pub fn seed(&mut self, value: f32) {
        self.smoothed = Some(value);
    }

    pub fn smoothed(&self) -> Option<f32> {
        self.smoothed
    }

    /// Push a raw sample and return the new smoothed value
    ///
    /// The median rejects single-frame outliers; the EMA uses `base_alpha`
    /// unless the median jumped by more than 20 km/h.
    pub fn smooth(&mut self, raw: f32, base_alpha: f32) -> f32 {
        self.history.push_back(raw);
        if self.history.len() > self.window_size {
            self.history.pop_front();
        }

        let median = self.median().unwrap_or(raw);
        let next = match self.smoothed {
            None => median,
            Some(prev) => {
                let alpha = if (median - prev).abs() > JUMP_THRESHOLD_KMH {
                    FAST_ALPHA
                } else {
                    base_alpha
                };
                alpha * median + (1.0 - alpha) * prev
            }
        };
        self.smoothed = Some(next);
        next
    }

    /// Scale the smoothed value toward zero (stationary dead-zone)
    pub fn decay(&mut self, factor: f32) -> f32 {
        let next = self.smoothed.unwrap_or(0.0) * factor;
        self.smoothed = Some(next);
        next
    }

    /// Median of the raw window
    pub fn median(&self) -> Option<f32> {
        if self.history.is_empty() {
            return None;
        }
        let mut values: Vec<f32> = self.history.iter().copied().collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(values[values.len() / 2])
    }

    /// Get the number of raw samples currently in the window
    pub fn history_size(&self) -> usize {
        self.history.len()
    }
}
