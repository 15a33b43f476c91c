// src/types.rs

use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub calibration: CalibrationConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub store_path: String,
    pub cycle_every_frames: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            store_path: "calibration.json".to_string(),
            cycle_every_frames: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub frame_width: f32,
    pub frame_height: f32,
    pub detection_timeout_ms: u64,
    /// Ground-speed samples reporting a worse accuracy (metres) are not fed to calibration
    pub max_ground_accuracy_m: f32,
    pub replay_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_width: 1280.0,
            frame_height: 720.0,
            detection_timeout_ms: 1500,
            max_ground_accuracy_m: 20.0,
            replay_path: "session.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "vehicle_speed=info".to_string(),
        }
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

/// Axis-aligned box in pixel space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) * 0.5,
            (self.top + self.bottom) * 0.5,
        )
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Finite coordinates and a non-zero area
    pub fn is_valid(&self) -> bool {
        [self.left, self.top, self.right, self.bottom]
            .iter()
            .all(|v| v.is_finite())
            && self.area() > 0.0
    }

    /// Intersection over union; 0 for disjoint or degenerate boxes
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.left.max(other.left);
        let y1 = self.top.max(other.top);
        let x2 = self.right.min(other.right);
        let y2 = self.bottom.min(other.bottom);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Squared centroid distance divided by the squared mean of (w + h) of both boxes
    pub fn scale_normalized_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        let dist_sq = (ax - bx).powi(2) + (ay - by).powi(2);
        let avg_size = ((self.width() + self.height()) + (other.width() + other.height())) * 0.5;
        if avg_size <= 0.0 {
            return f32::INFINITY;
        }
        dist_sq / (avg_size * avg_size)
    }

    /// Per-edge blend: `self * keep + other * (1 - keep)`
    pub fn blend(&self, other: &BoundingBox, keep: f32) -> BoundingBox {
        let take = 1.0 - keep;
        BoundingBox {
            left: self.left * keep + other.left * take,
            top: self.top * keep + other.top * take,
            right: self.right * keep + other.right * take,
            bottom: self.bottom * keep + other.bottom * take,
        }
    }
}

// ============================================================================
// DETECTIONS
// ============================================================================

/// One object detection on one frame, as delivered by the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub is_fallback: bool,
}

impl Detection {
    pub fn new(class_id: u32, class_name: &str, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            class_name: class_name.to_string(),
            confidence,
            bbox,
            is_fallback: false,
        }
    }

    pub fn width(&self) -> f32 {
        self.bbox.width()
    }

    pub fn height(&self) -> f32 {
        self.bbox.height()
    }

    pub fn center(&self) -> (f32, f32) {
        self.bbox.center()
    }

    pub fn area(&self) -> f32 {
        self.bbox.area()
    }
}

/// Latest sample from the positioning sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundSpeed {
    pub speed_kmh: f32,
    pub accuracy_m: f32,
}

impl Default for GroundSpeed {
    fn default() -> Self {
        Self {
            speed_kmh: 0.0,
            accuracy_m: f32::INFINITY,
        }
    }
}

/// Plate-recognition outcome. The text is carried, never parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateRead {
    pub text: String,
    pub correct: bool,
}

/// Operator request to change the measurement subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetCommand {
    LockPrimary,
    Unlock,
}
