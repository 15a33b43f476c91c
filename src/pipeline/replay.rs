// src/pipeline/replay.rs
//
// Recorded sessions, one JSON object per line:
//
//   {"frame_id":1,"timestamp_ms":300.0,"ground_speed_kmh":42.0,"ground_accuracy_m":4.0,
//    "detections":[{"class_id":2,"class_name":"car","confidence":0.8,
//                   "bbox":{"left":100,"top":100,"right":200,"bottom":160}}],
//    "plate_read":{"text":"ABC123","correct":true},"target":"lock_primary"}
//
// Blank lines and lines starting with '#' are skipped.

use super::runner::{CapturedFrame, Detector, FrameSource};
use crate::types::{Detection, GroundSpeed, PlateRead, TargetCommand};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayRecord {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    #[serde(default)]
    pub width: Option<f32>,
    #[serde(default)]
    pub height: Option<f32>,
    #[serde(default)]
    pub ground_speed_kmh: f32,
    /// Absent means the sensor gave no accuracy figure
    #[serde(default)]
    pub ground_accuracy_m: Option<f32>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub plate_read: Option<PlateRead>,
    #[serde(default)]
    pub target: Option<TargetCommand>,
}

impl ReplayRecord {
    fn captured(&self) -> CapturedFrame {
        CapturedFrame {
            frame_id: self.frame_id,
            timestamp_ms: self.timestamp_ms,
            width: self.width,
            height: self.height,
            ground: GroundSpeed {
                speed_kmh: self.ground_speed_kmh,
                accuracy_m: self.ground_accuracy_m.unwrap_or(f32::INFINITY),
            },
            plate_read: self.plate_read.clone(),
            target: self.target,
        }
    }
}

pub fn parse_recording(contents: &str) -> Result<Vec<ReplayRecord>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str(line).with_context(|| format!("recording line {}", idx + 1))
        })
        .collect()
}

pub fn load_recording(path: impl AsRef<Path>) -> Result<Vec<ReplayRecord>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading recording {}", path.display()))?;
    let records = parse_recording(&contents)?;
    info!("📼 Loaded {} recorded frames from {}", records.len(), path.display());
    Ok(records)
}

/// Split a recording into the frame source and the detector that answers
/// for its frames
pub fn split(records: Vec<ReplayRecord>) -> (ReplaySource, ReplayDetector) {
    let frames = records.iter().map(ReplayRecord::captured).collect();
    let detections = records
        .into_iter()
        .map(|r| (r.frame_id, r.detections))
        .collect();
    (ReplaySource { frames }, ReplayDetector { detections })
}

pub struct ReplaySource {
    frames: VecDeque<CapturedFrame>,
}

impl ReplaySource {
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        Ok(self.frames.pop_front())
    }
}

pub struct ReplayDetector {
    detections: HashMap<u64, Vec<Detection>>,
}

impl Detector for ReplayDetector {
    fn detect(&self, frame: &CapturedFrame) -> Result<Vec<Detection>> {
        self.detections
            .get(&frame.frame_id)
            .cloned()
            .ok_or_else(|| anyhow!("no recorded detections for frame {}", frame.frame_id))
    }
}
