// src/analysis/object_tracker.rs
//
// IoU-based multi-object tracker with an explicit locked target.
//
// Design:
//   - Time-based staleness (ms since last match), not frame counting, because
//     the capture loop is self-pacing and its cadence drifts.
//   - Phase 1 matches the locked target first with a composite score so the
//     measurement subject survives fast motion and partial occlusion.
//   - Phase 2 is greedy IoU, then a same-class centroid rescue whose distance
//     is normalised by object size rather than frame size.
//   - Locked boxes are blended with the previous box to damp detector jitter.

use crate::types::{BoundingBox, Detection};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum IoU (exclusive) to match a detection to an existing track
    pub min_iou: f32,
    /// Maximum size-normalised squared centroid distance for the centroid rescue
    pub max_centroid_distance: f32,
    /// A track unmatched for this long is evicted
    pub stale_ms: f64,
    /// Extended staleness window for the locked target
    pub locked_stale_ms: f64,
    /// New detections beyond this many concurrent tracks are dropped
    pub max_tracks: usize,
    /// Locked-target candidates must score above this
    pub lock_min_score: f32,
    /// Normalised centroid radius inside which the proximity bonus applies
    pub lock_proximity_radius: f32,
    /// Weight kept on the previous box when smoothing the locked target
    pub lock_box_keep: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: 0.15,
            max_centroid_distance: 0.20,
            stale_ms: 2000.0,
            locked_stale_ms: 5000.0,
            max_tracks: 20,
            lock_min_score: 0.15,
            lock_proximity_radius: 0.35,
            lock_box_keep: 0.35,
        }
    }
}

// Locked-target score weights
const LOCK_IOU_WEIGHT: f32 = 2.0;
const LOCK_CLASS_BONUS: f32 = 0.3;
const LOCK_AREA_WEIGHT: f32 = 0.3;
const LOCK_PROXIMITY_WEIGHT: f32 = 0.4;

// ============================================================================
// TYPES
// ============================================================================

/// Opaque tracking identity, unique for the lifetime of the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TrackId(u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct TrackedObject {
    pub tracking_id: TrackId,
    /// Latest matched detection (box smoothed when locked)
    pub detection: Detection,
    pub estimated_speed_kmh: f32,
    pub frame_count: u32,
    pub first_seen_ms: f64,
    pub last_seen_ms: f64,
    pub is_locked: bool,
}

impl TrackedObject {
    fn new(id: TrackId, det: &Detection, timestamp_ms: f64) -> Self {
        Self {
            tracking_id: id,
            detection: det.clone(),
            estimated_speed_kmh: 0.0,
            frame_count: 1,
            first_seen_ms: timestamp_ms,
            last_seen_ms: timestamp_ms,
            is_locked: false,
        }
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.detection.bbox
    }

    /// Time since the last successful match
    pub fn age_ms(&self, now_ms: f64) -> f64 {
        now_ms - self.last_seen_ms
    }

    /// Whether the track was matched on the frame stamped `timestamp_ms`
    pub fn seen_at(&self, timestamp_ms: f64) -> bool {
        self.last_seen_ms == timestamp_ms
    }

    fn refresh(&mut self, det: &Detection, bbox: BoundingBox, timestamp_ms: f64) {
        self.detection = Detection {
            bbox,
            ..det.clone()
        };
        self.frame_count += 1;
        self.last_seen_ms = timestamp_ms;
    }
}

// ============================================================================
// MAIN TRACKER
// ============================================================================

pub struct ObjectTracker {
    pub config: TrackerConfig,
    tracks: Vec<TrackedObject>,
    next_id: u32,
    last_timestamp_ms: f64,
}

impl ObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::with_capacity(32),
            next_id: 1,
            last_timestamp_ms: 0.0,
        }
    }

    /// Process one frame of detections. Returns the current active track set.
    ///
    /// Never fails: degenerate boxes are skipped and an empty frame simply
    /// lets existing tracks age toward eviction.
    pub fn update(&mut self, detections: &[Detection], timestamp_ms: f64) -> &[TrackedObject] {
        let now = if timestamp_ms.is_finite() {
            timestamp_ms
        } else {
            self.last_timestamp_ms
        };
        self.last_timestamp_ms = now;

        self.evict_stale(now);

        let valid: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.bbox.is_valid() && d.confidence.is_finite())
            .collect();
        if valid.len() < detections.len() {
            debug!(
                "Skipped {} malformed detection(s)",
                detections.len() - valid.len()
            );
        }

        let mut matched_tracks: Vec<bool> = vec![false; self.tracks.len()];
        let mut matched_dets: Vec<bool> = vec![false; valid.len()];

        // ════════════════════════════════════════════════════════════════════
        // PHASE 1: LOCKED TARGET
        //
        // Score = 2·IoU + 0.3·class match + 0.3·area similarity
        //         + up to 0.4 proximity bonus (normalised distance < 0.35).
        // Without an acceptable candidate the track keeps its frozen box.
        // ════════════════════════════════════════════════════════════════════
        if let Some(li) = self.tracks.iter().position(|t| t.is_locked) {
            matched_tracks[li] = true;

            let track = &self.tracks[li];
            let mut best: Option<(usize, f32)> = None;
            for (di, det) in valid.iter().enumerate() {
                let score = self.lock_score(track, det);
                if score <= self.config.lock_min_score {
                    continue;
                }
                match best {
                    Some((_, best_score)) if best_score >= score => {}
                    _ => best = Some((di, score)),
                }
            }

            match best {
                Some((di, score)) => {
                    matched_dets[di] = true;
                    let keep = self.config.lock_box_keep;
                    let track = &mut self.tracks[li];
                    let smoothed = track.detection.bbox.blend(&valid[di].bbox, keep);
                    track.refresh(valid[di], smoothed, now);
                    debug!("🔒 Locked {} matched (score={:.2})", track.tracking_id, score);
                }
                None => {
                    debug!(
                        "🔒 Locked {} unmatched, holding last box",
                        self.tracks[li].tracking_id
                    );
                }
            }
        }

        // ════════════════════════════════════════════════════════════════════
        // PHASE 2a: IoU MATCHING
        // ════════════════════════════════════════════════════════════════════
        let mut iou_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            if matched_tracks[ti] {
                continue;
            }
            for (di, det) in valid.iter().enumerate() {
                if matched_dets[di] {
                    continue;
                }
                let score = track.detection.bbox.iou(&det.bbox);
                if score > self.config.min_iou {
                    iou_pairs.push((ti, di, score));
                }
            }
        }
        iou_pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        for (ti, di, _score) in &iou_pairs {
            if matched_tracks[*ti] || matched_dets[*di] {
                continue;
            }
            matched_tracks[*ti] = true;
            matched_dets[*di] = true;
            let bbox = valid[*di].bbox;
            self.tracks[*ti].refresh(valid[*di], bbox, now);
        }

        // ════════════════════════════════════════════════════════════════════
        // PHASE 2b: CENTROID RESCUE
        //
        // Same class only. Squared centroid distance divided by the squared
        // mean (w + h) of both boxes, so the radius scales with the object.
        // ════════════════════════════════════════════════════════════════════
        let mut centroid_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            if matched_tracks[ti] {
                continue;
            }
            for (di, det) in valid.iter().enumerate() {
                if matched_dets[di] || det.class_name != track.detection.class_name {
                    continue;
                }
                let dist = track.detection.bbox.scale_normalized_distance(&det.bbox);
                if dist < self.config.max_centroid_distance {
                    centroid_pairs.push((ti, di, dist));
                }
            }
        }
        centroid_pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        for (ti, di, dist) in &centroid_pairs {
            if matched_tracks[*ti] || matched_dets[*di] {
                continue;
            }
            matched_tracks[*ti] = true;
            matched_dets[*di] = true;
            debug!(
                "🔗 Centroid rescue: {} ↔ det (norm dist={:.3}, class={})",
                self.tracks[*ti].tracking_id, dist, valid[*di].class_name
            );
            let bbox = valid[*di].bbox;
            self.tracks[*ti].refresh(valid[*di], bbox, now);
        }

        // ════════════════════════════════════════════════════════════════════
        // UNMATCHED DETECTIONS → NEW TRACKS
        // ════════════════════════════════════════════════════════════════════
        for (di, matched) in matched_dets.iter().enumerate() {
            if *matched {
                continue;
            }
            if self.tracks.len() >= self.config.max_tracks {
                debug!(
                    "Track cap ({}) reached, dropping detection class={}",
                    self.config.max_tracks, valid[di].class_name
                );
                continue;
            }
            let id = TrackId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            let track = TrackedObject::new(id, valid[di], now);
            info!(
                "🆕 New track {} created: class={}, bbox=[{:.0},{:.0},{:.0},{:.0}]",
                id,
                track.detection.class_name,
                track.detection.bbox.left,
                track.detection.bbox.top,
                track.detection.bbox.right,
                track.detection.bbox.bottom
            );
            self.tracks.push(track);
        }

        &self.tracks
    }

    fn lock_score(&self, track: &TrackedObject, det: &Detection) -> f32 {
        let tb = &track.detection.bbox;
        let iou = tb.iou(&det.bbox);
        let class_bonus = if det.class_name == track.detection.class_name {
            LOCK_CLASS_BONUS
        } else {
            0.0
        };
        let (a, b) = (tb.area(), det.area());
        let area_similarity = if a > 0.0 && b > 0.0 {
            a.min(b) / a.max(b)
        } else {
            0.0
        };
        let dist = tb.scale_normalized_distance(&det.bbox);
        let radius = self.config.lock_proximity_radius;
        let proximity = if dist < radius {
            LOCK_PROXIMITY_WEIGHT * (1.0 - dist / radius)
        } else {
            0.0
        };
        LOCK_IOU_WEIGHT * iou + class_bonus + LOCK_AREA_WEIGHT * area_similarity + proximity
    }

    fn evict_stale(&mut self, now: f64) {
        let stale_ms = self.config.stale_ms;
        let locked_stale_ms = self.config.locked_stale_ms;
        self.tracks.retain(|t| {
            let limit = if t.is_locked { locked_stale_ms } else { stale_ms };
            let age = t.age_ms(now);
            if age >= limit {
                info!(
                    "🗑️  Track {} evicted (unmatched {:.0}ms{})",
                    t.tracking_id,
                    age,
                    if t.is_locked { ", was locked" } else { "" }
                );
                return false;
            }
            true
        });
    }

    // ========================================================================
    // TARGET LOCK
    // ========================================================================

    /// Pin a track as the measurement subject. Any previous lock is released.
    pub fn lock(&mut self, id: TrackId) -> bool {
        if !self.tracks.iter().any(|t| t.tracking_id == id) {
            return false;
        }
        for t in &mut self.tracks {
            t.is_locked = t.tracking_id == id;
        }
        info!("🔒 Target {} locked", id);
        true
    }

    /// Lock the track with the largest area × confidence
    pub fn lock_primary(&mut self) -> Option<TrackId> {
        let id = self
            .tracks
            .iter()
            .max_by(|a, b| {
                let sa = a.detection.area() * a.detection.confidence;
                let sb = b.detection.area() * b.detection.confidence;
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|t| t.tracking_id)?;
        self.lock(id).then_some(id)
    }

    /// Lock `id`, or the primary track when `None`
    pub fn lock_target(&mut self, id: Option<TrackId>) -> Option<TrackId> {
        match id {
            Some(id) => self.lock(id).then_some(id),
            None => self.lock_primary(),
        }
    }

    pub fn unlock(&mut self) {
        for t in &mut self.tracks {
            if t.is_locked {
                info!("🔓 Target {} unlocked", t.tracking_id);
                t.is_locked = false;
            }
        }
    }

    pub fn locked(&self) -> Option<&TrackedObject> {
        self.tracks.iter().find(|t| t.is_locked)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn tracks(&self) -> &[TrackedObject] {
        &self.tracks
    }

    pub fn get(&self, id: TrackId) -> Option<&TrackedObject> {
        self.tracks.iter().find(|t| t.tracking_id == id)
    }

    pub fn active_ids(&self) -> HashSet<TrackId> {
        self.tracks.iter().map(|t| t.tracking_id).collect()
    }

    pub fn set_estimated_speed(&mut self, id: TrackId, speed_kmh: f32) {
        if let Some(t) = self.tracks.iter_mut().find(|t| t.tracking_id == id) {
            t.estimated_speed_kmh = speed_kmh;
        }
    }

    /// Drop all tracks and the lock. Ids keep counting so per-id state held
    /// elsewhere can never alias a new track.
    pub fn reset(&mut self) {
        self.tracks.clear();
    }
}

impl Default for ObjectTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
