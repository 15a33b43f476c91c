// src/analysis/adaptive/store.rs
//
// Persistence for the calibration record. The engine treats every error
// returned here as non-fatal.

use super::tunables::CalibrationState;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub trait CalibrationStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet
    fn load(&self) -> Result<Option<CalibrationState>>;
    fn save(&self, state: &CalibrationState) -> Result<()>;
}

// ============================================================================
// JSON FILE
// ============================================================================

/// Flat JSON object on disk, replaced atomically via a sibling temp file
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationStore for JsonFileStore {
    fn load(&self) -> Result<Option<CalibrationState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let state: CalibrationState = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(state))
    }

    fn save(&self, state: &CalibrationState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        debug!("💾 Calibration written to {}", self.path.display());
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY
// ============================================================================

/// Process-local store for dry runs and tests
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Option<CalibrationState>>,
    fail: AtomicBool,
    saves: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: CalibrationState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    /// Make every subsequent load/save fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn stored(&self) -> Option<CalibrationState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> u64 {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CalibrationStore for MemoryStore {
    fn load(&self) -> Result<Option<CalibrationState>> {
        if self.fail.load(Ordering::Relaxed) {
            bail!("memory store configured to fail");
        }
        Ok(self.stored())
    }

    fn save(&self, state: &CalibrationState) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            bail!("memory store configured to fail");
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "vehicle-speed-{}-{}-{}.json",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ))
    }

    #[test]
    fn test_json_store_missing_file_loads_none() {
        let store = JsonFileStore::new(temp_path("missing"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_json_store_persists_flat_record() {
        let path = temp_path("flat");
        let store = JsonFileStore::new(&path);
        let state = CalibrationState {
            speed_scale_factor: 0.041,
            total_frames: 1234,
            ..CalibrationState::default()
        };
        store.save(&state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let obj = raw.as_object().expect("record should be a flat object");
        assert!(obj.contains_key("speed_scale_factor"));
        assert!(obj.contains_key("plate_vote_threshold"));
        assert!(obj.contains_key("detection_flicker"));

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let path = temp_path("garbage");
        fs::write(&path, "not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(store.load().is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_memory_store_failure_switch() {
        let store = MemoryStore::new();
        store.save(&CalibrationState::default()).unwrap();
        assert_eq!(store.save_count(), 1);
        store.set_failing(true);
        assert!(store.save(&CalibrationState::default()).is_err());
        assert!(store.load().is_err());
        assert_eq!(store.save_count(), 1);
    }
}
