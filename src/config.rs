// src/config.rs

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let yaml = "calibration:\n  store_path: /tmp/cal.json\nsession:\n  frame_width: 1920\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.calibration.store_path, "/tmp/cal.json");
        assert_eq!(config.calibration.cycle_every_frames, 200);
        assert_eq!(config.session.frame_width, 1920.0);
        assert_eq!(config.session.frame_height, 720.0);
        assert_eq!(config.session.detection_timeout_ms, 1500);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load("/definitely/not/here/config.yaml").is_err());
    }
}
