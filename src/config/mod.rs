// Configuration module for camera-recorder
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use types::*;
pub use loader::ConfigLoader;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config);
    ConfigLoader::validate(&config).context("Invalid configuration after environment overrides")?;
    Ok(config)
}

/// Allow environment variables to override config values
pub fn apply_env_overrides(config: &mut RecorderConfig) {
    if let Ok(device) = std::env::var("CAMERA_DEVICE") {
        config.camera.device = device;
    }

    if let Ok(dir) = std::env::var("SEGMENT_DIR") {
        config.recorder.segment_dir = dir;
    }

    if let Ok(dir) = std::env::var("SNAPSHOT_DIR") {
        config.detector.snapshot_dir = dir;
    }
}
