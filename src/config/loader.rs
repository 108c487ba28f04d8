// Configuration loader with environment variable substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub struct ConfigLoader;

/// Upper bound for `detector.cooldown_seconds` (one day)
pub const MAX_COOLDOWN_SECONDS: f64 = 86_400.0;

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}").expect("static pattern is valid")
    })
}

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<RecorderConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn parse(content: &str) -> Result<RecorderConfig> {
        let content = Self::substitute_env_vars(content);

        let config: RecorderConfig =
            serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${CAMERA_DEVICE:-stub://camera0} -> stub://camera0 (if CAMERA_DEVICE not set)
    fn substitute_env_vars(content: &str) -> String {
        env_pattern()
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match std::env::var(var_name) {
                    Ok(value) => value,
                    Err(_) => match default_value {
                        Some(default) => default.to_string(),
                        // Keep original if no default and var not found
                        None => format!("${{{}}}", var_name),
                    },
                }
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(config: &RecorderConfig) -> Result<()> {
        let camera = &config.camera;
        if camera.device.trim().is_empty() {
            bail!("camera.device cannot be empty");
        }
        if camera.width == 0 || camera.height == 0 {
            bail!("camera.width and camera.height must be > 0");
        }
        if camera.frame_rate == 0 || camera.frame_rate > 240 {
            bail!("camera.frame_rate must be 1-240");
        }
        if camera.capture_timeout_ms == 0 {
            bail!("camera.capture_timeout_ms must be > 0");
        }
        if camera.max_consecutive_failures == 0 {
            bail!("camera.max_consecutive_failures must be > 0");
        }

        let bus = &config.bus;
        if bus.subscriber_queue_depth == 0
            || bus.recorder_queue_depth == 0
            || bus.detector_queue_depth == 0
        {
            bail!("bus queue depths must be > 0");
        }
        if bus.recorder_queue_depth < bus.subscriber_queue_depth {
            bail!("bus.recorder_queue_depth must be >= bus.subscriber_queue_depth");
        }

        let recorder = &config.recorder;
        if recorder.segment_dir.trim().is_empty() {
            bail!("recorder.segment_dir cannot be empty");
        }
        if recorder.segment_duration_seconds == 0 {
            bail!("recorder.segment_duration_seconds must be > 0");
        }
        if recorder.jpeg_quality == 0 || recorder.jpeg_quality > 100 {
            bail!("recorder.jpeg_quality must be 1-100");
        }
        if recorder.compression.level > 4 {
            bail!("recorder.compression.level must be 0-4");
        }
        if recorder.max_consecutive_write_failures == 0 {
            bail!("recorder.max_consecutive_write_failures must be > 0");
        }

        let detector = &config.detector;
        if detector.enabled {
            if detector.snapshot_dir.trim().is_empty() {
                bail!("detector.snapshot_dir cannot be empty");
            }
            if detector.snapshot_dir == recorder.segment_dir {
                bail!("detector.snapshot_dir must differ from recorder.segment_dir");
            }
            if !(detector.threshold > 0.0 && detector.threshold <= 1.0) {
                bail!("detector.threshold must be in (0, 1]");
            }
            if !(detector.baseline_refresh_rate > 0.0 && detector.baseline_refresh_rate <= 1.0) {
                bail!("detector.baseline_refresh_rate must be in (0, 1]");
            }
            if !(0.0..=MAX_COOLDOWN_SECONDS).contains(&detector.cooldown_seconds) {
                bail!(
                    "detector.cooldown_seconds must be between 0 and {}",
                    MAX_COOLDOWN_SECONDS
                );
            }
            if detector.grid_width == 0 || detector.grid_height == 0 {
                bail!("detector grid dimensions must be > 0");
            }
            if detector.snapshot_quality == 0 || detector.snapshot_quality > 100 {
                bail!("detector.snapshot_quality must be 1-100");
            }
            if detector.max_consecutive_write_failures == 0 {
                bail!("detector.max_consecutive_write_failures must be > 0");
            }
        }

        let live = &config.live;
        if live.enhance_low_light && !(live.gamma > 0.0 && live.gamma <= 10.0) {
            bail!("live.gamma must be in (0, 10]");
        }

        let retention = &config.retention;
        if retention.scan_interval_seconds == 0 {
            bail!("retention.scan_interval_seconds must be > 0");
        }
        for (name, policy) in [
            ("segments", &retention.segments),
            ("snapshots", &retention.snapshots),
        ] {
            if policy.max_count == Some(0) {
                bail!("retention.{}.max_count must be > 0 when set", name);
            }
            if policy.max_age_seconds == Some(0) {
                bail!("retention.{}.max_age_seconds must be > 0 when set", name);
            }
        }

        if config.shutdown.grace_period_seconds == 0 {
            bail!("shutdown.grace_period_seconds must be > 0");
        }

        match config.logging.format.as_str() {
            "text" | "json" => {}
            unknown => bail!("Unknown logging.format: '{}'. Supported: text, json", unknown),
        }

        Ok(())
    }
}
