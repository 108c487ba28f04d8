// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use camera_recorder::config::{load_config_with_env, ConfigLoader, LoggingConfig};
use camera_recorder::Pipeline;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Camera Recorder - continuous recording with anomaly snapshots
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Capture device (overrides config file)
    #[arg(short, long)]
    device: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = FmtSubscriber::builder().with_env_filter(filter);
    match logging.format.as_str() {
        "json" => tracing::subscriber::set_global_default(builder.json().finish())?,
        _ => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let mut config = load_config_with_env(&args.config)?;

    // Apply CLI overrides
    if let Some(device) = args.device {
        config.camera.device = device;
        ConfigLoader::validate(&config).context("Invalid --device override")?;
    }

    init_tracing(&config.logging)?;

    info!("Starting Camera Recorder");
    info!("Loaded configuration from: {:?}", args.config);
    info!("Capture device: {}", config.camera.device);
    info!(
        "Segments: {} ({}s each), snapshots: {}",
        config.recorder.segment_dir,
        config.recorder.segment_duration_seconds,
        if config.detector.enabled {
            config.detector.snapshot_dir.as_str()
        } else {
            "disabled"
        }
    );

    let pipeline = Pipeline::start(&config)
        .await
        .context("Failed to start pipeline")?;
    info!("Pipeline running (run id {})", pipeline.run_id());

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                shutdown.trigger();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    match pipeline.wait().await {
        Ok(()) => {
            info!("Camera Recorder shut down successfully");
            Ok(())
        }
        Err(e) => {
            error!("Camera Recorder stopped on fatal error: {}", e);
            Err(e.into())
        }
    }
}
