//! CLI command implementations

pub mod config;
pub mod layer;
pub mod map;
pub mod serve;
pub mod stream;

use anyhow::{Context, Result};
use cowstream_core::{DeviceManifest, EventNotifier, JobRegistry, Settings};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Load the settings file, falling back to the default location
fn load_settings(config_file: Option<PathBuf>) -> Settings {
    Settings::load_from_path(config_file.or_else(Settings::config_path))
}

/// Open the devices listed in `manifest` and build a registry over them
fn open_registry(manifest: &Path, settings: &Settings) -> Result<JobRegistry> {
    let config = settings
        .to_stream_config()
        .context("Invalid stream settings")?;
    let devices = DeviceManifest::load(manifest)
        .with_context(|| format!("Failed to load manifest {}", manifest.display()))?
        .open_devices()
        .context("Failed to open image chains")?;

    tracing::debug!("Opened devices: {:?}", devices.names());
    Ok(JobRegistry::new(
        Arc::new(devices),
        Arc::new(EventNotifier::new()),
        config,
    ))
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Resolve once the Ctrl+C handler has cleared `running`
async fn interrupted(running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
