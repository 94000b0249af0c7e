//! Configuration for Cowstream operations

use crate::device::{Device, DeviceMap, ImageChain};
use crate::error::{Error, Result};
use crate::file_layer::FileLayer;
use crate::layer::ImageLayer;
use crate::ratelimit::DEFAULT_SLICE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default amount of data a job copies per segment (512 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Minimum chunk size (4 KB)
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Maximum chunk size (64 MB)
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Runtime configuration for streaming jobs
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Upper bound on the bytes handled per segment
    pub chunk_size: usize,

    /// Speed applied when `block-stream` gives none (bytes/s, 0 = unlimited)
    pub default_speed: u64,

    /// Burst window of the rate limiter
    pub burst: Duration,

    /// Drop streamed intermediate layers from the device's chain on completion
    pub rewrite_chain: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_speed: 0,
            burst: DEFAULT_SLICE,
            rewrite_chain: true,
        }
    }
}

impl StreamConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set chunk size (clamped to valid range)
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self
    }

    /// Set the default speed
    pub fn default_speed(mut self, speed: u64) -> Self {
        self.default_speed = speed;
        self
    }

    /// Set the rate limiter burst window
    pub fn burst(mut self, burst: Duration) -> Self {
        self.burst = burst;
        self
    }

    /// Set whether the chain is rewritten on completion
    pub fn rewrite_chain(mut self, rewrite: bool) -> Self {
        self.rewrite_chain = rewrite;
        self
    }
}

/// Parse a human size such as `512K`, `4M` or `1G` into bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let s = s.strip_suffix('B').unwrap_or(&s);

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else {
        (s, 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidConfig(format!("size too large: {}", s)))
}

/// Device definitions loaded from a TOML manifest
///
/// ```toml
/// [[device]]
/// name = "drive0"
/// layers = ["top.img", "mid.img", "base.img"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceManifest {
    /// Devices, each with its chain of layer files ordered top first
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceEntry>,
}

/// One device in a manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Device identifier
    pub name: String,

    /// Layer files, top first
    pub layers: Vec<PathBuf>,
}

impl DeviceManifest {
    /// Parse a manifest from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::InvalidConfig(format!("invalid device manifest: {}", e)))
    }

    /// Load a manifest file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut manifest = Self::from_toml(&contents)?;

        // Relative layer paths are relative to the manifest
        if let Some(dir) = path.parent() {
            for entry in &mut manifest.devices {
                for layer in &mut entry.layers {
                    if layer.is_relative() {
                        *layer = dir.join(&*layer);
                    }
                }
            }
        }

        Ok(manifest)
    }

    /// Open every layer file and build the device table
    pub fn open_devices(&self) -> Result<DeviceMap> {
        let devices = DeviceMap::new();
        for entry in &self.devices {
            let layers = entry
                .layers
                .iter()
                .map(|path| FileLayer::open(path).map(|l| Arc::new(l) as Arc<dyn ImageLayer>))
                .collect::<Result<Vec<_>>>()?;
            let chain = ImageChain::new(layers)?;
            tracing::debug!("Opened device {} with chain {:?}", entry.name, chain);
            devices.insert(Device::new(entry.name.clone(), chain))?;
        }
        Ok(devices)
    }
}
