//! # Cowstream Core
//!
//! Core library for streaming copy-on-write image chains: flattening the
//! backing layers of an image into its top layer while the image stays in
//! use.
//!
//! ## Modules
//!
//! - `layer`, `file_layer`: image layers and their allocation state
//! - `device`: named virtual disks and their image chains
//! - `chain`: decides which ranges need copying
//! - `ratelimit`: token bucket pacing of copy traffic
//! - `copy`: segment transfers into the top layer
//! - `job`: the streaming job state machine
//! - `registry`: active jobs, one per device, and control operations
//! - `events`: terminal job events and their subscribers
//! - `protocol`, `monitor`: the JSON control protocol
//! - `config`, `settings`: runtime configuration and persistent settings
//! - `error`: error types and result aliases
//!
//! ## Example
//!
//! ```ignore
//! use cowstream_core::{DeviceManifest, EventNotifier, JobRegistry, StreamConfig};
//! use std::sync::Arc;
//!
//! let devices = DeviceManifest::load("devices.toml")?.open_devices()?;
//! let registry = JobRegistry::new(
//!     Arc::new(devices),
//!     Arc::new(EventNotifier::new()),
//!     StreamConfig::default(),
//! );
//!
//! let mut events = registry.subscribe();
//! registry.start("drive0", None, Some(10 * 1024 * 1024))?;
//! let event = events.recv().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod config;
pub mod copy;
pub mod device;
pub mod error;
pub mod events;
pub mod file_layer;
pub mod job;
pub mod layer;
pub mod monitor;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod settings;

pub use chain::{ChainResolver, Segment};
pub use config::{
    parse_size, DeviceEntry, DeviceManifest, StreamConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE,
};
pub use copy::CopyEngine;
pub use device::{Device, DeviceMap, ImageChain};
pub use error::{Error, ErrorClass, Result};
pub use events::{Event, EventKind, EventNotifier, EventStream, JobType};
pub use file_layer::FileLayer;
pub use job::{JobHandle, JobInfo, JobState, JobStatus, StreamJob};
pub use layer::{AllocationMap, Extent, ImageLayer, MemoryLayer};
pub use monitor::Monitor;
pub use protocol::{
    Command, EventMessage, Greeting, Request, Response, BLOCK_JOB_CANCELLED, BLOCK_JOB_COMPLETED,
};
pub use ratelimit::RateLimiter;
pub use registry::JobRegistry;
pub use settings::{MonitorSettings, Settings, SettingsError, StreamSettings};
