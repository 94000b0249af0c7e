//! Copy engine: moves one segment from a backing layer into the top layer

use crate::chain::{ChainResolver, Segment};
use crate::error::{Error, Result};
use crate::layer::ImageLayer;
use std::sync::Arc;

/// Executes segment transfers on the blocking thread pool
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyEngine;

impl CopyEngine {
    /// Create a copy engine
    pub fn new() -> Self {
        Self
    }

    /// Copy `segment` into the top layer of the resolver's chain.
    ///
    /// Returns the number of bytes written to the top layer. Segments that
    /// need no copy return 0 without touching any layer.
    pub async fn copy(&self, resolver: &ChainResolver, segment: Segment) -> Result<u64> {
        let Some(source) = segment.source else {
            return Ok(0);
        };

        let source = Arc::clone(resolver.layer(source));
        let top = Arc::clone(resolver.chain().top());

        tokio::task::spawn_blocking(move || copy_segment(source.as_ref(), top.as_ref(), segment))
            .await
            .map_err(|e| Error::Storage(format!("copy task failed: {}", e)))?
    }
}

/// Read `segment` from `source` and write it into `top`.
///
/// Sub-ranges that a concurrent writer has allocated in `top` since the
/// segment was resolved are left alone.
pub fn copy_segment(source: &dyn ImageLayer, top: &dyn ImageLayer, segment: Segment) -> Result<u64> {
    let mut buffer = vec![0u8; segment.len as usize];
    source.read_at(segment.offset, &mut buffer)?;
    top.fill_unallocated(segment.offset, &buffer)
}
