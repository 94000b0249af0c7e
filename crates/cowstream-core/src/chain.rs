//! Chain resolution for streaming
//!
//! Decides, range by range, whether the top layer already has data, whether
//! a layer above the base has to supply it, or whether nothing needs copying
//! because the data (if any) lives at or below the base.

use crate::device::ImageChain;
use crate::error::{Error, Result};
use crate::layer::ImageLayer;
use std::ops::Range;
use std::sync::Arc;

/// A contiguous run of the image with a single copy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Start offset
    pub offset: u64,

    /// Length in bytes
    pub len: u64,

    /// Index in the chain of the layer that supplies the data, or `None`
    /// when the run needs no copying
    pub source: Option<usize>,
}

impl Segment {
    /// Whether the segment must be copied into the top layer
    pub fn needs_copy(&self) -> bool {
        self.source.is_some()
    }

    /// Offset one past the end of the segment
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Walks a chain snapshot and reports what has to be copied into its top
#[derive(Debug, Clone)]
pub struct ChainResolver {
    chain: ImageChain,
    base: Option<usize>,
}

impl ChainResolver {
    /// Create a resolver for `chain`, stopping at the layer named `base`.
    ///
    /// `base` must name a layer strictly below the top; `None` copies the
    /// whole chain.
    pub fn new(device: &str, chain: ImageChain, base: Option<&str>) -> Result<Self> {
        let base = match base {
            None => None,
            Some(name) => match chain.position(name) {
                Some(idx) if idx > 0 => Some(idx),
                _ => {
                    return Err(Error::InvalidBase {
                        device: device.to_string(),
                        base: name.to_string(),
                    })
                }
            },
        };
        Ok(Self { chain, base })
    }

    /// The chain being resolved
    pub fn chain(&self) -> &ImageChain {
        &self.chain
    }

    /// Index of the base layer, if any
    pub fn base(&self) -> Option<usize> {
        self.base
    }

    /// Name of the base layer, if any
    pub fn base_name(&self) -> Option<&str> {
        self.base.map(|idx| self.chain.layers()[idx].name())
    }

    /// Total logical length of the image
    pub fn len(&self) -> u64 {
        self.chain.len()
    }

    /// Whether the image has zero length
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Layers that may supply data: strictly below the top, strictly above the base
    fn sources(&self) -> &[Arc<dyn ImageLayer>] {
        let end = self.base.unwrap_or(self.chain.depth());
        &self.chain.layers()[1..end]
    }

    /// The layer at `index` in the chain
    pub fn layer(&self, index: usize) -> &Arc<dyn ImageLayer> {
        &self.chain.layers()[index]
    }

    /// Next segment starting at `cursor`, at most `max_len` bytes long.
    ///
    /// Returns `None` once `cursor` reaches the end of the image.
    pub fn next_segment(&self, cursor: u64, max_len: u64) -> Result<Option<Segment>> {
        let len = self.len();
        if cursor >= len || max_len == 0 {
            return Ok(None);
        }

        let mut run = max_len.min(len - cursor);

        let top = self.chain.top().block_status(cursor, run)?;
        if top.allocated {
            return Ok(Some(Segment {
                offset: cursor,
                len: top.len,
                source: None,
            }));
        }
        run = run.min(top.len);

        for (i, layer) in self.sources().iter().enumerate() {
            let extent = layer.block_status(cursor, run)?;
            if extent.allocated {
                return Ok(Some(Segment {
                    offset: cursor,
                    len: extent.len,
                    source: Some(i + 1),
                }));
            }
            run = run.min(extent.len);
        }

        Ok(Some(Segment {
            offset: cursor,
            len: run,
            source: None,
        }))
    }

    /// Whether any byte of `range` must be copied into the top layer
    pub fn needs_copy(&self, range: Range<u64>) -> Result<bool> {
        let end = range.end.min(self.len());
        let mut cursor = range.start;
        while cursor < end {
            match self.next_segment(cursor, end - cursor)? {
                Some(segment) if segment.needs_copy() => return Ok(true),
                Some(segment) => cursor = segment.end(),
                None => break,
            }
        }
        Ok(false)
    }
}
