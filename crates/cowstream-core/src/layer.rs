//! Image layers and their allocation state
//!
//! A layer maps logical byte offsets either to data it holds itself or to
//! "not here", in which case the next layer down the chain is consulted.
//! The on-disk format behind a layer is not this crate's concern; anything
//! implementing [`ImageLayer`] can sit in a chain.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// Allocation state of a run of bytes starting at a queried offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Whether the layer holds data for the run
    pub allocated: bool,

    /// Length of the run in bytes
    pub len: u64,
}

/// One layer of a copy-on-write image chain
pub trait ImageLayer: Send + Sync + fmt::Debug {
    /// Name used to refer to the layer (e.g. as a `base` argument)
    fn name(&self) -> &str;

    /// Logical length of the layer in bytes
    fn len(&self) -> u64;

    /// Whether the layer has zero length
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Report the allocation state of the longest run starting at `offset`,
    /// capped at `max_len`.
    ///
    /// Offsets at or past the end of the layer report an unallocated run of
    /// `max_len` bytes, so a short layer never holds data for the tail of a
    /// longer image.
    fn block_status(&self, offset: u64, max_len: u64) -> Result<Extent>;

    /// Read `buf.len()` bytes starting at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset` and mark the range allocated.
    ///
    /// Readers never observe a partially applied call.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Write only the parts of `data` whose range is still unallocated,
    /// returning the number of bytes written.
    ///
    /// Bytes a concurrent writer allocated first are left alone. Layers that
    /// hold a lock across the check and the write override this.
    fn fill_unallocated(&self, offset: u64, data: &[u8]) -> Result<u64> {
        let mut written = 0u64;
        for (start, end) in self.unallocated_runs(offset, data.len() as u64)? {
            self.write_at(offset + start, &data[start as usize..end as usize])?;
            written += end - start;
        }
        Ok(written)
    }

    /// Unallocated runs of `offset..offset + len`, relative to `offset`
    fn unallocated_runs(&self, offset: u64, len: u64) -> Result<Vec<(u64, u64)>> {
        let mut runs = Vec::new();
        let mut pos = 0u64;
        while pos < len {
            let extent = self.block_status(offset + pos, len - pos)?;
            let run = extent.len.clamp(1, len - pos);
            if !extent.allocated {
                runs.push((pos, pos + run));
            }
            pos += run;
        }
        Ok(runs)
    }

    /// Persist any buffered state
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// All allocated ranges as `(start, end)` pairs in ascending order
    fn allocated_extents(&self) -> Result<Vec<(u64, u64)>>;
}

/// Byte-granular set of allocated ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationMap {
    // start -> end (exclusive); entries never overlap or touch
    extents: BTreeMap<u64, u64>,
}

impl AllocationMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from `(start, end)` pairs in any order
    pub fn from_extents<I>(extents: I) -> Self
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut map = Self::new();
        for (start, end) in extents {
            map.insert(start, end);
        }
        map
    }

    /// Mark `start..end` as allocated
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let mut new_start = start;
        let mut new_end = end;

        if let Some((&s, &e)) = self.extents.range(..=start).next_back() {
            if e >= start {
                new_start = s;
                new_end = new_end.max(e);
                self.extents.remove(&s);
            }
        }

        let absorbed: Vec<u64> = self
            .extents
            .range(start..=new_end)
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.extents.remove(&s) {
                new_end = new_end.max(e);
            }
        }

        self.extents.insert(new_start, new_end);
    }

    /// Allocation state of the run starting at `offset`, capped at `max_len`
    pub fn status(&self, offset: u64, max_len: u64) -> Extent {
        let limit = offset.saturating_add(max_len);

        if let Some((_, &e)) = self.extents.range(..=offset).next_back() {
            if e > offset {
                return Extent {
                    allocated: true,
                    len: e.min(limit) - offset,
                };
            }
        }

        let next = self
            .extents
            .range(offset..)
            .next()
            .map_or(limit, |(&s, _)| s.min(limit));

        Extent {
            allocated: false,
            len: next - offset,
        }
    }

    /// Iterate allocated ranges in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.extents.iter().map(|(&s, &e)| (s, e))
    }

    /// Total number of allocated bytes
    pub fn allocated_bytes(&self) -> u64 {
        self.iter().map(|(s, e)| e - s).sum()
    }

    /// Whether nothing is allocated
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}

/// Check that `offset..offset + len` lies within `size`
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfRange { offset, len, size }),
    }
}

/// Shared implementation of [`ImageLayer::block_status`] over an allocation map
pub(crate) fn status_within(map: &AllocationMap, size: u64, offset: u64, max_len: u64) -> Extent {
    if offset >= size {
        return Extent {
            allocated: false,
            len: max_len,
        };
    }

    let inside = max_len.min(size - offset);
    let extent = map.status(offset, inside);
    if !extent.allocated && extent.len == inside {
        // The unallocated run continues past the end of the layer.
        return Extent {
            allocated: false,
            len: max_len,
        };
    }
    extent
}

/// Unallocated runs of `offset..offset + len` in `map`, relative to `offset`
pub(crate) fn holes(map: &AllocationMap, offset: u64, len: u64) -> Vec<(u64, u64)> {
    let mut runs = Vec::new();
    let mut pos = 0u64;
    while pos < len {
        let extent = map.status(offset + pos, len - pos);
        let run = extent.len.clamp(1, len - pos);
        if !extent.allocated {
            runs.push((pos, pos + run));
        }
        pos += run;
    }
    runs
}

/// Layer held entirely in memory
pub struct MemoryLayer {
    name: String,
    len: u64,
    state: RwLock<MemoryState>,
}

struct MemoryState {
    data: Vec<u8>,
    map: AllocationMap,
}

impl MemoryLayer {
    /// Create an empty (fully unallocated) layer of `len` bytes
    pub fn new(name: impl Into<String>, len: u64) -> Self {
        Self {
            name: name.into(),
            len,
            state: RwLock::new(MemoryState {
                data: vec![0u8; len as usize],
                map: AllocationMap::new(),
            }),
        }
    }

    /// Create a fully allocated layer holding `data`
    pub fn with_data(name: impl Into<String>, data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        let mut map = AllocationMap::new();
        map.insert(0, len);
        Self {
            name: name.into(),
            len,
            state: RwLock::new(MemoryState { data, map }),
        }
    }

    /// Total number of allocated bytes
    pub fn allocated_bytes(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map
            .allocated_bytes()
    }
}

impl fmt::Debug for MemoryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLayer")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl ImageLayer for MemoryLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn block_status(&self, offset: u64, max_len: u64) -> Result<Extent> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(status_within(&state.map, self.len, offset, max_len))
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len() as u64, self.len)?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        buf.copy_from_slice(&state.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len() as u64, self.len)?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        state.data[start..start + data.len()].copy_from_slice(data);
        state.map.insert(offset, offset + data.len() as u64);
        Ok(())
    }

    fn fill_unallocated(&self, offset: u64, data: &[u8]) -> Result<u64> {
        check_range(offset, data.len() as u64, self.len)?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut written = 0u64;
        for (start, end) in holes(&state.map, offset, data.len() as u64) {
            let at = (offset + start) as usize;
            state.data[at..at + (end - start) as usize]
                .copy_from_slice(&data[start as usize..end as usize]);
            state.map.insert(offset + start, offset + end);
            written += end - start;
        }
        Ok(written)
    }

    fn allocated_extents(&self) -> Result<Vec<(u64, u64)>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.map.iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_map_empty() {
        let map = AllocationMap::new();
        assert!(map.is_empty());
        assert_eq!(
            map.status(0, 100),
            Extent {
                allocated: false,
                len: 100
            }
        );
    }

    #[test]
    fn test_allocation_map_merges_adjacent() {
        let mut map = AllocationMap::new();
        map.insert(0, 10);
        map.insert(10, 20);
        map.insert(30, 40);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(0, 20), (30, 40)]);

        map.insert(15, 35);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(0, 40)]);
        assert_eq!(map.allocated_bytes(), 40);
    }

    #[test]
    fn test_allocation_map_insert_inside_existing() {
        let mut map = AllocationMap::from_extents([(0, 100)]);
        map.insert(10, 20);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(0, 100)]);
    }

    #[test]
    fn test_allocation_map_absorbs_many() {
        let mut map = AllocationMap::from_extents([(10, 20), (30, 40), (50, 60), (80, 90)]);
        map.insert(5, 55);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(5, 60), (80, 90)]);
    }

    #[test]
    fn test_allocation_map_ignores_empty_range() {
        let mut map = AllocationMap::new();
        map.insert(10, 10);
        map.insert(20, 5);
        assert!(map.is_empty());
    }

    #[test]
    fn test_allocation_map_status_runs() {
        let map = AllocationMap::from_extents([(100, 200), (300, 400)]);

        assert_eq!(
            map.status(0, 1000),
            Extent {
                allocated: false,
                len: 100
            }
        );
        assert_eq!(
            map.status(150, 1000),
            Extent {
                allocated: true,
                len: 50
            }
        );
        assert_eq!(
            map.status(150, 10),
            Extent {
                allocated: true,
                len: 10
            }
        );
        assert_eq!(
            map.status(200, 1000),
            Extent {
                allocated: false,
                len: 100
            }
        );
        assert_eq!(
            map.status(400, 1000),
            Extent {
                allocated: false,
                len: 1000
            }
        );
    }

    #[test]
    fn test_memory_layer_write_marks_allocated() {
        let layer = MemoryLayer::new("top", 4096);
        assert_eq!(layer.allocated_bytes(), 0);

        layer.write_at(1024, &[0xAB; 512]).unwrap();
        assert_eq!(layer.allocated_extents().unwrap(), vec![(1024, 1536)]);

        let mut buf = [0u8; 512];
        layer.read_at(1024, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_memory_layer_status_past_end() {
        let layer = MemoryLayer::with_data("short", vec![1u8; 1024]);

        let extent = layer.block_status(512, 4096).unwrap();
        assert_eq!(
            extent,
            Extent {
                allocated: true,
                len: 512
            }
        );

        let extent = layer.block_status(1024, 4096).unwrap();
        assert_eq!(
            extent,
            Extent {
                allocated: false,
                len: 4096
            }
        );
    }

    #[test]
    fn test_memory_layer_unallocated_tail_extends_past_end() {
        let layer = MemoryLayer::new("empty", 1024);
        let extent = layer.block_status(0, 8192).unwrap();
        assert_eq!(
            extent,
            Extent {
                allocated: false,
                len: 8192
            }
        );
    }

    #[test]
    fn test_memory_layer_out_of_range() {
        let layer = MemoryLayer::new("top", 1024);
        let err = layer.write_at(1000, &[0u8; 100]).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));

        let mut buf = [0u8; 16];
        assert!(layer.read_at(1020, &mut buf).is_err());
    }

    #[test]
    fn test_memory_layer_fill_unallocated() {
        let layer = MemoryLayer::new("top", 4096);
        layer.write_at(1024, &[9u8; 1024]).unwrap();

        let written = layer.fill_unallocated(0, &[4u8; 4096]).unwrap();
        assert_eq!(written, 3072);
        assert_eq!(layer.allocated_extents().unwrap(), vec![(0, 4096)]);

        let mut buf = vec![0u8; 4096];
        layer.read_at(0, &mut buf).unwrap();
        assert!(buf[1024..2048].iter().all(|&b| b == 9));
        assert!(buf[2048..].iter().all(|&b| b == 4));
    }
}
