//! File-backed image layers
//!
//! A file layer is a raw data file (sparse where the filesystem allows it)
//! plus a JSON sidecar at `<path>.map` listing the allocated extents.

use crate::error::{Error, Result};
use crate::layer::{check_range, holes, status_within, AllocationMap, Extent, ImageLayer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Current version of the allocation map format
pub const MAP_VERSION: u32 = 1;

/// Extension appended to the data file path for the allocation map
pub const MAP_EXTENSION: &str = "map";

/// On-disk allocation map
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MapFile {
    version: u32,
    len: u64,
    extents: Vec<[u64; 2]>,
}

/// Layer stored in a raw file with an allocation sidecar
pub struct FileLayer {
    name: String,
    path: PathBuf,
    len: u64,
    state: Mutex<FileState>,
}

struct FileState {
    file: File,
    map: AllocationMap,
    dirty: bool,
}

impl FileLayer {
    /// Create a new, fully unallocated layer of `len` bytes
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len)?;

        let layer = Self::from_parts(path, len, file, AllocationMap::new());
        layer.save_map()?;
        tracing::debug!("Created layer {} ({} bytes)", layer.name, len);
        Ok(layer)
    }

    /// Open an existing layer
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map_path = map_path(&path);

        let reader = BufReader::new(File::open(&map_path).map_err(|e| {
            Error::Storage(format!(
                "cannot open allocation map {}: {}",
                map_path.display(),
                e
            ))
        })?);
        let map_file: MapFile = serde_json::from_reader(reader).map_err(|e| {
            Error::Storage(format!("corrupt allocation map {}: {}", map_path.display(), e))
        })?;

        if map_file.version > MAP_VERSION {
            return Err(Error::Storage(format!(
                "allocation map version {} is newer than supported version {}",
                map_file.version, MAP_VERSION
            )));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < map_file.len {
            return Err(Error::Storage(format!(
                "{} is {} bytes but its map declares {}",
                path.display(),
                file_len,
                map_file.len
            )));
        }

        let map = AllocationMap::from_extents(map_file.extents.iter().map(|[s, e]| (*s, *e)));
        Ok(Self::from_parts(path, map_file.len, file, map))
    }

    /// Create a layer at `path` from a raw image, allocating every
    /// `chunk_size` chunk that contains a non-zero byte
    pub fn import_raw(
        raw: impl AsRef<Path>,
        path: impl AsRef<Path>,
        chunk_size: usize,
    ) -> Result<Self> {
        let mut source = File::open(raw.as_ref())?;
        let len = source.metadata()?.len();
        let layer = Self::create(path, len)?;

        let mut buffer = vec![0u8; chunk_size.max(1)];
        let mut offset = 0u64;
        while offset < len {
            let to_read = buffer.len().min((len - offset) as usize);
            source.read_exact(&mut buffer[..to_read])?;
            if buffer[..to_read].iter().any(|&b| b != 0) {
                layer.write_at(offset, &buffer[..to_read])?;
            }
            offset += to_read as u64;
        }

        layer.flush()?;
        Ok(layer)
    }

    fn from_parts(path: PathBuf, len: u64, file: File, map: AllocationMap) -> Self {
        Self {
            name: path.to_string_lossy().into_owned(),
            path,
            len,
            state: Mutex::new(FileState {
                file,
                map,
                dirty: false,
            }),
        }
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save_map(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.save_map_locked(&mut state)
    }

    fn save_map_locked(&self, state: &mut FileState) -> Result<()> {
        let map_file = MapFile {
            version: MAP_VERSION,
            len: self.len,
            extents: state.map.iter().map(|(s, e)| [s, e]).collect(),
        };

        // Write to a temporary file first so a crash never leaves a torn map.
        let map_path = map_path(&self.path);
        let tmp_path = map_path.with_extension(format!("{}.tmp", MAP_EXTENSION));
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            serde_json::to_writer(&mut writer, &map_file)
                .map_err(|e| Error::Storage(format!("cannot encode allocation map: {}", e)))?;
            writer.flush()?;
        }
        fs::rename(&tmp_path, &map_path)?;

        state.dirty = false;
        Ok(())
    }
}

/// Sidecar path for a layer's data file
pub fn map_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(MAP_EXTENSION);
    PathBuf::from(name)
}

impl fmt::Debug for FileLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLayer")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl ImageLayer for FileLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn block_status(&self, offset: u64, max_len: u64) -> Result<Extent> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(status_within(&state.map, self.len, offset, max_len))
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len() as u64, self.len)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len() as u64, self.len)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(data)?;
        state.map.insert(offset, offset + data.len() as u64);
        state.dirty = true;
        Ok(())
    }

    fn fill_unallocated(&self, offset: u64, data: &[u8]) -> Result<u64> {
        check_range(offset, data.len() as u64, self.len)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut written = 0u64;
        for (start, end) in holes(&state.map, offset, data.len() as u64) {
            state.file.seek(SeekFrom::Start(offset + start))?;
            state.file.write_all(&data[start as usize..end as usize])?;
            state.map.insert(offset + start, offset + end);
            state.dirty = true;
            written += end - start;
        }
        Ok(written)
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.file.sync_data()?;
        if state.dirty {
            self.save_map_locked(&mut state)?;
        }
        Ok(())
    }

    fn allocated_extents(&self) -> Result<Vec<(u64, u64)>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.map.iter().collect())
    }
}

impl Drop for FileLayer {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.dirty {
            if let Err(e) = self.save_map_locked(&mut state) {
                tracing::warn!("Failed to save allocation map for {}: {}", self.name, e);
            }
        }
    }
}
