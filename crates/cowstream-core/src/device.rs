//! Virtual disks and their image chains
//!
//! A [`Device`] is what the rest of the system addresses by name. It owns the
//! current [`ImageChain`] and serves reads through it and writes into its top
//! layer, concurrently with any streaming job on the same device.

use crate::error::{Error, Result};
use crate::layer::{check_range, ImageLayer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Ordered sequence of layers, top first
#[derive(Clone)]
pub struct ImageChain {
    layers: Vec<Arc<dyn ImageLayer>>,
}

impl ImageChain {
    /// Build a chain from layers ordered top first
    pub fn new(layers: Vec<Arc<dyn ImageLayer>>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::InvalidConfig(
                "an image chain needs at least one layer".to_string(),
            ));
        }
        for (i, layer) in layers.iter().enumerate() {
            if layers[..i].iter().any(|l| l.name() == layer.name()) {
                return Err(Error::InvalidConfig(format!(
                    "layer '{}' appears twice in the chain",
                    layer.name()
                )));
            }
        }
        Ok(Self { layers })
    }

    /// The writable top layer
    pub fn top(&self) -> &Arc<dyn ImageLayer> {
        &self.layers[0]
    }

    /// All layers, top first
    pub fn layers(&self) -> &[Arc<dyn ImageLayer>] {
        &self.layers
    }

    /// Number of layers
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Logical length of the image (the top layer's length)
    pub fn len(&self) -> u64 {
        self.top().len()
    }

    /// Whether the image has zero length
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the layer called `name`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name() == name)
    }

    /// Chain with the layers strictly between the top and `base` removed.
    ///
    /// `base = None` drops every backing layer.
    pub fn without_intermediates(&self, base: Option<usize>) -> Self {
        let mut layers = vec![Arc::clone(self.top())];
        if let Some(base) = base {
            layers.extend(self.layers[base..].iter().cloned());
        }
        Self { layers }
    }

    /// Names of the layers, top first
    pub fn names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name().to_string()).collect()
    }

    /// Read through the chain, zero-filling where no layer holds data
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len() as u64, self.len())?;

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let mut run = (buf.len() - done) as u64;
            let mut source = None;

            for layer in &self.layers {
                let extent = layer.block_status(pos, run)?;
                if extent.allocated {
                    source = Some(layer);
                    run = extent.len;
                    break;
                }
                run = run.min(extent.len);
            }

            let chunk = &mut buf[done..done + run as usize];
            match source {
                Some(layer) => layer.read_at(pos, chunk)?,
                None => chunk.fill(0),
            }
            done += run as usize;
        }

        Ok(())
    }
}

impl fmt::Debug for ImageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Named virtual disk
pub struct Device {
    name: String,
    chain: RwLock<ImageChain>,
}

impl Device {
    /// Create a device over `chain`
    pub fn new(name: impl Into<String>, chain: ImageChain) -> Self {
        Self {
            name: name.into(),
            chain: RwLock::new(chain),
        }
    }

    /// Device identifier
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current chain
    pub fn chain(&self) -> ImageChain {
        self.chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current chain
    pub fn replace_chain(&self, chain: ImageChain) {
        *self.chain.write().unwrap_or_else(PoisonError::into_inner) = chain;
    }

    /// Logical length of the device
    pub fn len(&self) -> u64 {
        self.chain().len()
    }

    /// Whether the device has zero length
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Guest read
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.chain().read(offset, buf)
    }

    /// Guest write, always into the top layer
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.chain().top().write_at(offset, data)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("chain", &self.chain())
            .finish()
    }
}

/// Table of known devices, built once at startup
#[derive(Debug, Default)]
pub struct DeviceMap {
    devices: RwLock<BTreeMap<String, Arc<Device>>>,
}

impl DeviceMap {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device; names must be unique
    pub fn insert(&self, device: Device) -> Result<Arc<Device>> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        if devices.contains_key(device.name()) {
            return Err(Error::InvalidConfig(format!(
                "device '{}' defined twice",
                device.name()
            )));
        }
        let device = Arc::new(device);
        devices.insert(device.name().to_string(), Arc::clone(&device));
        Ok(device)
    }

    /// Look up a device by name
    pub fn get(&self, name: &str) -> Result<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(name.to_string()))
    }

    /// Names of all devices in ascending order
    pub fn names(&self) -> Vec<String> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::MemoryLayer;

    fn chain_of(layers: Vec<MemoryLayer>) -> ImageChain {
        ImageChain::new(
            layers
                .into_iter()
                .map(|l| Arc::new(l) as Arc<dyn ImageLayer>)
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(matches!(
            ImageChain::new(Vec::new()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_duplicate_layer_rejected() {
        let layers: Vec<Arc<dyn ImageLayer>> = vec![
            Arc::new(MemoryLayer::new("a", 10)),
            Arc::new(MemoryLayer::new("a", 10)),
        ];
        assert!(ImageChain::new(layers).is_err());
    }

    #[test]
    fn test_read_through_chain() {
        let top = MemoryLayer::new("top", 4096);
        top.write_at(0, &[1u8; 1024]).unwrap();
        let backing = MemoryLayer::with_data("backing", vec![2u8; 4096]);
        let chain = chain_of(vec![top, backing]);

        let mut buf = vec![0u8; 4096];
        chain.read(0, &mut buf).unwrap();
        assert!(buf[..1024].iter().all(|&b| b == 1));
        assert!(buf[1024..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_read_past_short_backing_is_zero() {
        let top = MemoryLayer::new("top", 4096);
        let backing = MemoryLayer::with_data("backing", vec![3u8; 1000]);
        let chain = chain_of(vec![top, backing]);

        let mut buf = vec![0xFFu8; 4096];
        chain.read(0, &mut buf).unwrap();
        assert!(buf[..1000].iter().all(|&b| b == 3));
        assert!(buf[1000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_without_intermediates() {
        let chain = chain_of(vec![
            MemoryLayer::new("top", 10),
            MemoryLayer::new("mid", 10),
            MemoryLayer::new("base", 10),
        ]);

        assert_eq!(chain.without_intermediates(Some(2)).names(), vec!["top", "base"]);
        assert_eq!(chain.without_intermediates(None).names(), vec!["top"]);
        assert_eq!(chain.position("mid"), Some(1));
        assert_eq!(chain.position("nope"), None);
    }

    #[test]
    fn test_device_write_goes_to_top() {
        let chain = chain_of(vec![
            MemoryLayer::new("top", 1024),
            MemoryLayer::with_data("base", vec![9u8; 1024]),
        ]);
        let device = Device::new("drive0", chain);
        device.write(0, &[7u8; 16]).unwrap();

        assert_eq!(
            device.chain().top().allocated_extents().unwrap(),
            vec![(0, 16)]
        );
        let mut buf = [0u8; 32];
        device.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..16], &[7u8; 16]);
        assert_eq!(&buf[16..], &[9u8; 16]);
    }

    #[test]
    fn test_device_map_lookup() {
        let map = DeviceMap::new();
        map.insert(Device::new("drive0", chain_of(vec![MemoryLayer::new("t", 1)])))
            .unwrap();

        assert!(map.get("drive0").is_ok());
        assert!(matches!(map.get("nope"), Err(Error::DeviceNotFound(_))));
        assert!(map
            .insert(Device::new("drive0", chain_of(vec![MemoryLayer::new("t", 1)])))
            .is_err());
        assert_eq!(map.names(), vec!["drive0"]);
    }
}
