//! Fuzz test for device manifest parsing

#![no_main]

use cowstream_core::DeviceManifest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(manifest) = DeviceManifest::from_toml(data) {
        for device in &manifest.devices {
            let _ = device.name.len();
            let _ = device.layers.len();
        }
    }

    let wrapped = format!("[[device]]\n{}", data);
    let _ = DeviceManifest::from_toml(&wrapped);
});
