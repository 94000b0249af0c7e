//! Fuzz test for settings TOML parsing
//!
//! Tests that settings deserialization and conversion handle arbitrary TOML
//! safely.

#![no_main]

use cowstream_core::{MonitorSettings, Settings, StreamSettings, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let result: Result<Settings, _> = toml::from_str(data);

    if let Ok(settings) = result {
        let _ = toml::to_string(&settings);
        let _ = toml::to_string_pretty(&settings);

        // Whatever the sizes say, the runtime config stays in bounds
        if let Ok(config) = settings.to_stream_config() {
            assert!(config.chunk_size >= MIN_CHUNK_SIZE);
            assert!(config.chunk_size <= MAX_CHUNK_SIZE);
        }
    }

    let _: Result<StreamSettings, _> = toml::from_str(data);
    let _: Result<MonitorSettings, _> = toml::from_str(data);

    let wrapped = format!("[stream]\n{}", data);
    let _: Result<Settings, _> = toml::from_str(&wrapped);

    let wrapped = format!("[monitor]\n{}", data);
    let _: Result<Settings, _> = toml::from_str(&wrapped);
});
