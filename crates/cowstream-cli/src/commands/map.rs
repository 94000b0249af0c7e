//! Allocation map inspection

use crate::progress::format_size;
use anyhow::{Context, Result};
use console::style;
use cowstream_core::{FileLayer, ImageLayer};
use serde_json::json;
use std::path::Path;

/// One run of identical allocation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    offset: u64,
    len: u64,
    allocated: bool,
}

/// Execute the map command
pub fn execute(path: &Path, json: bool, silent: bool) -> Result<()> {
    let layer =
        FileLayer::open(path).with_context(|| format!("Failed to open layer {}", path.display()))?;
    let runs = collect_runs(&layer)?;

    if silent {
        return Ok(());
    }

    if json {
        let entries: Vec<_> = runs
            .iter()
            .map(|run| json!({"start": run.offset, "length": run.len, "data": run.allocated}))
            .collect();
        let output =
            serde_json::to_string_pretty(&entries).context("Failed to serialize allocation map")?;
        println!("{}", output);
        return Ok(());
    }

    for run in &runs {
        let state = if run.allocated {
            style("allocated").green()
        } else {
            style("not allocated").dim()
        };
        println!(
            "{:>10} ({:#x}) bytes at offset {} ({:#x}) {}",
            format_size(run.len),
            run.len,
            run.offset,
            run.offset,
            state
        );
    }
    Ok(())
}

/// Walk the layer front to back
fn collect_runs(layer: &dyn ImageLayer) -> Result<Vec<Run>> {
    let mut runs = Vec::new();
    let mut offset = 0;
    let len = layer.len();

    while offset < len {
        let extent = layer
            .block_status(offset, len - offset)
            .context("Failed to query allocation state")?;
        let run_len = extent.len.clamp(1, len - offset);
        runs.push(Run {
            offset,
            len: run_len,
            allocated: extent.allocated,
        });
        offset += run_len;
    }

    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowstream_core::MemoryLayer;

    #[test]
    fn test_collect_runs() {
        let layer = MemoryLayer::new("top", 16 * 1024);
        layer.write_at(4096, &[1u8; 4096]).unwrap();

        let runs = collect_runs(&layer).unwrap();
        assert_eq!(
            runs,
            vec![
                Run { offset: 0, len: 4096, allocated: false },
                Run { offset: 4096, len: 4096, allocated: true },
                Run { offset: 8192, len: 8192, allocated: false },
            ]
        );
    }

    #[test]
    fn test_collect_runs_empty_layer() {
        let layer = MemoryLayer::new("empty", 0);
        assert!(collect_runs(&layer).unwrap().is_empty());
    }
}
