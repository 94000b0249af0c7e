//! Image layer creation commands

use crate::progress::format_size;
use anyhow::{bail, Context, Result};
use console::style;
use cowstream_core::{parse_size, FileLayer, ImageLayer};
use dialoguer::Confirm;
use std::path::Path;

/// Create an empty layer of `size` bytes at `path`
pub fn create(path: &Path, size: &str, skip_confirm: bool, silent: bool) -> Result<()> {
    let len = parse_size(size).with_context(|| format!("Invalid size: {}", size))?;
    confirm_overwrite(path, skip_confirm)?;

    FileLayer::create(path, len)
        .with_context(|| format!("Failed to create layer {}", path.display()))?;

    println_if!(
        silent,
        "{} Created {} ({})",
        style("Success:").green().bold(),
        path.display(),
        format_size(len)
    );
    Ok(())
}

/// Import the raw image `raw` as a new layer at `path`
pub fn import(raw: &Path, path: &Path, chunk_size: &str, skip_confirm: bool, silent: bool) -> Result<()> {
    let chunk = parse_size(chunk_size)
        .ok()
        .and_then(|c| usize::try_from(c).ok())
        .filter(|&c| c > 0)
        .with_context(|| format!("Invalid chunk size: {}", chunk_size))?;
    confirm_overwrite(path, skip_confirm)?;

    let layer = FileLayer::import_raw(raw, path, chunk)
        .with_context(|| format!("Failed to import {}", raw.display()))?;
    let allocated: u64 = layer
        .allocated_extents()
        .context("Failed to read allocation map")?
        .iter()
        .map(|(start, end)| end - start)
        .sum();

    println_if!(
        silent,
        "{} Imported {} into {} ({} allocated of {})",
        style("Success:").green().bold(),
        raw.display(),
        path.display(),
        format_size(allocated),
        format_size(layer.len())
    );
    Ok(())
}

/// Ask before replacing an existing layer
fn confirm_overwrite(path: &Path, skip_confirm: bool) -> Result<()> {
    if !path.exists() || skip_confirm {
        return Ok(());
    }

    let confirmed = Confirm::new()
        .with_prompt(format!("{} exists. Overwrite it?", path.display()))
        .default(false)
        .interact()
        .context("Failed to get user confirmation")?;

    if !confirmed {
        bail!("Aborted, {} left unchanged", path.display());
    }
    Ok(())
}
