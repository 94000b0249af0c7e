//! Stream a single device from the command line

use super::{build_runtime, load_settings, open_registry};
use crate::progress::{create_stream_progress_bar, format_eta, format_size, format_speed};
use anyhow::{bail, Context, Result};
use console::style;
use cowstream_core::{parse_size, EventKind, EventMessage, JobRegistry};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Arguments for the stream command
pub struct StreamArgs {
    /// Device to stream
    pub device: String,
    /// Device manifest path
    pub manifest: PathBuf,
    /// Layer to stop at
    pub base: Option<String>,
    /// Speed limit (human size per second)
    pub speed: Option<String>,
    /// Print the terminal event as JSON
    pub json: bool,
    /// Custom settings file path
    pub config_file: Option<PathBuf>,
    /// Cleared by the Ctrl+C handler
    pub cancel_flag: Arc<AtomicBool>,
    /// Suppress output
    pub silent: bool,
}

/// Execute the stream command
pub fn execute(args: StreamArgs) -> Result<()> {
    let speed = args.speed.as_deref().map(parse_speed).transpose()?;
    let settings = load_settings(args.config_file.clone());
    let registry = open_registry(&args.manifest, &settings)?;

    let runtime = build_runtime()?;
    runtime.block_on(run(&registry, &args, speed))
}

/// Parse a `--speed` value into bytes per second
fn parse_speed(speed: &str) -> Result<i64> {
    let bytes = parse_size(speed).with_context(|| format!("Invalid speed: {}", speed))?;
    i64::try_from(bytes).with_context(|| format!("Speed too large: {}", speed))
}

async fn run(registry: &JobRegistry, args: &StreamArgs, speed: Option<i64>) -> Result<()> {
    let mut events = registry.subscribe();
    let handle = registry
        .start(&args.device, args.base.as_deref(), speed)
        .with_context(|| format!("Failed to start streaming {}", args.device))?;

    let info = registry
        .list()
        .into_iter()
        .find(|job| job.device == args.device);
    let len = info.as_ref().map_or(0, |job| job.len);
    let limit = info.as_ref().map_or(0, |job| job.speed);

    println_if!(
        args.silent || args.json,
        "{} Streaming {} ({}, limit {})",
        style("==>").cyan().bold(),
        style(&args.device).bold(),
        format_size(len),
        format_speed(limit)
    );

    let pb = create_stream_progress_bar(len, args.silent || args.json);
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut cancel_sent = false;

    let event = loop {
        tokio::select! {
            event = events.recv() => {
                break event.context("Event stream closed before the job finished")?;
            }
            _ = ticker.tick() => {
                if let Some(job) = registry.list().into_iter().find(|job| job.device == args.device) {
                    pb.set_position(job.offset);
                }
                if !cancel_sent && !args.cancel_flag.load(Ordering::SeqCst) {
                    // The job may finish between the tick and the cancel.
                    if let Err(e) = registry.cancel(&args.device) {
                        tracing::debug!("Cancel not delivered: {}", e);
                    }
                    cancel_sent = true;
                }
            }
        }
    };

    let status = handle.wait().await;
    pb.finish_and_clear();
    tracing::debug!(?status, "Job finished");

    if args.json {
        let message = serde_json::to_string(&EventMessage::from(&event))
            .context("Failed to serialize event")?;
        if !args.silent {
            println!("{}", message);
        }
    }

    match event.kind {
        EventKind::Completed => {
            println_if!(
                args.silent || args.json,
                "{} Streamed {} in {}",
                style("Success:").green().bold(),
                format_size(event.len),
                format_eta(started.elapsed().as_secs())
            );
            Ok(())
        }
        EventKind::Cancelled => bail!(
            "Streaming cancelled at {} of {}",
            format_size(event.offset),
            format_size(event.len)
        ),
        EventKind::Error => bail!(
            "Streaming failed at offset {}: {}",
            event.offset,
            event.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}
