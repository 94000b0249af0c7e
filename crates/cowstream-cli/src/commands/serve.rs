//! Control protocol server on stdin/stdout

use super::{build_runtime, interrupted, load_settings, open_registry};
use anyhow::{Context, Result};
use cowstream_core::Monitor;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

/// Arguments for the serve command
pub struct ServeArgs {
    /// Device manifest path
    pub manifest: PathBuf,
    /// Skip the greeting banner
    pub no_greeting: bool,
    /// Custom settings file path
    pub config_file: Option<PathBuf>,
    /// Cleared by the Ctrl+C handler
    pub cancel_flag: Arc<AtomicBool>,
}

/// Grace period for runtime tasks once the control loop is done
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Execute the serve command
pub fn execute(args: ServeArgs) -> Result<()> {
    let settings = load_settings(args.config_file);
    let registry = open_registry(&args.manifest, &settings)?;
    let monitor = Monitor::new(registry).greeting(settings.monitor.greeting && !args.no_greeting);

    tracing::info!(
        "Serving {} device(s) on stdin/stdout",
        monitor.registry().devices().names().len()
    );

    let runtime = build_runtime()?;
    let result = runtime.block_on(async {
        let reader = BufReader::new(tokio::io::stdin());
        let writer = tokio::io::stdout();

        tokio::select! {
            result = monitor.serve(reader, writer) => {
                result.context("Control loop failed")?;
            }
            () = interrupted(&args.cancel_flag) => {
                tracing::info!("Interrupted, shutting down");
            }
        }

        let active = monitor.registry().list();
        if !active.is_empty() {
            tracing::warn!("Abandoning {} active job(s)", active.len());
        }
        Ok::<_, anyhow::Error>(())
    });

    // A pending stdin read sits on the blocking pool and cannot be
    // cancelled, so dropping the runtime would wait for the next line.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}
