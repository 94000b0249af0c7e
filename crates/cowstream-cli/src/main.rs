//! Cowstream - Background streaming of copy-on-write image chains
//!
//! # Usage
//!
//! ```bash
//! # Create an empty overlay on top of an imported base image
//! cowstream import disk.raw base.img
//! cowstream create top.img --size 10G
//!
//! # Flatten the chain of one device, 10 MiB/s at most
//! cowstream stream drive0 --manifest devices.toml --speed 10M
//!
//! # Serve the JSON control protocol on stdin/stdout
//! cowstream serve --manifest devices.toml
//! ```

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use clap_mangen::Man;
use console::style;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Print unless running silently
macro_rules! println_if {
    ($silent:expr) => {
        if !$silent {
            println!();
        }
    };
    ($silent:expr, $($arg:tt)*) => {
        if !$silent {
            println!($($arg)*);
        }
    };
}

mod commands;
mod progress;

/// Cowstream - Background streaming of copy-on-write image chains
#[derive(Parser)]
#[command(name = "cowstream")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Suppress ALL output (implies --quiet and --yes)
    #[arg(long, global = true)]
    silent: bool,

    /// Use a specific settings file instead of the default location
    #[arg(long, global = true, env = "COWSTREAM_CONFIG", value_name = "FILE")]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the JSON control protocol on stdin/stdout
    Serve {
        /// Device manifest (TOML) describing the image chains
        #[arg(short, long)]
        manifest: PathBuf,

        /// Do not send the greeting banner
        #[arg(long)]
        no_greeting: bool,
    },

    /// Stream one device's backing layers into its top layer
    Stream {
        /// Device to stream
        device: String,

        /// Device manifest (TOML) describing the image chains
        #[arg(short, long)]
        manifest: PathBuf,

        /// Stop at this layer; it stays as the backing layer
        #[arg(short, long)]
        base: Option<String>,

        /// Speed limit per second (e.g., 10M, 512K, 0 for unlimited)
        #[arg(short, long)]
        speed: Option<String>,

        /// Print the terminal event as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create an empty image layer
    Create {
        /// Path of the new layer
        path: PathBuf,

        /// Logical size of the layer (e.g., 10G, 512M)
        #[arg(short, long)]
        size: String,

        /// Overwrite an existing layer without asking
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Import a raw disk image as an image layer
    Import {
        /// Raw image to import
        raw: PathBuf,

        /// Path of the new layer
        path: PathBuf,

        /// Allocation granularity (e.g., 64K, 1M)
        #[arg(short, long, default_value = "64K")]
        chunk_size: String,

        /// Overwrite an existing layer without asking
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Show the allocated ranges of an image layer
    Map {
        /// Layer to inspect
        path: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show or initialize the settings file
    Config {
        /// Create a settings file with default values
        #[arg(long)]
        init: bool,

        /// Print the settings file path
        #[arg(long)]
        path: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Generate man pages
    Mangen {
        /// Output directory for man pages
        #[arg(short, long, default_value = ".")]
        out_dir: String,
    },
}

fn main() {
    // Set up panic handler for nicer error messages
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{} {}", style("Error:").red().bold(), panic_info);
    }));

    if let Err(e) = run() {
        eprintln!("{} {}", style("Error:").red().bold(), e);

        // Show cause chain in verbose mode
        if std::env::var("RUST_BACKTRACE").is_ok() {
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  {} {}", style("Caused by:").yellow(), cause);
                source = cause.source();
            }
        }

        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // --silent implies --quiet (no logs at all, not even errors to tracing)
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.quiet || cli.silent {
        EnvFilter::new("off")
    } else {
        EnvFilter::new("info")
    };

    // stdout carries the control protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let silent = cli.silent;

    // Set up Ctrl+C handler (suppress messages in silent mode)
    let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    let r = running.clone();
    let silent_for_handler = silent;
    ctrlc::set_handler(move || {
        if !r.load(std::sync::atomic::Ordering::SeqCst) {
            // Second Ctrl+C, force exit
            if !silent_for_handler {
                eprintln!("\n{}", style("Forced exit").red().bold());
            }
            std::process::exit(130);
        }
        r.store(false, std::sync::atomic::Ordering::SeqCst);
        if !silent_for_handler {
            eprintln!(
                "\n{}",
                style("Cancelling... Press Ctrl+C again to force exit").yellow()
            );
        }
    })?;

    match cli.command {
        Commands::Serve {
            manifest,
            no_greeting,
        } => commands::serve::execute(commands::serve::ServeArgs {
            manifest,
            no_greeting,
            config_file: cli.config_file,
            cancel_flag: running,
        }),
        Commands::Stream {
            device,
            manifest,
            base,
            speed,
            json,
        } => commands::stream::execute(commands::stream::StreamArgs {
            device,
            manifest,
            base,
            speed,
            json,
            config_file: cli.config_file,
            cancel_flag: running,
            silent,
        }),
        Commands::Create { path, size, yes } => {
            commands::layer::create(&path, &size, yes || silent, silent)
        }
        Commands::Import {
            raw,
            path,
            chunk_size,
            yes,
        } => commands::layer::import(&raw, &path, &chunk_size, yes || silent, silent),
        Commands::Map { path, json } => commands::map::execute(&path, json, silent),
        Commands::Config { init, path, json } => {
            commands::config::execute(commands::config::ConfigArgs {
                init,
                path,
                json,
                silent,
                config_file: cli.config_file,
            })
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
        Commands::Mangen { out_dir } => {
            let cmd = Cli::command();
            let out_path = std::path::Path::new(&out_dir);
            std::fs::create_dir_all(out_path)?;

            let man = Man::new(cmd.clone());
            let mut buffer = Vec::new();
            man.render(&mut buffer)?;
            std::fs::write(out_path.join("cowstream.1"), buffer)?;
            println_if!(silent, "Generated: {}/cowstream.1", out_dir);

            for subcommand in cmd.get_subcommands() {
                let name = subcommand.get_name();
                if subcommand.is_hide_set()
                    || name == "completions"
                    || name == "mangen"
                    || name == "help"
                {
                    continue;
                }

                let man = Man::new(subcommand.clone());
                let mut buffer = Vec::new();
                man.render(&mut buffer)?;
                let filename = format!("cowstream-{}.1", name);
                std::fs::write(out_path.join(&filename), buffer)?;
                println_if!(silent, "Generated: {}/{}", out_dir, filename);
            }
            Ok(())
        }
    }
}
