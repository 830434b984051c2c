//! Mirror a server folder into a client sync root until Ctrl-C.
//!
//! Usage:
//!   cloud-mirror [SERVER_ROOT] [CLIENT_ROOT] [--chunk-size BYTES] [--stats]
//!
//! Exits with 1 once the mirror has connected, run and disconnected, and
//! with 0 if anything along the way failed.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use cloud_mirror::{CloudMirror, MirrorOptions, SyncRootHost, DEFAULT_CHUNK_SIZE};
use tracing_subscriber::EnvFilter;

#[cfg(windows)]
const DEFAULT_SERVER_ROOT: &str = r"C:\Users\test\Desktop\MirrorServer";
#[cfg(windows)]
const DEFAULT_CLIENT_ROOT: &str = r"C:\Users\test\Desktop\MirrorClient";
#[cfg(not(windows))]
const DEFAULT_SERVER_ROOT: &str = "mirror-server";
#[cfg(not(windows))]
const DEFAULT_CLIENT_ROOT: &str = "mirror-client";

/// Project a server folder into a client folder as on-demand placeholders.
#[derive(Debug, Parser)]
#[command(name = "cloud-mirror", version, about)]
struct Args {
    /// Backing folder to project.
    #[arg(default_value = DEFAULT_SERVER_ROOT)]
    server_root: PathBuf,

    /// Sync-root folder receiving placeholders.
    #[arg(default_value = DEFAULT_CLIENT_ROOT)]
    client_root: PathBuf,

    /// Bytes per data-transfer chunk (multiple of 4096).
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Also project subdirectories as placeholders.
    #[arg(long)]
    project_directories: bool,

    /// Print statistics at shutdown.
    #[arg(long)]
    stats: bool,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args: Args = Args::parse();
    init_tracing(args.verbose);

    match run(&args, &mut io::stdout()) {
        Ok(()) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("cloud-mirror: {}", e);
            ExitCode::from(0)
        }
    }
}

fn run(args: &Args, out: &mut impl Write) -> Result<(), Box<dyn std::error::Error>> {
    writeln!(out, "Press ctrl-C to stop gracefully")?;
    writeln!(out, "-------------------------------")?;
    out.flush()?;

    let options = MirrorOptions::new(args.server_root.clone(), args.client_root.clone())
        .with_chunk_size(args.chunk_size)
        .with_project_directories(args.project_directories);

    let mirror = CloudMirror::new(options, host())?;
    mirror.start()?;

    let runtime: tokio::runtime::Runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let waited = runtime.block_on(tokio::signal::ctrl_c());
    drop(runtime);

    writeln!(out, "Shutting down")?;
    mirror.stop();

    if args.stats {
        writeln!(out, "{}", mirror.stats_collector().collect().display_grid())?;
    }

    waited?;
    Ok(())
}

#[cfg(windows)]
fn host() -> Arc<dyn SyncRootHost> {
    Arc::new(cloud_mirror::CloudFilesHost::new())
}

#[cfg(not(windows))]
fn host() -> Arc<dyn SyncRootHost> {
    tracing::warn!("Cloud Files API is not available here; callbacks will only come from the loopback host");
    Arc::new(cloud_mirror::LoopbackHost::new())
}

fn init_tracing(verbose: bool) {
    let default_level: &str = if verbose { "debug" } else { "info" };
    let filter: EnvFilter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
