//! hostrpc server - standalone bridge server with a simulated host main loop.
//!
//! The process plays the part of a host application: its main thread runs a
//! fixed-rate loop that fires the host's timers (`blender`) or post-tick
//! callbacks (`unreal`), draining calls the bridge queued for it. With
//! `--host-kind none` registered callables run directly on server workers.

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use hostrpc::{
    BlenderAdapter, ManualTicker, ManualTimers, RpcServerBuilder, RpcSettings, UnrealAdapter,
};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Main loop period of the simulated host.
const FRAME: Duration = Duration::from_millis(16);

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum HostKind {
    /// No host main thread; calls run on server workers
    #[value(name = "none")]
    Headless,
    /// Drain queued calls from a recurring UI timer
    Blender,
    /// Drain queued calls after every engine tick
    Unreal,
}

#[derive(Parser, Debug)]
#[command(name = "hostrpc-server")]
#[command(about = "Bridge server for shipped script callables")]
struct Args {
    /// Port to listen on (0 = auto-assign, default RPC_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (default RPC_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Enable debug logging (also enabled by RPC_DEBUG)
    #[arg(short, long)]
    debug: bool,

    /// Host application to simulate
    #[arg(long, value_enum, default_value = "none")]
    host_kind: HostKind,

    /// Serve on the main thread until a kill request arrives
    #[arg(long)]
    blocking: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = RpcSettings::from_env();

    // Set up logging
    let log_level = if args.debug || settings.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Starting hostrpc server ({:?} host)", args.host_kind);

    if args.blocking && args.host_kind != HostKind::Headless {
        bail!("--blocking serves on the main thread, which the host loop needs; use --host-kind none");
    }

    let timers = Arc::new(ManualTimers::new());
    let ticker = Arc::new(ManualTicker::new());

    let mut builder = RpcServerBuilder::from_settings(&settings);
    if let Some(host) = args.host {
        builder = builder.host(host);
    }
    if let Some(port) = args.port {
        builder = builder.port(port);
    }
    builder = match args.host_kind {
        HostKind::Headless => builder,
        HostKind::Blender => builder.host_adapter(Arc::new(BlenderAdapter::install(timers.as_ref()))),
        HostKind::Unreal => builder.host_adapter(Arc::new(UnrealAdapter::install(ticker.as_ref()))),
    };

    let server = builder.build().bind()?;

    // Parent processes read the port from this line
    println!("RPC_PORT={}", server.local_addr().port());
    std::io::stdout().flush()?;

    if args.blocking {
        server.serve_blocking()?;
        info!("Server stopped");
        return Ok(());
    }

    let handle = server.spawn()?;
    info!("RPC server running on {}", handle.local_addr());

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    let mut last_frame = Instant::now();
    while running.load(Ordering::SeqCst) && !handle.is_stopped() {
        let now = Instant::now();
        let delta = now.duration_since(last_frame);
        last_frame = now;

        match args.host_kind {
            HostKind::Headless => {}
            HostKind::Blender => {
                timers.run_due();
            }
            HostKind::Unreal => {
                ticker.tick(delta.as_secs_f32());
            }
        }
        std::thread::sleep(FRAME);
    }

    if running.load(Ordering::SeqCst) {
        info!("Server stopped by kill request");
    } else {
        warn!("Shutdown signal received, exiting");
    }
    handle.shutdown();
    Ok(())
}
