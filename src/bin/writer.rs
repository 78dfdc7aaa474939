//! slotkv Writer Binary
//!
//! Opens a data directory as its single writer and serves a shared-memory
//! slot ring that `slotkv-cli` (or any `ShmProducer`) can publish into.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use slotkv::{CommandQueue, Config, Engine, QueueMode};
use tracing_subscriber::{fmt, EnvFilter};

/// slotkv Writer
#[derive(Parser, Debug)]
#[command(name = "slotkv-writer")]
#[command(about = "Single writer for a slotkv data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./slotkv_data")]
    data_dir: PathBuf,

    /// Number of slots in the ring
    #[arg(short = 'n', long, default_value = "256")]
    capacity: u32,

    /// Inline key capacity per slot, in bytes
    #[arg(long, default_value = "256")]
    key_capacity: u32,

    /// Inline value capacity per slot, in bytes
    #[arg(long, default_value = "1024")]
    value_capacity: u32,

    /// Lock-recovery timeout in milliseconds
    #[arg(long, default_value = "5000")]
    lock_timeout_ms: u64,

    /// Seconds between stats log lines
    #[arg(long, default_value = "10")]
    stats_interval: u64,

    /// Stop after this many seconds (runs until killed when omitted)
    #[arg(long)]
    run_for: Option<u64>,

    /// Enqueue this many generated puts at startup
    #[arg(long, default_value = "0")]
    load: u64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,slotkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("slotkv writer v{}", slotkv::VERSION);
    tracing::info!("Data directory: {}", args.data_dir.display());

    // Build config from args
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .async_writer(true)
        .queue_mode(QueueMode::SharedMemory)
        .queue_capacity(args.capacity)
        .shm_key_capacity(args.key_capacity)
        .shm_value_capacity(args.value_capacity)
        .lock_timeout(Duration::from_millis(args.lock_timeout_ms))
        .build();

    // Open engine
    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Serving slot ring at {}",
        engine.config().queue_path().display()
    );

    if args.load > 0 {
        generate_load(&engine, args.load);
    }

    let started = Instant::now();
    let interval = Duration::from_secs(args.stats_interval.max(1));
    loop {
        thread::sleep(interval);
        log_stats(&engine);

        let writer_running = engine.writer().is_some_and(|w| !w.is_stopped());
        if !writer_running {
            tracing::error!("Async writer is no longer running");
            break;
        }
        if args
            .run_for
            .is_some_and(|secs| started.elapsed() >= Duration::from_secs(secs))
        {
            break;
        }
    }

    if !engine.wait_idle(Duration::from_secs(30)) {
        tracing::warn!("Queue still busy at shutdown");
    }
    if let Err(e) = engine.close() {
        tracing::error!("Writer stopped with error: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Writer stopped");
}

fn generate_load(engine: &Engine, count: u64) {
    let started = Instant::now();
    for i in 0..count {
        let key = format!("load-{:08}", i);
        let value = format!("value-{}", i);
        if let Err(e) = engine.put(key.as_bytes(), value.as_bytes()) {
            tracing::error!("Load generation stopped at {}: {}", i, e);
            return;
        }
    }
    tracing::info!("Enqueued {} puts in {:?}", count, started.elapsed());
}

fn log_stats(engine: &Engine) {
    let store = engine.store_stats();
    let (Some(queue), Some(position)) = (engine.queue_stats(), engine.queue_position()) else {
        return;
    };
    tracing::info!(
        "keys={} live_bytes={} dead_bytes={} pending={} applied={} failed={} reclaims={} lock_resets={} recovered={}",
        store.live_entries,
        store.live_bytes,
        store.dead_bytes,
        position.pending(),
        queue.applied,
        queue.failed,
        queue.reclaim_passes,
        queue.lock_resets,
        queue.tickets_recovered
    );
    if let Some(writer) = engine.writer() {
        tracing::debug!("Queue busy: {}", writer.is_busy());
    }
}
