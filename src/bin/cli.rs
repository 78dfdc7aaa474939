//! slotkv CLI Client
//!
//! Attaches to a running writer's shared-memory ring and publishes commands.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use slotkv::{CommandQueue, Config, ReclaimThresholds, ShmProducer};

/// slotkv CLI
#[derive(Parser, Debug)]
#[command(name = "slotkv-cli")]
#[command(about = "Publish commands to a running slotkv writer")]
struct Args {
    /// Data directory served by the writer
    #[arg(short, long, default_value = "./slotkv_data")]
    data_dir: PathBuf,

    /// Lock-recovery timeout in milliseconds
    #[arg(long, default_value = "5000")]
    lock_timeout_ms: u64,

    /// Wait until the writer has applied everything before exiting
    #[arg(short, long)]
    wait: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set a key-value pair
    Add {
        /// The key to set
        key: String,

        /// The value to set
        value: String,

        /// Keep an existing value instead of replacing it
        #[arg(long)]
        no_overwrite: bool,
    },

    /// Delete a key
    Remove {
        /// The key to delete
        key: String,
    },

    /// Delete every key
    Clear,

    /// Export a snapshot into a directory
    Backup {
        /// Target directory
        dir: PathBuf,
    },

    /// Run a reclamation pass
    Reclaim {
        #[arg(long, default_value = "0")]
        min_index: u64,

        #[arg(long, default_value = "0")]
        min_data: u64,

        #[arg(long, default_value_t = u64::MAX)]
        max_db_size: u64,

        #[arg(long, default_value_t = u64::MAX)]
        max_entries: u64,
    },

    /// Show ring counters
    Status,
}

fn main() {
    let args = Args::parse();

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .lock_timeout(Duration::from_millis(args.lock_timeout_ms))
        .build();

    let producer = match ShmProducer::attach_config(&config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Cannot attach to {}: {}", config.queue_path().display(), e);
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Commands::Add {
            key,
            value,
            no_overwrite,
        } => producer.enqueue_add(key.as_bytes(), value.as_bytes(), !no_overwrite),
        Commands::Remove { key } => producer.enqueue_remove(key.as_bytes()),
        Commands::Clear => producer.enqueue_clear(),
        Commands::Backup { dir } => producer.enqueue_backup(&dir),
        Commands::Reclaim {
            min_index,
            min_data,
            max_db_size,
            max_entries,
        } => producer.enqueue_reclaim(ReclaimThresholds {
            min_index_reclaim: min_index,
            min_data_reclaim: min_data,
            max_db_size,
            max_entries,
        }),
        Commands::Status => {
            let position = producer.position();
            println!("path:     {}", producer.path().display());
            println!("writer:   {}", if producer.writer_active() { "active" } else { "gone" });
            println!("produced: {}", position.produced);
            println!("consumed: {}", position.consumed);
            println!("pending:  {}", position.pending());
            println!("busy:     {}", producer.is_busy());
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if args.wait {
        let deadline = Instant::now() + Duration::from_secs(30);
        while producer.is_busy() {
            if Instant::now() >= deadline {
                eprintln!("Timed out waiting for the writer");
                std::process::exit(2);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    println!("OK");
}
