//! grnsd - task graph daemon.
//!
//! Main entry point for the daemon binary.

use std::path::PathBuf;

use clap::Parser;
use grnsd::{Daemon, DaemonConfig};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Task graph daemon serving the grns HTTP API.
#[derive(Parser)]
#[command(name = "grnsd", version)]
struct Args {
    /// Path to the SQLite store.
    #[arg(long, env = "GRNS_DB")]
    db: Option<PathBuf>,

    /// HTTP listen port.
    #[arg(long, default_value_t = 7070)]
    port: u16,

    /// Two-letter project prefix for new task ids.
    #[arg(long, default_value = grns_core::DEFAULT_PROJECT_PREFIX)]
    prefix: String,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = DaemonConfig {
        port: args.port,
        prefix: args.prefix,
        ..Default::default()
    };
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                if let Err(e) = daemon.run().await {
                    error!("daemon error: {e}");
                    std::process::exit(1);
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        }
    });
}
