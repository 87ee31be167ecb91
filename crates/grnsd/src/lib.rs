//! grnsd - task graph daemon.
//!
//! Library components for the daemon process: the SQLite store, the query
//! engine, the import/export pipeline, and the HTTP surface.

pub mod query;
pub mod server;
pub mod storage;
pub mod transfer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::server::AppState;
use crate::storage::Storage;

/// Type alias for application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP listen port (default: 7070).
    pub port: u16,
    /// Two-letter project prefix new task ids are minted under.
    pub prefix: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: 7070,
            prefix: grns_core::DEFAULT_PROJECT_PREFIX.to_string(),
        }
    }
}

/// Default database path: `$GRNS_DB`, else `~/.local/share/grns/grns.db`.
fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("GRNS_DB") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("grns").join("grns.db")
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    storage: Arc<Storage>,
}

impl Daemon {
    /// Open the store, run migrations, and build the daemon.
    pub async fn new(config: DaemonConfig) -> AppResult<Self> {
        let storage = Storage::new(&config.db_path, &config.prefix).await?;
        storage.migrate().await?;
        Ok(Self {
            config,
            storage: Arc::new(storage),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Serve the HTTP API until ctrl-c.
    pub async fn run(&self) -> AppResult<()> {
        let state = Arc::new(AppState {
            storage: Arc::clone(&self.storage),
        });
        let router = server::create_router(state);

        let addr = SocketAddr::from(([127, 0, 0, 1], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("grnsd listening on http://{addr}");
        info!("database: {}", self.config.db_path.display());
        info!("project prefix: {}", self.config.prefix);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received SIGINT, shutting down");
    }
}
