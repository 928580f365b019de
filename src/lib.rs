//! Passage - SSH Tunnel Orchestrator
//!
//! Keeps a set of local listeners ("passages") forwarding through SSH
//! connections to remote targets, and keeps them in sync with a configuration
//! file that may change while running.
//!
//! # Features
//!
//! - One lazily dialed SSH connection per server, shared by its passages
//! - Static remote addresses and Docker containers resolved over the tunnel
//! - Minimal-disruption reloads driven by configuration fingerprints
//! - A Unix socket control service to look up bound addresses
//! - Structured logging with tracing
//!
//! # Example
//!
//! ```rust,no_run
//! use passage::{Config, PassageManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_yaml(
//!         r#"
//! servers:
//!   web:
//!     address: 192.168.1.100
//!     passages:
//!       db: "5432"
//! "#,
//!     )?;
//!
//!     let manager = PassageManager::new();
//!     manager.load(config).await?;
//!     println!("db is reachable on {}", manager.addr("db").await?);
//!
//!     manager.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod container;
pub mod error;
pub mod fingerprint;
pub mod listener;
pub mod manager;
pub mod passage;
pub mod reload;
pub mod remote;
pub mod rpc;
pub mod ssh;

use std::{fs::OpenOptions, path::Path, sync::Arc};

pub use config::{Config, PassageConfig, RemoteConfig, ServerConfig};
pub use error::{ConfigError, PassageError, PassageResult};
pub use manager::{Connector, PassageManager, PassageStatus, SshConnector};
pub use passage::Passage;
pub use remote::Remote;
pub use ssh::{Connection, SshConnection, SshTarget};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with tracing
///
/// `RUST_LOG` takes precedence over `level`. When `log_file` is given, events
/// are appended to it as well as written to stdout.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> PassageResult<()> {
    let level: LevelFilter = level
        .parse()
        .map_err(|_| PassageError::Config(format!("invalid log level {level:?}")))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("passage={level}")));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| PassageError::Config(e.to_string()))?;

    Ok(())
}
