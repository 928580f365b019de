use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::{sync::mpsc, task::JoinHandle, time::interval};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::{PassageError, PassageResult},
    manager::PassageManager,
};

/// Default delay between two checks of the configuration file
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Read `path` and reconcile `manager` with it
pub async fn load_file(manager: &PassageManager, path: &Path) -> PassageResult<()> {
    let config = Config::from_file(path)?;
    manager.load(config).await
}

/// Reloads the configuration whenever its file is modified
pub struct ConfigWatcher {
    path: PathBuf,
    manager: Arc<PassageManager>,
    interval: Duration,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, manager: Arc<PassageManager>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            manager,
            interval,
            shutdown_tx: None,
        }
    }

    /// Start watching in the background. The current modification time is the
    /// baseline, so a file loaded just before is not reloaded right away.
    pub async fn start(&mut self) -> PassageResult<JoinHandle<()>> {
        if self.shutdown_tx.is_some() {
            return Err(PassageError::Config(format!(
                "already watching {}",
                self.path.display()
            )));
        }

        let baseline = modified(&self.path).await.ok();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        info!(path = %self.path.display(), interval = ?self.interval, "watching configuration");
        Ok(tokio::spawn(watch_loop(
            self.path.clone(),
            Arc::clone(&self.manager),
            self.interval,
            baseline,
            shutdown_rx,
        )))
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

async fn modified(path: &Path) -> std::io::Result<SystemTime> {
    tokio::fs::metadata(path).await?.modified()
}

async fn watch_loop(
    path: PathBuf,
    manager: Arc<PassageManager>,
    period: Duration,
    mut last: Option<SystemTime>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = match modified(&path).await {
                    Ok(current) => current,
                    Err(e) => {
                        warn!(path = %path.display(), "cannot stat configuration: {}", e);
                        continue;
                    }
                };
                if last == Some(current) {
                    continue;
                }
                last = Some(current);

                info!(path = %path.display(), "configuration changed, reloading");
                match load_file(&manager, &path).await {
                    Ok(()) => info!("configuration reloaded"),
                    Err(e) => error!("failed to reload configuration: {}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Received shutdown signal in config watcher");
                break;
            }
        }
    }
}
