//! Hot reload wiring. Watches the config file via `notify`
//! and reacts to a manual trigger (the management-triggered reload the
//! dashboard WebSocket sends). Rejects reloads that would change
//! listener addresses, the MITM domain set, or CA paths.

use crate::config::Config;
use crate::error::{FpsError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Notification sent to interested components after a reload succeeds.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub old_config: Config,
    pub new_config: Config,
}

pub struct ConfigReloader {
    config: Arc<RwLock<Config>>,
    change_tx: mpsc::UnboundedSender<ConfigChange>,
    change_rx: Option<mpsc::UnboundedReceiver<ConfigChange>>,
    config_file_path: PathBuf,
}

impl ConfigReloader {
    pub fn new(initial_config: Config, config_file_path: PathBuf) -> Self {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(RwLock::new(initial_config)),
            change_tx,
            change_rx: Some(change_rx),
            config_file_path,
        }
    }

    pub async fn get_config(&self) -> Config {
        self.config.read().await.clone()
    }

    pub fn take_change_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ConfigChange>> {
        self.change_rx.take()
    }

    /// Start the file watcher and SIGHUP handler. Runs in the
    /// background; errors while watching are logged, not propagated.
    pub fn start_watching(&self) {
        let config = self.config.clone();
        let change_tx = self.change_tx.clone();
        let path = self.config_file_path.clone();

        tokio::spawn(async move {
            if let Err(e) = watch_config_file(config, change_tx, path).await {
                error!(error = %e, "configuration file watcher exited");
            }
        });

        self.start_signal_handler();
    }

    fn start_signal_handler(&self) {
        let config = self.config.clone();
        let change_tx = self.change_tx.clone();
        let path = self.config_file_path.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sighup = match signal(SignalKind::hangup()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "failed to install SIGHUP handler");
                        return;
                    }
                };
                loop {
                    sighup.recv().await;
                    info!("received SIGHUP, reloading configuration");
                    if let Err(e) = reload_from_file(&config, &change_tx, &path).await {
                        error!(error = %e, "configuration reload from SIGHUP failed");
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = (config, change_tx, path);
                std::future::pending::<()>().await;
            }
        });
    }

    /// Manually trigger a reload.
    /// Returns an error string to hand back to the initiator on rejection.
    pub async fn reload_now(&self) -> Result<()> {
        reload_from_file(&self.config, &self.change_tx, &self.config_file_path).await
    }
}

async fn watch_config_file(
    config: Arc<RwLock<Config>>,
    change_tx: mpsc::UnboundedSender<ConfigChange>,
    path: PathBuf,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut watcher: RecommendedWatcher = Watcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = result {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| FpsError::ConfigInvalid(e.to_string()))?;

    let watch_dir = path.parent().unwrap_or_else(|| Path::new("."));
    watcher
        .watch(watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| FpsError::ConfigInvalid(e.to_string()))?;

    while let Some(event) = rx.recv().await {
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            continue;
        }
        if !event.paths.iter().any(|p| p == &path) {
            continue;
        }
        debug!(?path, "configuration file changed");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Err(e) = reload_from_file(&config, &change_tx, &path).await {
            error!(error = %e, "configuration reload failed");
        }
    }

    Ok(())
}

async fn reload_from_file(
    config: &Arc<RwLock<Config>>,
    change_tx: &mpsc::UnboundedSender<ConfigChange>,
    path: &Path,
) -> Result<()> {
    let new_config = Config::load_from_file(path).await?;

    let mut guard = config.write().await;
    if let Some(reason) = new_config.rejects_reload_from(&guard) {
        warn!(reason, "reload rejected, state unchanged");
        return Err(FpsError::ConfigInvalid(reason));
    }

    let old_config = guard.clone();
    *guard = new_config.clone();
    drop(guard);

    info!(path = %path.display(), "configuration reloaded");
    let _ = change_tx.send(ConfigChange { old_config, new_config });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toml_with_addr(addr: &str) -> String {
        format!(
            r#"
            listen_addr = "{addr}"
            [mitm]
            ca_cert_path = "ca/fps-ca.pem"
            ca_key_path = "ca/fps-ca.key"
            domains = ["example.com"]
            "#
        )
    }

    #[tokio::test]
    async fn reload_from_file_rejects_listen_addr_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fps.toml");
        tokio::fs::write(&path, toml_with_addr("127.0.0.1:8080")).await.unwrap();

        let initial = Config::load_from_file(&path).await.unwrap();
        let mut reloader = ConfigReloader::new(initial, path.clone());
        let _rx = reloader.take_change_receiver();

        tokio::fs::write(&path, toml_with_addr("127.0.0.1:9090")).await.unwrap();
        let err = reloader.reload_now().await.unwrap_err();
        assert!(matches!(err, FpsError::ConfigInvalid(_)));
        assert_eq!(reloader.get_config().await.listen_addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn reload_from_file_applies_allowlist_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fps.toml");
        tokio::fs::write(&path, toml_with_addr("127.0.0.1:8080")).await.unwrap();

        let initial = Config::load_from_file(&path).await.unwrap();
        let mut reloader = ConfigReloader::new(initial, path.clone());
        let _rx = reloader.take_change_receiver();

        let mut content = toml_with_addr("127.0.0.1:8080");
        content.push_str("\nallowlist = [\"safe.example.com\"]\n");
        tokio::fs::write(&path, content).await.unwrap();

        reloader.reload_now().await.unwrap();
        assert_eq!(
            reloader.get_config().await.allowlist,
            vec!["safe.example.com".to_string()]
        );
    }
}
