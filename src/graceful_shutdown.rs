//! Graceful shutdown coordinator: stop
//! accepting new connections, wait up to the configured timeout for
//! in-flight handlers, force-close stragglers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{error, info, warn};

type ShutdownResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
type ShutdownFn = Box<dyn Fn() -> tokio::task::JoinHandle<ShutdownResult> + Send + Sync>;

struct ShutdownComponent {
    name: String,
    shutdown_fn: ShutdownFn,
}

/// Broadcasts a shutdown signal to every listener loop and waits for
/// registered components (blocklist updater, stats flush loop, MITM
/// session trackers) to finish within a bound.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    components: Arc<Mutex<Vec<ShutdownComponent>>>,
    timeout: Duration,
}

impl GracefulShutdown {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            components: Arc::new(Mutex::new(Vec::new())),
            timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub async fn register_component<F, Fut>(&self, name: String, shutdown_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ShutdownResult> + Send + 'static,
    {
        let component = ShutdownComponent {
            name,
            shutdown_fn: Box::new(move || tokio::spawn(shutdown_fn())),
        };
        self.components.lock().await.push(component);
    }

    /// Signal shutdown, then wait (bounded by `timeout`) for every
    /// registered component to finish. Stragglers are logged and
    /// abandoned, not awaited further — their sockets are forcibly
    /// closed when the process's handlers are dropped.
    pub async fn shutdown(&self) -> ShutdownResult {
        info!("initiating graceful shutdown");

        if self.shutdown_tx.send(()).is_err() {
            warn!("no active listeners were subscribed to the shutdown signal");
        }

        let components = self.components.lock().await;
        let mut handles = Vec::with_capacity(components.len());
        for component in components.iter() {
            info!(component = %component.name, "shutting down component");
            handles.push((component.name.clone(), (component.shutdown_fn)()));
        }
        drop(components);

        for (name, handle) in handles {
            match timeout(self.timeout, handle).await {
                Ok(Ok(Ok(()))) => info!(component = %name, "component shut down cleanly"),
                Ok(Ok(Err(e))) => error!(component = %name, error = %e, "component shutdown failed"),
                Ok(Err(e)) => error!(component = %name, error = %e, "component shutdown task panicked"),
                Err(_) => warn!(component = %name, "component shutdown timed out, abandoning"),
            }
        }

        info!("graceful shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn shutdown_runs_registered_components() {
        let gs = GracefulShutdown::new(Duration::from_secs(1));
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        gs.register_component("test".to_string(), move || {
            let ran = ran_clone.clone();
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        gs.shutdown().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_times_out_slow_components_without_panicking() {
        let gs = GracefulShutdown::new(Duration::from_millis(50));
        gs.register_component("slow".to_string(), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        gs.shutdown().await.unwrap();
    }
}
