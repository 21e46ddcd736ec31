use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::WaitHandleRegistry;

/// Background task that ages out pending handles whether or not anyone is
/// waiting on them, and purges old terminal handles.
pub struct HandleSweeper {
    registry: Arc<WaitHandleRegistry>,
    cancel: CancellationToken,
}

impl HandleSweeper {
    pub fn new(registry: Arc<WaitHandleRegistry>, cancel: CancellationToken) -> Self {
        Self { registry, cancel }
    }

    /// Run the sweep loop. Blocks until cancelled.
    pub async fn run(&self) {
        let interval = Duration::from_millis(self.registry.config().sweep_interval_ms.max(1));
        info!(interval_ms = interval.as_millis() as u64, "Handle sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Handle sweeper shutting down");
                    break;
                }
            }

            let report = self.registry.sweep().await;
            if report.timed_out > 0 || report.purged > 0 {
                debug!(
                    timed_out = report.timed_out,
                    purged = report.purged,
                    "Sweep pass complete"
                );
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }
}

impl WaitHandleRegistry {
    /// Start the background sweeper for this registry.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        HandleSweeper::new(self.clone(), cancel).spawn()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use weaver_core::config::HandleConfig;
    use weaver_core::event::EventBus;
    use weaver_core::types::HandleStatus;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sweeper_times_out_unwatched_handles() {
        let config = HandleConfig {
            sweep_interval_ms: 10,
            ..HandleConfig::default()
        };
        let registry = Arc::new(WaitHandleRegistry::new(config, Arc::new(EventBus::default())));
        let cancel = CancellationToken::new();
        let task = registry.spawn_sweeper(cancel.clone());

        registry
            .create("lonely", "external_call", Some(Duration::from_millis(25)), Default::default())
            .await
            .unwrap();
        let token = registry.token("lonely").await.unwrap();

        // Nobody polls; the sweeper alone must fire the timeout.
        tokio::time::sleep(Duration::from_millis(45)).await;
        assert!(token.is_cancelled());

        cancel.cancel();
        task.await.unwrap();

        let listed = registry
            .list(&crate::handles::HandleFilter::status(HandleStatus::Timeout))
            .await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "lonely");
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let registry = Arc::new(WaitHandleRegistry::new(
            HandleConfig::default(),
            Arc::new(EventBus::default()),
        ));
        let cancel = CancellationToken::new();
        let task = registry.spawn_sweeper(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper should exit promptly")
            .unwrap();
    }
}
