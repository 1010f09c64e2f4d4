// file: src/cache/index_manager.rs
// version: 1.1.0
// guid: 6a0c3f8e-9b4d-4e21-85f7-2d1b9e6c4a03

//! Background refresh of a cache's tag index

use super::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default refresh interval
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Rebuilds a cache's index on a fixed cadence until stopped
pub struct IndexManager {
    cache: Arc<dyn Cache>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl IndexManager {
    pub fn new(cache: Arc<dyn Cache>, interval: Duration) -> Self {
        Self {
            cache,
            interval: if interval.is_zero() { DEFAULT_REFRESH_INTERVAL } else { interval },
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Launch the refresh task; a second call while running does nothing
    ///
    /// The task also stops when `parent` is cancelled.
    pub async fn start(&self, parent: &CancellationToken) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Index manager already running");
            return;
        }

        let cancel = parent.child_token();
        let handle = tokio::spawn(refresh_loop(Arc::clone(&self.cache), self.interval, cancel.clone()));
        *running = Some(Running { cancel, handle });
    }

    /// Cancel the task and wait for it to exit; no-op when not started
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else { return };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!("Index refresh task ended abnormally: {}", e);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

async fn refresh_loop(cache: Arc<dyn Cache>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        location = %cache.location(),
        interval_secs = period.as_secs(),
        "Index refresh task started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(location = %cache.location(), "Index refresh task shutting down");
                break;
            }
            _ = ticker.tick() => {
                match cache.rebuild_index(&cancel).await {
                    Ok(()) => debug!(location = %cache.location(), "Index refreshed"),
                    Err(e) if cancel.is_cancelled() => debug!("Index refresh interrupted: {}", e),
                    Err(e) => warn!(location = %cache.location(), error = %e, "Index refresh failed"),
                }
            }
        }
    }
}
