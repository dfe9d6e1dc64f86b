use crate::application::services::context::AgentContext;
use crate::domain::repositories::{StateStore, StoreResult};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Debounced snapshot persistence. Bursts of `mark_dirty` calls within the
/// debounce window produce one write. A failed write is logged and the
/// in-memory state stays authoritative; the next change retries.
pub struct StateWriter {
    ctx: AgentContext,
    store: Arc<dyn StateStore>,
    debounce: Duration,
    dirty: Notify,
    saves: AtomicU64,
}

impl StateWriter {
    pub fn new(ctx: AgentContext, store: Arc<dyn StateStore>, debounce: Duration) -> Self {
        Self {
            ctx,
            store,
            debounce,
            dirty: Notify::new(),
            saves: AtomicU64::new(0),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    /// Number of snapshots written so far.
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub async fn flush_now(&self) -> StoreResult<()> {
        let snapshot = self.ctx.snapshot(Utc::now()).await;
        match self.store.save_snapshot(&snapshot).await {
            Ok(()) => {
                self.saves.fetch_add(1, Ordering::Relaxed);
                debug!("Snapshot persisted ({} position(s))", snapshot.positions.len());
                Ok(())
            }
            Err(e) => {
                error!("Failed to persist snapshot: {}", e);
                Err(e)
            }
        }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.dirty.notified() => {
                        tokio::select! {
                            _ = tokio::time::sleep(self.debounce) => {}
                            _ = shutdown.changed() => break,
                        }
                        let _ = self.flush_now().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("State writer stopped");
        })
    }
}
