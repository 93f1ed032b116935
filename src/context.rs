//! Process-wide state owned by the pipeline orchestrator.
//!
//! Holds the optimizer liveness flag and the shared read cache. It is
//! created once at startup, handed to the optimizer client and the object
//! store, and torn down explicitly with [`PipelineContext::shutdown`].

use crate::models::stored_object::StoredObject;
use moka::future::Cache;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Idle entries leave the read cache after this long.
const CACHE_IDLE: Duration = Duration::from_secs(15 * 60);

pub type ReadCache = Cache<String, Arc<StoredObject>>;

#[derive(Clone)]
pub struct PipelineContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    cache: ReadCache,
    optimizer_alive: AtomicBool,
    write_epoch: AtomicU64,
    shutdown: CancellationToken,
}

impl PipelineContext {
    pub fn new(cache_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(cache_capacity)
            .time_to_idle(CACHE_IDLE)
            .build();
        Self {
            inner: Arc::new(ContextInner {
                cache,
                optimizer_alive: AtomicBool::new(false),
                write_epoch: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn cache(&self) -> &ReadCache {
        &self.inner.cache
    }

    pub fn optimizer_alive(&self) -> bool {
        self.inner.optimizer_alive.load(Ordering::Acquire)
    }

    pub(crate) fn set_optimizer_alive(&self, alive: bool) {
        self.inner.optimizer_alive.store(alive, Ordering::Release);
    }

    /// Advances on every committed overwrite or delete. A reader that saw
    /// the epoch move while it was loading must not cache what it loaded.
    pub fn write_epoch(&self) -> u64 {
        self.inner.write_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_write_epoch(&self) {
        self.inner.write_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Token background tasks select on to stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop background tasks and drop every cached record.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.cache.invalidate_all();
        self.set_optimizer_alive(false);
        tracing::info!("pipeline context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_and_clears() {
        let ctx = PipelineContext::new(8);
        ctx.set_optimizer_alive(true);
        let token = ctx.shutdown_token();
        assert!(!token.is_cancelled());

        ctx.shutdown();

        assert!(token.is_cancelled());
        assert!(ctx.is_shut_down());
        assert!(!ctx.optimizer_alive());
    }
}
