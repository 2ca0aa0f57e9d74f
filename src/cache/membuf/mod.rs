//! LRU Buffer-Pool Backend
//!
//! Memory-only backend (`cache_membuf`). Entries live in a fixed-capacity
//! [`BufferPool`]; when space runs out whole entries are evicted in least
//! recently used order. Contents are lost on shutdown.
//!
//! With `cluster` enabled the backend accepts worker channels through
//! [`CacheBackend::register_worker`] and serves them from the same pool.

pub mod allocator;
pub mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

pub use allocator::{PageAllocator, Region};
pub use pool::{BufferPool, CommitOutcome, PoolStats, MAX_PAGES};

use super::backend::{CacheBackend, CacheBase, EntryInfo, ReadStream};
use super::key::{CacheKey, PartTag};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::options::{CacheOptions, MembufOptions, CACHE_MEMBUF};
use super::transaction::PutTransaction;
use crate::cluster::{coordinator, WorkerHandle};
use crate::error::{Error, Result};

struct PoolState {
    pool: Arc<BufferPool>,
    options: MembufOptions,
}

struct Inner {
    base: CacheBase,
    state: RwLock<Option<PoolState>>,
    metrics: Arc<CacheMetrics>,
}

/// Buffer-pool cache backend. Clones share the same pool.
#[derive(Clone)]
pub struct MembufBackend {
    inner: Arc<Inner>,
}

impl MembufBackend {
    /// Create an uninitialized backend
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                base: CacheBase::new(CACHE_MEMBUF),
                state: RwLock::new(None),
                metrics: Arc::new(CacheMetrics::new()),
            }),
        }
    }

    fn pool(&self) -> Result<Arc<BufferPool>> {
        self.inner
            .state
            .read()
            .as_ref()
            .map(|s| Arc::clone(&s.pool))
            .ok_or_else(|| Error::InitError(format!("{} is not initialized", CACHE_MEMBUF)))
    }

    fn options(&self) -> Option<MembufOptions> {
        self.inner.state.read().as_ref().map(|s| s.options.clone())
    }

    /// Pool statistics, if initialized
    pub fn stats(&self) -> Option<PoolStats> {
        self.pool().ok().map(|pool| pool.stats())
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> Arc<CacheMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Metrics snapshot
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl Default for MembufBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MembufBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembufBackend")
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl CacheBackend for MembufBackend {
    fn name(&self) -> &'static str {
        CACHE_MEMBUF
    }

    async fn init(&self, options: &CacheOptions) -> Result<()> {
        let membuf: MembufOptions = options.backend(CACHE_MEMBUF)?;
        pool::check_geometry(membuf.capacity, membuf.page_size)?;
        if membuf.part_tags.is_empty() {
            return Err(Error::InitError("at least one part tag is required".into()));
        }

        self.inner.base.init(options).await?;

        let mut state = self.inner.state.write();
        match state.as_mut() {
            Some(existing) => {
                if existing.options.capacity != membuf.capacity
                    || existing.options.page_size != membuf.page_size
                {
                    warn!(
                        capacity = membuf.capacity,
                        page_size = membuf.page_size,
                        "Buffer pool already allocated, new geometry applies after shutdown"
                    );
                }
                existing.options.part_tags = membuf.part_tags;
                existing.options.cluster = membuf.cluster;
                debug!("Buffer pool already initialized");
            }
            None => {
                let pool = BufferPool::new(
                    membuf.capacity,
                    membuf.page_size,
                    Arc::clone(&self.inner.metrics),
                )?;
                info!(
                    capacity = membuf.capacity,
                    page_size = membuf.page_size,
                    pages = pool.stats().pages,
                    cluster = membuf.cluster,
                    "Buffer pool initialized"
                );
                *state = Some(PoolState {
                    pool: Arc::new(pool),
                    options: membuf,
                });
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let previous = self.inner.state.write().take();
        self.inner.base.reset();
        if let Some(state) = previous {
            let stats = state.pool.stats();
            self.inner.metrics.update_occupancy(0, 0);
            info!(
                entries = stats.entries,
                bytes = stats.live_bytes,
                "Buffer pool released"
            );
        }
        Ok(())
    }

    async fn get_info(&self, key: &CacheKey) -> Result<Option<EntryInfo>> {
        let info = self.pool()?.info(key);
        debug!(key = %key, found = info.is_some(), "get_info");
        Ok(info)
    }

    async fn get_read_stream(&self, key: &CacheKey, tag: PartTag) -> Result<ReadStream> {
        let pool = self.pool()?;
        if let Some(options) = self.options() {
            options.part_tags.validate(tag)?;
        }

        match pool.read(key, tag) {
            Some(data) => {
                self.inner.metrics.record_hit(data.len() as u64);
                debug!(key = %key, part = %tag, bytes = data.len(), "Read hit");
                Ok(ReadStream::from_bytes(data))
            }
            None => {
                self.inner.metrics.record_miss();
                debug!(key = %key, part = %tag, "Read miss");
                Err(Error::NotFound(format!("{}/{}", key, tag)))
            }
        }
    }

    async fn create_transaction(&self, key: CacheKey) -> Result<PutTransaction> {
        let options = self
            .options()
            .ok_or_else(|| Error::InitError(format!("{} is not initialized", CACHE_MEMBUF)))?;
        Ok(PutTransaction::new(key, options.part_tags))
    }

    async fn end_transaction(&self, trx: &PutTransaction) -> Result<()> {
        let tracker = LatencyTracker::start();
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(e) => {
                let _ = trx.abandon();
                return Err(e);
            }
        };

        let parts = match trx.seal() {
            Ok(parts) => parts,
            Err(e) => {
                self.inner.metrics.record_abort();
                debug!(trx = %trx.id(), key = %trx.key(), error = %e, "Seal failed");
                return Err(e);
            }
        };

        match pool.commit(*trx.key(), parts) {
            Ok(outcome) => {
                trx.mark_committed()?;
                self.inner
                    .metrics
                    .record_commit(outcome.bytes, tracker.elapsed());
                if !outcome.evicted.is_empty() {
                    debug!(key = %trx.key(), evicted = outcome.evicted.len(), "Commit evicted entries");
                }
                Ok(())
            }
            Err(e) => {
                trx.fail();
                self.inner.metrics.record_abort();
                warn!(trx = %trx.id(), key = %trx.key(), error = %e, "Commit rejected");
                Err(e)
            }
        }
    }

    fn register_worker(&self, worker: WorkerHandle) -> Result<()> {
        let cluster = self.options().map(|o| o.cluster).unwrap_or(false);
        if !cluster {
            return Err(Error::Config(format!(
                "{} cluster coordination is disabled",
                CACHE_MEMBUF
            )));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::InitError(format!("no async runtime for worker channel: {}", e)))?;

        info!(worker = %worker.label(), "Registered cluster worker");
        let backend: Arc<dyn CacheBackend> = Arc::new(self.clone());
        runtime.spawn(coordinator::serve(backend, worker));
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
