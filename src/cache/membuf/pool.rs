//! Buffer Pool
//!
//! Fixed-capacity key index with paged space accounting.
//!
//! Capacity is split into pages and every part reserves a region of one
//! page through the [`PageAllocator`], so page geometry and fragmentation
//! decide what fits. The bytes of a part are its own immutable [`Bytes`]
//! buffer, moved in from the sealed transaction.
//!
//! # Locking
//!
//! ```text
//! reader:  index.read ─▶ touch + clone part handle ─▶ drop
//! commit:  index.write (evict + reserve + publish) ─▶ drop
//! ```
//!
//! The index lock guards bookkeeping only. Payloads are never copied under
//! it and no lock is shared between the payloads of different entries. A
//! reader keeps the handle it got even if the entry is replaced or evicted
//! right after.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use super::allocator::{PageAllocator, Region};
use crate::cache::backend::{EntryInfo, PartInfo};
use crate::cache::key::{CacheKey, PartTag};
use crate::cache::metrics::CacheMetrics;
use crate::cache::transaction::StagedPart;
use crate::error::{Error, Result};

/// Upper bound on the number of pages in one pool
pub const MAX_PAGES: u64 = 65_536;

/// Check a pool geometry, returning its page count
pub fn check_geometry(capacity: u64, page_size: u64) -> Result<u64> {
    if capacity == 0 {
        return Err(Error::InitError("buffer pool capacity must be positive".into()));
    }
    if page_size == 0 {
        return Err(Error::InitError("buffer pool page size must be positive".into()));
    }
    let page_size = page_size.min(capacity);
    let pages = capacity.div_ceil(page_size);
    if pages > MAX_PAGES {
        return Err(Error::InitError(format!(
            "{} pages of {} bytes exceed the limit of {} pages",
            pages, page_size, MAX_PAGES
        )));
    }
    Ok(pages)
}

/// One committed part
struct PoolPart {
    region: Region,
    data: Bytes,
}

/// A committed entry in the index
struct PoolEntry {
    parts: BTreeMap<PartTag, PoolPart>,
    /// Insertion order, breaks recency ties
    seq: u64,
    /// Logical access clock
    last_tick: AtomicU64,
    /// Wall clock of last access (epoch millis)
    last_access_ms: AtomicI64,
}

impl PoolEntry {
    fn new(seq: u64, tick: u64) -> Self {
        Self {
            parts: BTreeMap::new(),
            seq,
            last_tick: AtomicU64::new(tick),
            last_access_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    #[inline]
    fn touch(&self, tick: u64) {
        self.last_tick.fetch_max(tick, Ordering::Relaxed);
        self.last_access_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn size(&self) -> u64 {
        self.parts.values().map(|p| p.region.len).sum()
    }

    fn info(&self) -> EntryInfo {
        let millis = self.last_access_ms.load(Ordering::Relaxed);
        EntryInfo {
            parts: self
                .parts
                .iter()
                .map(|(tag, part)| PartInfo {
                    tag: *tag,
                    size: part.region.len,
                })
                .collect(),
            last_accessed: DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default(),
        }
    }
}

struct PoolIndex {
    entries: HashMap<CacheKey, PoolEntry>,
    allocator: PageAllocator,
    next_seq: u64,
}

impl PoolIndex {
    /// Keys ordered most- to least-recently used, so `pop` yields the LRU
    fn eviction_order(&self) -> Vec<CacheKey> {
        let mut candidates: Vec<(u64, u64, CacheKey)> = self
            .entries
            .iter()
            .map(|(key, e)| (e.last_tick.load(Ordering::Relaxed), e.seq, *key))
            .collect();
        candidates.sort_unstable_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        candidates.into_iter().map(|(_, _, key)| key).collect()
    }

    /// Remove an entry and free all of its regions
    fn evict(&mut self, key: &CacheKey) -> Option<u64> {
        let entry = self.entries.remove(key)?;
        let size = entry.size();
        for part in entry.parts.values() {
            self.allocator.free(part.region);
        }
        Some(size)
    }

    /// Swap reserved parts into the entry for `key`
    fn publish(&mut self, key: CacheKey, reserved: Vec<(PartTag, PoolPart)>, tick: u64) {
        let seq = self.next_seq;
        let next_seq = &mut self.next_seq;
        let entry = self.entries.entry(key).or_insert_with(|| {
            *next_seq += 1;
            PoolEntry::new(seq, tick)
        });

        for (tag, part) in reserved {
            if let Some(old) = entry.parts.insert(tag, part) {
                self.allocator.free(old.region);
            }
        }
        entry.touch(tick);
    }

    fn live_bytes(&self) -> u64 {
        self.entries.values().map(PoolEntry::size).sum()
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Entries evicted to make room, oldest first
    pub evicted: Vec<CacheKey>,
    /// Bytes committed
    pub bytes: u64,
}

/// Buffer pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Capacity in bytes
    pub capacity: u64,
    /// Allocated bytes
    pub used_bytes: u64,
    /// Bytes held by committed entries
    pub live_bytes: u64,
    /// Committed entries
    pub entries: usize,
    /// Page count
    pub pages: usize,
    /// Largest contiguous free block
    pub largest_free_block: u64,
}

/// Paged byte pool with LRU eviction
pub struct BufferPool {
    index: RwLock<PoolIndex>,
    clock: AtomicU64,
    capacity: u64,
    pages: usize,
    metrics: Arc<CacheMetrics>,
}

impl BufferPool {
    /// Create a pool of `capacity` bytes split into `page_size` pages
    pub fn new(capacity: u64, page_size: u64, metrics: Arc<CacheMetrics>) -> Result<Self> {
        check_geometry(capacity, page_size)?;
        let allocator = PageAllocator::new(capacity, page_size);
        let pages = allocator.page_sizes().len();
        Ok(Self {
            index: RwLock::new(PoolIndex {
                entries: HashMap::new(),
                allocator,
                next_seq: 0,
            }),
            clock: AtomicU64::new(0),
            capacity,
            pages,
            metrics,
        })
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Describe an entry, bumping its recency
    pub fn info(&self, key: &CacheKey) -> Option<EntryInfo> {
        let index = self.index.read();
        let entry = index.entries.get(key)?;
        entry.touch(self.tick());
        Some(entry.info())
    }

    /// Get one part, bumping the entry's recency
    pub fn read(&self, key: &CacheKey, tag: PartTag) -> Option<Bytes> {
        let index = self.index.read();
        let entry = index.entries.get(key)?;
        let part = entry.parts.get(&tag)?;
        entry.touch(self.tick());
        Some(part.data.clone())
    }

    /// Check if a key has a committed entry
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.read().entries.contains_key(key)
    }

    /// Atomically commit a set of parts for `key`.
    ///
    /// Tags already present on the entry but not in `parts` are kept. If the
    /// parts cannot fit after evicting every other committed entry, nothing
    /// is committed and `EntryTooLarge` is returned.
    pub fn commit(&self, key: CacheKey, parts: Vec<StagedPart>) -> Result<CommitOutcome> {
        if parts.is_empty() {
            return Ok(CommitOutcome::default());
        }

        let total: u64 = parts.iter().map(StagedPart::size).sum();
        let tick = self.tick();

        let mut index = self.index.write();
        let (reserved, evicted) = self.reserve(&mut index, parts, total)?;
        index.publish(key, reserved, tick);
        self.update_occupancy(&index);
        drop(index);

        debug!(key = %key, bytes = total, evicted = evicted.len(), "Committed entry");
        Ok(CommitOutcome {
            evicted,
            bytes: total,
        })
    }

    /// Evict as needed and reserve a region for every part
    #[allow(clippy::type_complexity)]
    fn reserve(
        &self,
        index: &mut PoolIndex,
        mut parts: Vec<StagedPart>,
        total: u64,
    ) -> Result<(Vec<(PartTag, PoolPart)>, Vec<CacheKey>)> {
        let too_large = || Error::EntryTooLarge {
            size: total,
            capacity: self.capacity,
        };

        if total > self.capacity || parts.iter().any(|p| p.size() > index.allocator.max_region())
        {
            return Err(too_large());
        }

        // Largest first packs better
        parts.sort_by(|a, b| b.size().cmp(&a.size()));

        let mut reserved: Vec<(PartTag, PoolPart)> = Vec::with_capacity(parts.len());
        let mut evicted = Vec::new();
        let mut order: Option<Vec<CacheKey>> = None;

        for part in parts {
            loop {
                if let Some(region) = index.allocator.allocate(part.size()) {
                    reserved.push((
                        part.tag,
                        PoolPart {
                            region,
                            data: part.data,
                        },
                    ));
                    break;
                }

                let order = order.get_or_insert_with(|| index.eviction_order());
                match order.pop() {
                    Some(victim) => {
                        if let Some(size) = index.evict(&victim) {
                            self.metrics.record_eviction(size);
                            debug!(key = %victim, bytes = size, "Evicted entry");
                            evicted.push(victim);
                        }
                    }
                    None => {
                        for (_, part) in reserved {
                            index.allocator.free(part.region);
                        }
                        warn!(bytes = total, capacity = self.capacity, "Entry does not fit after eviction");
                        self.update_occupancy(index);
                        return Err(too_large());
                    }
                }
            }
        }

        Ok((reserved, evicted))
    }

    fn update_occupancy(&self, index: &PoolIndex) {
        self.metrics
            .update_occupancy(index.live_bytes(), index.entries.len() as u64);
    }

    /// Current statistics
    pub fn stats(&self) -> PoolStats {
        let index = self.index.read();
        PoolStats {
            capacity: self.capacity,
            used_bytes: index.allocator.used_bytes(),
            live_bytes: index.live_bytes(),
            entries: index.entries.len(),
            pages: self.pages,
            largest_free_block: index.allocator.largest_free_block(),
        }
    }

    /// Keys from least- to most-recently used
    pub fn lru_keys(&self) -> Vec<CacheKey> {
        let mut keys = self.index.read().eviction_order();
        keys.reverse();
        keys
    }
}

// =============================================================================
// Tests
// =============================================================================
