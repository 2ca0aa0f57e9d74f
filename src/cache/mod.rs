//! Artifact Cache Engine
//!
//! Backend contract plus the two built-in backends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        CacheBackend contract                         │
//! │  init · shutdown · get_info · get_read_stream                        │
//! │  create_transaction · end_transaction · register_worker              │
//! ├───────────────────────┬───────────────────────┬──────────────────────┤
//! │ MembufBackend         │ FsBackend             │ ClusterWorker        │
//! │ (cache_membuf)        │ (cache_fs)            │ (proxy)              │
//! │ ┌───────────────────┐ │ ┌───────────────────┐ │ ┌──────────────────┐ │
//! │ │ BufferPool        │ │ │ file per part     │ │ │ channel to the   │ │
//! │ │ page quota + LRU  │ │ │ temp + rename     │ │ │ coordinator      │ │
//! │ └───────────────────┘ │ └───────────────────┘ │ └──────────────────┘ │
//! └───────────────────────┴───────────────────────┴──────────────────────┘
//!                                   │
//!                     PutTransaction (staging, seal)
//! ```
//!
//! Every write goes through a [`PutTransaction`]: parts are staged in memory
//! and only become visible when the backend finalizes the transaction.

pub mod backend;
pub mod fs;
pub mod key;
pub mod membuf;
pub mod metrics;
pub mod options;
pub mod transaction;

pub use backend::{CacheBackend, CacheBase, EntryInfo, PartInfo, ReadStream, UnimplementedCache};
pub use fs::FsBackend;
pub use key::{CacheKey, PartTag, PartTagSet, GUID_SIZE, HASH_SIZE};
pub use membuf::{BufferPool, MembufBackend, PoolStats};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use options::{
    default_options, CacheOptions, FsOptions, MembufOptions, OptionsBuilder, CACHE_FS,
    CACHE_MEMBUF, CACHE_PATH_OPTION, OPTIONS_NAMESPACE,
};
pub use transaction::{PartWriter, PutTransaction, StagedPart, TransactionState};

/// Create a backend by name
pub fn backend_by_name(name: &str) -> crate::error::Result<std::sync::Arc<dyn CacheBackend>> {
    match name {
        CACHE_MEMBUF => Ok(std::sync::Arc::new(MembufBackend::new())),
        CACHE_FS => Ok(std::sync::Arc::new(FsBackend::new())),
        other => Err(crate::error::Error::Config(format!(
            "unknown cache backend '{}'",
            other
        ))),
    }
}
