//! assetcache - Pluggable Content-Addressed Artifact Cache
//!
//! Stores build artifacts keyed by a content guid plus a version hash. Each
//! artifact is a small set of tagged parts (info, binary, resource) written
//! through a staged transaction and made visible all at once.
//!
//! # Architecture
//!
//! ```text
//! protocol layer ──▶ CacheBackend ──┬─▶ MembufBackend (LRU buffer pool)
//!                                   ├─▶ FsBackend (file per part)
//!                                   └─▶ ClusterWorker ──channel──▶ coordinator
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Keys, backend contract, transactions and the built-in backends
//! - [`cluster`] - Coordinator election and worker forwarding
//! - [`error`] - Error types

pub mod cache;
pub mod cluster;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheBackend, CacheKey, CacheOptions, EntryInfo, FsBackend, MembufBackend, OptionsBuilder,
    PartTag, PutTransaction, ReadStream,
};
pub use cluster::{ClusterWorker, WorkerHandle};
pub use error::{Error, Result};
