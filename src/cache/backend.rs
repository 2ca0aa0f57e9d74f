//! Cache Backend Contract
//!
//! The capability set every backend provides. Contract operations are
//! required trait methods; only `register_worker` has a default, which
//! fails so that backends opt into cluster participation explicitly.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::info;

use super::key::{CacheKey, PartTag};
use super::options::CacheOptions;
use super::transaction::PutTransaction;
use crate::cluster::WorkerHandle;
use crate::error::{Error, Result};

/// Pluggable cache backend
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name, matching its section in the options map
    fn name(&self) -> &'static str;

    /// Idempotent setup
    async fn init(&self, options: &CacheOptions) -> Result<()>;

    /// Release all resources
    async fn shutdown(&self) -> Result<()>;

    /// Describe what is committed for `key`; `None` if nothing is
    async fn get_info(&self, key: &CacheKey) -> Result<Option<EntryInfo>>;

    /// Single-pass reader over one committed part
    async fn get_read_stream(&self, key: &CacheKey, tag: PartTag) -> Result<ReadStream>;

    /// Start a transaction for `key`
    async fn create_transaction(&self, key: CacheKey) -> Result<PutTransaction>;

    /// Finalize a transaction, making its parts visible together
    async fn end_transaction(&self, trx: &PutTransaction) -> Result<()>;

    /// Attach a cluster worker channel. Synchronous so wiring failures
    /// surface at the call site during startup.
    fn register_worker(&self, _worker: WorkerHandle) -> Result<()> {
        Err(Error::not_implemented(self.name(), "register_worker"))
    }
}

/// Size of one committed part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    /// Part tag
    pub tag: PartTag,
    /// Size in bytes
    pub size: u64,
}

/// Descriptor of a committed entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// Committed parts, ordered by tag
    pub parts: Vec<PartInfo>,
    /// Last access time
    pub last_accessed: DateTime<Utc>,
}

impl EntryInfo {
    /// Total size across parts
    pub fn size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    /// Size of one part, if present
    pub fn part_size(&self, tag: PartTag) -> Option<u64> {
        self.parts.iter().find(|p| p.tag == tag).map(|p| p.size)
    }

    /// Check if a part is present
    pub fn has_part(&self, tag: PartTag) -> bool {
        self.part_size(tag).is_some()
    }
}

/// Finite, single-pass byte stream for one part
pub struct ReadStream {
    size: u64,
    reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl ReadStream {
    /// Stream over an owned copy of the bytes
    pub fn from_bytes(data: Bytes) -> Self {
        Self {
            size: data.len() as u64,
            reader: Box::pin(io::Cursor::new(data)),
        }
    }

    /// Stream over any reader of known size
    pub fn from_reader(size: u64, reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            size,
            reader: Box::pin(reader),
        }
    }

    /// Total size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drain the stream into memory
    pub async fn read_all(mut self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.size as usize);
        self.reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

impl AsyncRead for ReadStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.reader.as_mut().poll_read(cx, buf)
    }
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream").field("size", &self.size).finish()
    }
}

/// State shared by every backend: options and working directory
pub struct CacheBase {
    name: &'static str,
    options: RwLock<Option<CacheOptions>>,
    cache_path: RwLock<Option<PathBuf>>,
}

impl CacheBase {
    /// Create base state for the named backend
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            options: RwLock::new(None),
            cache_path: RwLock::new(None),
        }
    }

    /// Store options and make sure the working directory exists
    pub async fn init(&self, options: &CacheOptions) -> Result<Option<PathBuf>> {
        let cache_path = options.resolved_cache_path();

        if let Some(path) = &cache_path {
            tokio::fs::create_dir_all(path).await.map_err(|e| {
                Error::InitError(format!(
                    "cannot create cache directory {}: {}",
                    path.display(),
                    e
                ))
            })?;
            info!(backend = self.name, path = %path.display(), "Cache directory ready");
        }

        *self.options.write() = Some(options.clone());
        *self.cache_path.write() = cache_path.clone();
        Ok(cache_path)
    }

    /// Backend name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Options passed to `init`, or the defaults before that
    pub fn options(&self) -> CacheOptions {
        self.options
            .read()
            .clone()
            .unwrap_or_else(CacheOptions::defaults)
    }

    /// Resolved working directory
    pub fn cache_path(&self) -> Option<PathBuf> {
        self.cache_path.read().clone()
    }

    /// Whether `init` has run
    pub fn is_initialized(&self) -> bool {
        self.options.read().is_some()
    }

    /// Forget options and path
    pub fn reset(&self) {
        *self.options.write() = None;
        *self.cache_path.write() = None;
    }
}

/// Baseline backend: sets up the working directory on `init` and fails
/// every other operation with `NotImplemented`.
pub struct UnimplementedCache {
    base: CacheBase,
}

impl UnimplementedCache {
    /// Backend name
    pub const NAME: &'static str = "cache_base";

    /// Create the baseline backend
    pub fn new() -> Self {
        Self {
            base: CacheBase::new(Self::NAME),
        }
    }

    /// Shared base state
    pub fn base(&self) -> &CacheBase {
        &self.base
    }
}

impl Default for UnimplementedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for UnimplementedCache {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn init(&self, options: &CacheOptions) -> Result<()> {
        self.base.init(options).await.map(|_| ())
    }

    async fn shutdown(&self) -> Result<()> {
        Err(Error::not_implemented(Self::NAME, "shutdown"))
    }

    async fn get_info(&self, _key: &CacheKey) -> Result<Option<EntryInfo>> {
        Err(Error::not_implemented(Self::NAME, "get_info"))
    }

    async fn get_read_stream(&self, _key: &CacheKey, _tag: PartTag) -> Result<ReadStream> {
        Err(Error::not_implemented(Self::NAME, "get_read_stream"))
    }

    async fn create_transaction(&self, _key: CacheKey) -> Result<PutTransaction> {
        Err(Error::not_implemented(Self::NAME, "create_transaction"))
    }

    async fn end_transaction(&self, _trx: &PutTransaction) -> Result<()> {
        Err(Error::not_implemented(Self::NAME, "end_transaction"))
    }
}

// =============================================================================
// Tests
// =============================================================================
