//! Put Transactions
//!
//! Staged multi-part writes. A transaction collects part payloads without
//! touching any backend state; the backend's `end_transaction` seals it and
//! swaps the staged parts in.
//!
//! ```text
//! Open ──write──▶ Writing ──seal──▶ Finalizing ──▶ Committed
//!   │                │                  │
//!   └── abandon ─────┴──▶ Abandoned ◀───┘ commit failed
//! ```
//!
//! Once sealed, only the backend finishing the commit moves the transaction
//! on. A caller can no longer abandon it.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tracing::debug;
use uuid::Uuid;

use super::key::{CacheKey, PartTag, PartTagSet};
use crate::error::{Error, Result};

/// Upper bound on buffer space reserved up front for a part
const MAX_PREALLOCATION: u64 = 4 * 1024 * 1024;

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, nothing written yet
    Open,
    /// At least one write sink requested
    Writing,
    /// Sealed by the backend, commit in progress
    Finalizing,
    /// Parts are visible
    Committed,
    /// Staged bytes discarded
    Abandoned,
}

impl TransactionState {
    /// Committed or abandoned
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Abandoned)
    }

    /// Writable states
    fn accepts_writes(&self) -> bool {
        matches!(self, TransactionState::Open | TransactionState::Writing)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Open => write!(f, "open"),
            TransactionState::Writing => write!(f, "writing"),
            TransactionState::Finalizing => write!(f, "finalizing"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// A sealed part ready to be committed
#[derive(Debug, Clone)]
pub struct StagedPart {
    /// Part tag
    pub tag: PartTag,
    /// Part payload
    pub data: Bytes,
}

impl StagedPart {
    /// Payload size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

struct PartBuffer {
    expected: u64,
    data: BytesMut,
    closed: bool,
}

struct Inner {
    state: TransactionState,
    parts: BTreeMap<PartTag, PartBuffer>,
}

/// Staging object bound to one key
pub struct PutTransaction {
    id: Uuid,
    key: CacheKey,
    tags: PartTagSet,
    created_at: DateTime<Utc>,
    inner: Arc<Mutex<Inner>>,
}

impl PutTransaction {
    /// Create a transaction accepting the given part tags
    pub fn new(key: CacheKey, tags: PartTagSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            tags,
            created_at: Utc::now(),
            inner: Arc::new(Mutex::new(Inner {
                state: TransactionState::Open,
                parts: BTreeMap::new(),
            })),
        }
    }

    /// Transaction id
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Key this transaction writes
    #[inline]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Tags a write sink was requested for
    pub fn parts(&self) -> Vec<PartTag> {
        self.inner.lock().parts.keys().copied().collect()
    }

    /// Open a write sink for one part of `size` bytes
    pub fn get_write_stream(&self, tag: PartTag, size: u64) -> Result<PartWriter> {
        self.tags.validate(tag)?;

        let mut inner = self.inner.lock();
        if !inner.state.accepts_writes() {
            return Err(Error::TransactionClosed(self.id));
        }
        if inner.parts.contains_key(&tag) {
            return Err(Error::DuplicatePart(tag.as_char()));
        }

        inner.parts.insert(
            tag,
            PartBuffer {
                expected: size,
                data: BytesMut::with_capacity(size.min(MAX_PREALLOCATION) as usize),
                closed: false,
            },
        );
        inner.state = TransactionState::Writing;

        debug!(trx = %self.id, key = %self.key, part = %tag, size, "Opened write stream");

        Ok(PartWriter {
            trx: self.id,
            tag,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Seal the transaction for commit.
    ///
    /// Every sink must have been closed with exactly its announced size.
    /// On failure the transaction is abandoned.
    pub fn seal(&self) -> Result<Vec<StagedPart>> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_writes() {
            return Err(Error::TransactionClosed(self.id));
        }
        inner.state = TransactionState::Finalizing;

        let incomplete = inner.parts.iter().find_map(|(tag, part)| {
            let written = part.data.len() as u64;
            if !part.closed {
                Some((*tag, format!("stream not closed ({} bytes written)", written)))
            } else if written != part.expected {
                Some((
                    *tag,
                    format!("closed after {} of {} bytes", written, part.expected),
                ))
            } else {
                None
            }
        });

        if let Some((tag, reason)) = incomplete {
            inner.state = TransactionState::Abandoned;
            inner.parts.clear();
            return Err(Error::IncompleteWrite {
                part: tag.as_char(),
                reason,
            });
        }

        let parts = std::mem::take(&mut inner.parts)
            .into_iter()
            .map(|(tag, part)| StagedPart {
                tag,
                data: part.data.freeze(),
            })
            .collect();
        Ok(parts)
    }

    /// Mark a sealed transaction committed
    pub fn mark_committed(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Finalizing {
            return Err(Error::TransactionClosed(self.id));
        }
        inner.state = TransactionState::Committed;
        Ok(())
    }

    /// Abandon an unsealed transaction, discarding all staged bytes
    pub fn abandon(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_writes() {
            return Err(Error::TransactionClosed(self.id));
        }
        inner.state = TransactionState::Abandoned;
        inner.parts.clear();
        debug!(trx = %self.id, key = %self.key, "Transaction abandoned");
        Ok(())
    }

    /// End a transaction whose commit did not happen. Unlike `abandon` this
    /// also accepts a sealed transaction; committed ones are left alone.
    pub(crate) fn fail(&self) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = TransactionState::Abandoned;
        inner.parts.clear();
        debug!(trx = %self.id, key = %self.key, "Transaction failed");
    }
}

impl std::fmt::Debug for PutTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutTransaction")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("parts", &self.parts())
            .finish()
    }
}

/// Write sink for one part of a transaction
pub struct PartWriter {
    trx: Uuid,
    tag: PartTag,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for PartWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartWriter")
            .field("trx", &self.trx)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

impl PartWriter {
    /// Part tag this sink writes
    pub fn tag(&self) -> PartTag {
        self.tag
    }

    /// Append bytes to the part
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_writes() {
            return Err(Error::TransactionClosed(self.trx));
        }
        let part = inner
            .parts
            .get_mut(&self.tag)
            .ok_or(Error::TransactionClosed(self.trx))?;
        if part.closed {
            return Err(Error::TransactionClosed(self.trx));
        }

        let total = part.data.len() as u64 + chunk.len() as u64;
        if total > part.expected {
            return Err(Error::SizeMismatch {
                part: self.tag.as_char(),
                expected: part.expected,
                actual: total,
            });
        }
        part.data.extend_from_slice(chunk);
        Ok(())
    }

    /// Close the sink. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_writes() {
            return Err(Error::TransactionClosed(self.trx));
        }
        if let Some(part) = inner.parts.get_mut(&self.tag) {
            part.closed = true;
        }
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.inner
            .lock()
            .parts
            .get(&self.tag)
            .map(|p| p.data.len() as u64)
            .unwrap_or(0)
    }
}

impl AsyncWrite for PartWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Poll::Ready(this.write(buf).map(|_| buf.len()).map_err(io::Error::other))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.get_mut().close().map_err(io::Error::other))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::AsyncWriteExt;

    fn make_key() -> CacheKey {
        CacheKey::new(&[1u8; 16], &[2u8; 16]).unwrap()
    }

    fn make_trx() -> PutTransaction {
        PutTransaction::new(make_key(), PartTagSet::default())
    }

    #[test]
    fn test_new_transaction() {
        let trx = make_trx();
        assert_eq!(trx.key(), &make_key());
        assert_eq!(trx.state(), TransactionState::Open);
        assert!(trx.parts().is_empty());
    }

    #[test]
    fn test_write_and_seal() {
        let trx = make_trx();
        let mut writer = trx.get_write_stream(PartTag::BINARY, 5).unwrap();
        assert_eq!(trx.state(), TransactionState::Writing);

        writer.write(b"he").unwrap();
        writer.write(b"llo").unwrap();
        assert_eq!(writer.written(), 5);
        writer.close().unwrap();

        let parts = trx.seal().unwrap();
        assert_eq!(trx.state(), TransactionState::Finalizing);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].tag, PartTag::BINARY);
        assert_eq!(parts[0].data.as_ref(), b"hello");

        trx.mark_committed().unwrap();
        assert_eq!(trx.state(), TransactionState::Committed);
    }

    #[test]
    fn test_duplicate_part() {
        let trx = make_trx();
        let _writer = trx.get_write_stream(PartTag::INFO, 1).unwrap();
        assert_matches!(
            trx.get_write_stream(PartTag::INFO, 1),
            Err(Error::DuplicatePart('i'))
        );
    }

    #[test]
    fn test_invalid_tag() {
        let trx = make_trx();
        let tag = PartTag::new('z').unwrap();
        assert_matches!(trx.get_write_stream(tag, 1), Err(Error::InvalidPartTag('z')));
    }

    #[test]
    fn test_unclosed_stream_is_incomplete() {
        let trx = make_trx();
        let mut writer = trx.get_write_stream(PartTag::INFO, 3).unwrap();
        writer.write(b"abc").unwrap();

        assert_matches!(trx.seal(), Err(Error::IncompleteWrite { part: 'i', .. }));
        assert_eq!(trx.state(), TransactionState::Abandoned);
    }

    #[test]
    fn test_short_write_is_incomplete() {
        let trx = make_trx();
        let mut writer = trx.get_write_stream(PartTag::RESOURCE, 10).unwrap();
        writer.write(b"abc").unwrap();
        writer.close().unwrap();

        assert_matches!(trx.seal(), Err(Error::IncompleteWrite { part: 'r', .. }));
    }

    #[test]
    fn test_overflow_is_rejected() {
        let trx = make_trx();
        let mut writer = trx.get_write_stream(PartTag::BINARY, 2).unwrap();
        assert_matches!(
            writer.write(b"abc"),
            Err(Error::SizeMismatch {
                expected: 2,
                actual: 3,
                ..
            })
        );
        // Nothing was appended
        assert_eq!(writer.written(), 0);
    }

    #[test]
    fn test_write_after_close() {
        let trx = make_trx();
        let mut writer = trx.get_write_stream(PartTag::BINARY, 2).unwrap();
        writer.close().unwrap();
        assert_matches!(writer.write(b"a"), Err(Error::TransactionClosed(_)));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let trx = make_trx();
        let mut writer = trx.get_write_stream(PartTag::INFO, 1).unwrap();
        trx.abandon().unwrap();

        assert_matches!(writer.write(b"x"), Err(Error::TransactionClosed(_)));
        assert_matches!(
            trx.get_write_stream(PartTag::BINARY, 1),
            Err(Error::TransactionClosed(_))
        );
        assert_matches!(trx.seal(), Err(Error::TransactionClosed(_)));
        assert_matches!(trx.abandon(), Err(Error::TransactionClosed(_)));
        assert!(trx.parts().is_empty());
    }

    #[test]
    fn test_seal_twice() {
        let trx = make_trx();
        trx.seal().unwrap();
        assert_matches!(trx.seal(), Err(Error::TransactionClosed(_)));
        trx.mark_committed().unwrap();
        assert_matches!(trx.mark_committed(), Err(Error::TransactionClosed(_)));
    }

    #[test]
    fn test_sealed_transaction_cannot_be_abandoned() {
        let trx = make_trx();
        let mut writer = trx.get_write_stream(PartTag::INFO, 1).unwrap();
        writer.write(b"x").unwrap();
        writer.close().unwrap();
        trx.seal().unwrap();

        assert_matches!(trx.abandon(), Err(Error::TransactionClosed(_)));
        assert_eq!(trx.state(), TransactionState::Finalizing);
        trx.mark_committed().unwrap();
        assert_eq!(trx.state(), TransactionState::Committed);
    }

    #[test]
    fn test_failed_commit_abandons_sealed_transaction() {
        let trx = make_trx();
        trx.seal().unwrap();
        trx.fail();
        assert_eq!(trx.state(), TransactionState::Abandoned);
        assert_matches!(trx.mark_committed(), Err(Error::TransactionClosed(_)));

        // No effect once committed
        let trx = make_trx();
        trx.seal().unwrap();
        trx.mark_committed().unwrap();
        trx.fail();
        assert_eq!(trx.state(), TransactionState::Committed);
    }

    #[test]
    fn test_empty_transaction_seals() {
        let trx = make_trx();
        let parts = trx.seal().unwrap();
        assert!(parts.is_empty());
    }

    #[test]
    fn test_zero_length_part() {
        let trx = make_trx();
        let mut writer = trx.get_write_stream(PartTag::INFO, 0).unwrap();
        writer.close().unwrap();
        let parts = trx.seal().unwrap();
        assert_eq!(parts[0].size(), 0);
    }

    #[tokio::test]
    async fn test_async_write() {
        let trx = make_trx();
        let mut writer = trx.get_write_stream(PartTag::BINARY, 11).unwrap();
        writer.write_all(b"hello world").await.unwrap();
        writer.shutdown().await.unwrap();

        let parts = trx.seal().unwrap();
        assert_eq!(parts[0].data.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_async_write_overflow_surfaces_io_error() {
        let trx = make_trx();
        let mut writer = trx.get_write_stream(PartTag::BINARY, 1).unwrap();
        let result = writer.write_all(b"too long").await;
        assert!(result.is_err());
    }
}
