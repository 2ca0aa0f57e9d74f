//! Disk Backend
//!
//! File-per-part backend (`cache_fs`). No capacity limit, no eviction.
//!
//! ```text
//! <cache_path>/<guid[0..2]>/<guid>-<hash>.<tag>
//! ```
//!
//! Finalize writes every part to a temporary file first and renames them
//! into place only once all writes succeeded. A file being replaced is kept
//! as a hard link until the whole entry is in place, so a rename failing
//! halfway puts the earlier parts back.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::backend::{CacheBackend, CacheBase, EntryInfo, PartInfo, ReadStream};
use super::key::{CacheKey, PartTag};
use super::options::{CacheOptions, FsOptions, CACHE_FS};
use super::transaction::{PutTransaction, StagedPart};
use crate::error::{Error, Result};

/// Disk-backed cache backend
pub struct FsBackend {
    base: CacheBase,
    options: RwLock<Option<FsOptions>>,
}

impl FsBackend {
    /// Create an uninitialized backend
    pub fn new() -> Self {
        Self {
            base: CacheBase::new(CACHE_FS),
            options: RwLock::new(None),
        }
    }

    fn root(&self) -> Result<PathBuf> {
        self.base
            .cache_path()
            .ok_or_else(|| Error::InitError(format!("{} is not initialized", CACHE_FS)))
    }

    fn fs_options(&self) -> Result<FsOptions> {
        self.options
            .read()
            .clone()
            .ok_or_else(|| Error::InitError(format!("{} is not initialized", CACHE_FS)))
    }

    /// Path of one part file
    pub fn part_path(root: &Path, key: &CacheKey, tag: PartTag) -> PathBuf {
        let guid = key.guid_hex();
        root.join(&guid[..2])
            .join(format!("{}-{}.{}", guid, key.hash_hex(), tag))
    }

    async fn write_staged(
        root: &Path,
        key: &CacheKey,
        trx: &PutTransaction,
        parts: &[StagedPart],
    ) -> Result<Vec<(PathBuf, PathBuf)>> {
        let mut written = Vec::with_capacity(parts.len());
        for part in parts {
            let target = Self::part_path(root, key, part.tag);
            let temp = target.with_extension(format!("{}.{}.tmp", part.tag, trx.id().simple()));
            if let Some(dir) = target.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }

            let result = async {
                let mut file = tokio::fs::File::create(&temp).await?;
                file.write_all(&part.data).await?;
                file.sync_all().await?;
                Ok::<_, io::Error>(())
            }
            .await;

            if let Err(e) = result {
                let _ = tokio::fs::remove_file(&temp).await;
                Self::discard(&written).await;
                return Err(e.into());
            }
            written.push((temp, target));
        }
        Ok(written)
    }

    async fn discard(written: &[(PathBuf, PathBuf)]) {
        for (temp, _) in written {
            let _ = tokio::fs::remove_file(temp).await;
        }
    }

    /// Rename `temp` over `target`, linking the replaced file to a backup
    async fn swap_in(temp: &Path, target: &Path) -> io::Result<Option<PathBuf>> {
        let backup = temp.with_extension("bak");
        let backup = match tokio::fs::hard_link(target, &backup).await {
            Ok(()) => Some(backup),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        if let Err(e) = tokio::fs::rename(temp, target).await {
            if let Some(backup) = &backup {
                let _ = tokio::fs::remove_file(backup).await;
            }
            return Err(e);
        }
        Ok(backup)
    }

    /// Move every staged file into place, or none of them
    async fn install(staged: &[(PathBuf, PathBuf)]) -> Result<()> {
        let mut installed: Vec<(&Path, Option<PathBuf>)> = Vec::with_capacity(staged.len());
        for (index, (temp, target)) in staged.iter().enumerate() {
            match Self::swap_in(temp, target).await {
                Ok(backup) => installed.push((target.as_path(), backup)),
                Err(e) => {
                    Self::discard(&staged[index..]).await;
                    Self::roll_back(&installed).await;
                    return Err(e.into());
                }
            }
        }

        for (_, backup) in installed {
            if let Some(backup) = backup {
                let _ = tokio::fs::remove_file(backup).await;
            }
        }
        Ok(())
    }

    async fn roll_back(installed: &[(&Path, Option<PathBuf>)]) {
        for (target, backup) in installed.iter().rev() {
            let restored = match backup {
                Some(backup) => tokio::fs::rename(backup, target).await,
                None => tokio::fs::remove_file(target).await,
            };
            if let Err(e) = restored {
                warn!(path = %target.display(), error = %e, "Cannot roll back part");
            }
        }
    }
}

impl Default for FsBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for FsBackend {
    fn name(&self) -> &'static str {
        CACHE_FS
    }

    async fn init(&self, options: &CacheOptions) -> Result<()> {
        let fs: FsOptions = options.backend(CACHE_FS)?;
        if options.cache_path().is_none() {
            return Err(Error::InitError(format!(
                "{} requires the {} option",
                CACHE_FS,
                super::options::CACHE_PATH_OPTION
            )));
        }

        let path = self.base.init(options).await?;
        *self.options.write() = Some(fs);
        if let Some(path) = path {
            info!(path = %path.display(), "Disk cache initialized");
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        *self.options.write() = None;
        self.base.reset();
        Ok(())
    }

    async fn get_info(&self, key: &CacheKey) -> Result<Option<EntryInfo>> {
        let root = self.root()?;
        let options = self.fs_options()?;

        let mut parts = Vec::new();
        let mut last_accessed: Option<DateTime<Utc>> = None;
        for tag in options.part_tags.iter() {
            let metadata = match tokio::fs::metadata(Self::part_path(&root, key, tag)).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            parts.push(PartInfo {
                tag,
                size: metadata.len(),
            });
            if let Ok(modified) = metadata.modified() {
                let modified = DateTime::<Utc>::from(modified);
                last_accessed = Some(last_accessed.map_or(modified, |t| t.max(modified)));
            }
        }

        if parts.is_empty() {
            return Ok(None);
        }
        Ok(Some(EntryInfo {
            parts,
            last_accessed: last_accessed.unwrap_or_else(Utc::now),
        }))
    }

    async fn get_read_stream(&self, key: &CacheKey, tag: PartTag) -> Result<ReadStream> {
        let root = self.root()?;
        self.fs_options()?.part_tags.validate(tag)?;

        let path = Self::part_path(&root, key, tag);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("{}/{}", key, tag)));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        debug!(key = %key, part = %tag, bytes = size, "Read from disk");
        Ok(ReadStream::from_reader(size, file))
    }

    async fn create_transaction(&self, key: CacheKey) -> Result<PutTransaction> {
        let options = self.fs_options()?;
        Ok(PutTransaction::new(key, options.part_tags))
    }

    async fn end_transaction(&self, trx: &PutTransaction) -> Result<()> {
        let root = match self.root() {
            Ok(root) => root,
            Err(e) => {
                let _ = trx.abandon();
                return Err(e);
            }
        };
        let parts = trx.seal()?;
        let key = *trx.key();

        let installed = match Self::write_staged(&root, &key, trx, &parts).await {
            Ok(written) => Self::install(&written).await,
            Err(e) => Err(e),
        };
        if let Err(e) = installed {
            trx.fail();
            warn!(key = %key, error = %e, "Disk commit failed");
            return Err(e);
        }

        trx.mark_committed()?;
        debug!(key = %key, parts = parts.len(), "Committed to disk");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::options::{OptionsBuilder, CACHE_PATH_OPTION};
    use assert_matches::assert_matches;

    fn make_key() -> CacheKey {
        CacheKey::new(&[0x5A; 16], &[0x01; 16]).unwrap()
    }

    async fn make_backend(dir: &Path) -> FsBackend {
        let options = OptionsBuilder::new()
            .set(CACHE_PATH_OPTION, dir.to_string_lossy().to_string())
            .build()
            .unwrap();
        let backend = FsBackend::new();
        backend.init(&options).await.unwrap();
        backend
    }

    async fn put(backend: &FsBackend, key: CacheKey, parts: &[(PartTag, &[u8])]) -> Result<()> {
        let trx = backend.create_transaction(key).await?;
        for (tag, data) in parts {
            let mut writer = trx.get_write_stream(*tag, data.len() as u64)?;
            writer.write(data)?;
            writer.close()?;
        }
        backend.end_transaction(&trx).await
    }

    #[tokio::test]
    async fn test_requires_cache_path() {
        let backend = FsBackend::new();
        assert_matches!(
            backend.init(&CacheOptions::defaults()).await,
            Err(Error::InitError(_))
        );
    }

    #[tokio::test]
    async fn test_layout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = make_backend(dir.path()).await;
        let key = make_key();

        let trx = backend.create_transaction(key).await.unwrap();
        let mut writer = trx.get_write_stream(PartTag::BINARY, 3).unwrap();
        writer.write(b"abc").unwrap();
        writer.close().unwrap();
        backend.end_transaction(&trx).await.unwrap();

        let expected = dir
            .path()
            .join("5a")
            .join(format!("{}-{}.a", "5a".repeat(16), "01".repeat(16)));
        assert_eq!(FsBackend::part_path(dir.path(), &key, PartTag::BINARY), expected);
        assert_eq!(std::fs::read(&expected).unwrap(), b"abc");

        // No temporary files left behind
        let names: Vec<_> = std::fs::read_dir(expected.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_round_trip_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let backend = make_backend(dir.path()).await;
        let key = make_key();

        let trx = backend.create_transaction(key).await.unwrap();
        for (tag, data) in [(PartTag::INFO, &b"info"[..]), (PartTag::RESOURCE, &b"res!!"[..])] {
            let mut writer = trx.get_write_stream(tag, data.len() as u64).unwrap();
            writer.write(data).unwrap();
            writer.close().unwrap();
        }
        backend.end_transaction(&trx).await.unwrap();

        let info = backend.get_info(&key).await.unwrap().unwrap();
        assert_eq!(info.size(), 9);
        assert!(!info.has_part(PartTag::BINARY));

        let stream = backend.get_read_stream(&key, PartTag::RESOURCE).await.unwrap();
        assert_eq!(stream.size(), 5);
        assert_eq!(stream.read_all().await.unwrap().as_ref(), b"res!!");
    }

    #[tokio::test]
    async fn test_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = make_backend(dir.path()).await;
        assert!(backend.get_info(&make_key()).await.unwrap().is_none());
        assert_matches!(
            backend.get_read_stream(&make_key(), PartTag::INFO).await,
            Err(Error::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_incomplete_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = make_backend(dir.path()).await;
        let key = make_key();

        let trx = backend.create_transaction(key).await.unwrap();
        let mut writer = trx.get_write_stream(PartTag::BINARY, 10).unwrap();
        writer.write(b"short").unwrap();

        assert_matches!(
            backend.end_transaction(&trx).await,
            Err(Error::IncompleteWrite { .. })
        );
        assert!(backend.get_info(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_rename_rolls_back_earlier_parts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = make_backend(dir.path()).await;
        let key = make_key();

        put(&backend, key, &[(PartTag::BINARY, &b"old"[..])]).await.unwrap();

        // A directory where the info part goes makes its rename fail
        let info_path = FsBackend::part_path(dir.path(), &key, PartTag::INFO);
        std::fs::create_dir_all(info_path.join("blocker")).unwrap();

        // Binary sorts first and is installed before info fails
        let result = put(
            &backend,
            key,
            &[(PartTag::BINARY, &b"new"[..]), (PartTag::INFO, &b"meta"[..])],
        )
        .await;
        assert!(result.is_err());

        let binary = backend.get_read_stream(&key, PartTag::BINARY).await.unwrap();
        assert_eq!(binary.read_all().await.unwrap().as_ref(), b"old");

        let mut names: Vec<_> = std::fs::read_dir(info_path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        let binary_path = FsBackend::part_path(dir.path(), &key, PartTag::BINARY);
        let mut expected = vec![
            binary_path.file_name().unwrap().to_string_lossy().to_string(),
            info_path.file_name().unwrap().to_string_lossy().to_string(),
        ];
        expected.sort();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn test_replace_leaves_no_backup() {
        let dir = tempfile::tempdir().unwrap();
        let backend = make_backend(dir.path()).await;
        let key = make_key();

        put(&backend, key, &[(PartTag::BINARY, &b"one"[..])]).await.unwrap();
        put(&backend, key, &[(PartTag::BINARY, &b"two"[..])]).await.unwrap();

        let path = FsBackend::part_path(dir.path(), &key, PartTag::BINARY);
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
