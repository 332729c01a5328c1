//! Cache store: keyed persistence for processed source payloads.
//!
//! [`CacheStore`] defines the storage contract; [`FsCacheStore`] is the
//! filesystem implementation (one JSON document per key). Staleness is
//! decided against the modification times of a source's input files.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors produced by [`CacheStore`] operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// File-system I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded for storage
    #[error("serialize error: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Stored entry could not be decoded
    #[error("corrupt cache entry '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience alias used throughout this module.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Read paths treat a missing file, or a store directory that is not a
/// directory at all, as "no entry".
fn means_absent(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

/// Storage contract for processed payloads.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn CacheStore>`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read the payload stored under `key`.
    ///
    /// Returns `Ok(None)` when no entry exists; absence is never an error.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on storage failure or a corrupt entry.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `payload` under `key`, replacing any previous entry.
    ///
    /// Concurrent writers of the same key settle on last-writer-wins.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on storage failure.
    async fn set(&self, key: &str, payload: &Value) -> Result<()>;

    /// Remove the entry under `key`. Removing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on storage failure.
    async fn invalidate(&self, key: &str) -> Result<()>;

    /// When the entry under `key` was stored. `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on storage failure.
    async fn stored_at(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Remove every entry in the store.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on storage failure.
    async fn clear(&self) -> Result<()>;

    /// Whether the entry under `key` must be recomputed from its inputs.
    ///
    /// An absent entry is stale. A missing reference file makes the entry
    /// stale (the input set changed). Otherwise the entry is stale exactly
    /// when some reference file was modified after the entry was stored; an
    /// empty reference list never marks a present entry stale.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on storage failure.
    async fn is_stale(&self, key: &str, reference_files: &[PathBuf]) -> Result<bool> {
        let entry_time = match self.stored_at(key).await? {
            Some(time) => time,
            None => return Ok(true),
        };

        for file in reference_files {
            match tokio::fs::metadata(file).await {
                Ok(metadata) => {
                    let modified = DateTime::<Utc>::from(metadata.modified()?);
                    if modified > entry_time {
                        debug!(key, file = %file.display(), "cache entry older than input file");
                        return Ok(true);
                    }
                }
                Err(err) if means_absent(err.kind()) => {
                    debug!(key, file = %file.display(), "input file missing, entry stale");
                    return Ok(true);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(false)
    }
}

/// Filesystem cache store: one JSON document per key under one directory.
///
/// `stored_at` is the entry file's modification time. Writes go through a
/// uniquely named temp file and a rename, so readers never observe a torn
/// document. There is no cross-process locking; concurrent same-key writers
/// settle on last-writer-wins.
///
/// Keys are used as file stems and are expected to be filesystem-safe; the
/// engine derives them from type names and hex digests.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    cache_dir: PathBuf,
}

impl FsCacheStore {
    /// Open a store rooted at `cache_dir`, creating the directory when
    /// missing.
    pub async fn open(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let newly_created = !cache_dir.exists();
        tokio::fs::create_dir_all(&cache_dir).await?;

        if newly_created {
            info!(dir = %cache_dir.display(), "initialized new cache store");
        } else {
            debug!(dir = %cache_dir.display(), "opened existing cache store");
        }

        Ok(Self { cache_dir })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw = match tokio::fs::read(self.entry_path(key)).await {
            Ok(raw) => raw,
            Err(err) if means_absent(err.kind()) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let payload = serde_json::from_slice(&raw).map_err(|source| CacheError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(payload))
    }

    async fn set(&self, key: &str, payload: &Value) -> Result<()> {
        // The directory may have vanished since open (or never existed when
        // the store is pointed somewhere unwritable).
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let raw = serde_json::to_vec_pretty(payload).map_err(CacheError::Serialize)?;
        let tmp = self
            .cache_dir
            .join(format!(".{key}.{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, self.entry_path(key)).await?;

        debug!(key, bytes = raw.len(), "cache entry written");
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => {
                debug!(key, "cache entry invalidated");
                Ok(())
            }
            Err(err) if means_absent(err.kind()) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn stored_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match tokio::fs::metadata(self.entry_path(key)).await {
            Ok(metadata) => Ok(Some(DateTime::<Utc>::from(metadata.modified()?))),
            Err(err) if means_absent(err.kind()) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        info!(dir = %self.cache_dir.display(), "cache store cleared");
        Ok(())
    }
}
