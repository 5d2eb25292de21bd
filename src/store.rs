use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{fs, io};

use crate::error::UploadError;
use crate::protocol::{LEASE_KEY, LIVENESS_KEY, PENDING_KEY, UploadFile};

/// Durable key-value store surviving process and page restarts. The store
/// itself has no locking; the single-writer discipline on the pending file
/// is upheld by the lease helpers below.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> io::Result<()>;
    async fn delete(&self, key: &str) -> io::Result<()>;
}

/// Filesystem-backed store: one file per key under a root directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl KeyValueStore for FsStore {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.key_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        fs::write(self.key_path(key), value).await
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.key_path(key)).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Write the liveness flag. The executor asserts `true`; the coordinator
/// resets to `false` right before probing.
pub async fn write_liveness(store: &dyn KeyValueStore, alive: bool) -> io::Result<()> {
    store.set(LIVENESS_KEY, &[alive as u8]).await
}

/// Read the liveness flag; an absent flag reads as dead.
pub async fn read_liveness(store: &dyn KeyValueStore) -> io::Result<bool> {
    Ok(store
        .get(LIVENESS_KEY)
        .await?
        .is_some_and(|bytes| bytes.first() == Some(&1)))
}

pub async fn save_pending(
    store: &dyn KeyValueStore,
    file: &UploadFile,
) -> Result<(), UploadError> {
    let bytes = bincode::serialize(file)?;
    store.set(PENDING_KEY, &bytes).await?;
    Ok(())
}

pub async fn load_pending(store: &dyn KeyValueStore) -> Result<Option<UploadFile>, UploadError> {
    match store.get(PENDING_KEY).await? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn clear_pending(store: &dyn KeyValueStore) -> Result<(), UploadError> {
    store.delete(PENDING_KEY).await?;
    Ok(())
}

/// Single-writer lease on the pending file. Resume and failover both take
/// it before any write or delete; a fresh lease held by someone else turns
/// the acquiring path into a no-op.
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    pub acquired_at_ms: i64,
}

pub async fn acquire_lease(
    store: &dyn KeyValueStore,
    owner: &str,
    ttl: Duration,
) -> Result<bool, UploadError> {
    if let Some(bytes) = store.get(LEASE_KEY).await? {
        if let Ok(lease) = bincode::deserialize::<LeaseRecord>(&bytes) {
            let age = Utc::now().timestamp_millis() - lease.acquired_at_ms;
            if lease.owner != owner && age < ttl.as_millis() as i64 {
                return Ok(false);
            }
        }
    }
    let record = LeaseRecord {
        owner: owner.to_string(),
        acquired_at_ms: Utc::now().timestamp_millis(),
    };
    store.set(LEASE_KEY, &bincode::serialize(&record)?).await?;
    Ok(true)
}

pub async fn release_lease(store: &dyn KeyValueStore, owner: &str) -> Result<(), UploadError> {
    if let Some(bytes) = store.get(LEASE_KEY).await? {
        if let Ok(lease) = bincode::deserialize::<LeaseRecord>(&bytes) {
            if lease.owner == owner {
                store.delete(LEASE_KEY).await?;
            }
        }
    }
    Ok(())
}
