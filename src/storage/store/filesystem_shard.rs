//! A filesystem shard store.
//!
//! The destination of a bulk export: an `info.json` metadata record next to a
//! `shards/` directory holding one raw file per shard. A shard file holds the
//! row-major voxels of its clamped shard box. Commits are atomic: the shard
//! is staged in memory, written to a temporary file, and renamed into place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;

use crate::{array_subset::ArraySubset, ArrayIndices};

use crate::storage::{ShardStore, ShardTransaction, ShardedArrayMetadata, StorageError};

/// The name of the sharded array metadata record.
const SHARDED_METADATA_FILENAME: &str = "info.json";

/// The directory holding committed shard files.
const SHARDS_DIR: &str = "shards";

/// A filesystem shard store.
#[derive(Debug)]
pub struct FilesystemShardStore {
    base_path: PathBuf,
}

impl FilesystemShardStore {
    /// Create a new filesystem shard store rooted at `base_path`.
    #[must_use]
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Maps shard indices to the committed shard file path.
    #[must_use]
    pub fn shard_path(&self, shard_indices: &ArrayIndices) -> PathBuf {
        let [z, y, x] = shard_indices;
        self.base_path
            .join(SHARDS_DIR)
            .join(format!("{z}.{y}.{x}.shard"))
    }

    /// Retrieve the sharded array metadata record.
    ///
    /// Returns [`None`] if the array has not been created.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the record cannot be read or parsed.
    pub async fn metadata(&self) -> Result<Option<ShardedArrayMetadata>, StorageError> {
        let path = self.base_path.join(SHARDED_METADATA_FILENAME);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let metadata = serde_json::from_slice(&bytes).map_err(|err| {
            StorageError::InvalidMetadata(path.display().to_string(), err.to_string())
        })?;
        Ok(Some(metadata))
    }
}

#[async_trait]
impl ShardStore for FilesystemShardStore {
    async fn create(&self, metadata: &ShardedArrayMetadata) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.base_path.join(SHARDS_DIR)).await?;
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|err| StorageError::Other(err.to_string()))?;
        tokio::fs::write(self.base_path.join(SHARDED_METADATA_FILENAME), json).await?;
        Ok(())
    }

    async fn begin_shard(
        &self,
        shard_indices: ArrayIndices,
        subset: ArraySubset,
    ) -> Result<Box<dyn ShardTransaction>, StorageError> {
        let path = self.shard_path(&shard_indices);
        let staging_path = path.with_extension("shard.partial");
        let buffer = vec![0u8; subset.num_elements_usize()];
        Ok(Box::new(FilesystemShardTransaction {
            path,
            staging_path,
            subset,
            buffer,
        }))
    }
}

/// An open transaction staging one shard in memory.
struct FilesystemShardTransaction {
    path: PathBuf,
    staging_path: PathBuf,
    subset: ArraySubset,
    buffer: Vec<u8>,
}

#[async_trait]
impl ShardTransaction for FilesystemShardTransaction {
    fn subset(&self) -> &ArraySubset {
        &self.subset
    }

    async fn write_region(
        &mut self,
        region: &ArraySubset,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let Self {
            subset, buffer, ..
        } = self;
        region
            .store_into(bytes, subset, buffer)
            .map_err(|err| StorageError::Other(err.to_string()))
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        debug!("committing shard {}", self.path.display());
        tokio::fs::write(&self.staging_path, &self.buffer).await?;
        tokio::fs::rename(&self.staging_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::ShardSpec;
    use crate::storage::UINT8_DATA_TYPE;

    fn metadata() -> ShardedArrayMetadata {
        ShardedArrayMetadata {
            size: [2, 4, 4],
            chunk_size: [1, 2, 2],
            shard_size: [2, 4, 4],
            resolution: [50, 10, 10],
            sharding: ShardSpec {
                preshift_bits: 1,
                minishard_bits: 1,
                shard_bits: 1,
            },
            data_type: UINT8_DATA_TYPE.to_string(),
        }
    }

    #[tokio::test]
    async fn shard_commit_is_atomic() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FilesystemShardStore::new(dir.path());
        store.create(&metadata()).await.unwrap();
        assert_eq!(store.metadata().await.unwrap(), Some(metadata()));

        let subset = ArraySubset::from([0..2, 0..4, 0..4]);
        let mut txn = store.begin_shard([0, 0, 0], subset).await.unwrap();
        txn.write_region(&ArraySubset::from([0..1, 0..2, 0..2]), &[1, 2, 3, 4])
            .await
            .unwrap();

        // nothing visible before commit
        assert!(!store.shard_path(&[0, 0, 0]).exists());
        txn.commit().await.unwrap();
        let committed = std::fs::read(store.shard_path(&[0, 0, 0])).unwrap();
        assert_eq!(committed.len(), 2 * 4 * 4);
        assert_eq!(&committed[0..2], &[1, 2]);
        assert_eq!(&committed[4..6], &[3, 4]);
        assert!(committed[6..].iter().all(|&byte| byte == 0));
    }

    #[tokio::test]
    async fn shard_rejects_regions_outside_its_box() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FilesystemShardStore::new(dir.path());
        store.create(&metadata()).await.unwrap();
        let subset = ArraySubset::from([0..1, 0..4, 0..4]);
        let mut txn = store.begin_shard([0, 0, 0], subset).await.unwrap();
        assert!(txn
            .write_region(&ArraySubset::from([0..2, 0..1, 0..1]), &[0, 0])
            .await
            .is_err());
    }
}
