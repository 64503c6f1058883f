//! A filesystem chunk store.
//!
//! Chunks are addressed by nested `<z>/<y>/<x>` paths under the array
//! directory, next to an `array.json` metadata record. Resizing the array
//! patches the record in place; growing or shrinking the volume in the
//! negative direction renames chunk files rather than rewriting them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use walkdir::WalkDir;

use crate::{ArrayIndices, ArrayShape};

use crate::storage::{ArrayMetadata, Bytes, ChunkStore, MaybeBytes, StorageError};

/// The name of the array metadata record.
const ARRAY_METADATA_FILENAME: &str = "array.json";

/// A filesystem chunk store create error.
#[derive(Debug, Error)]
pub enum FilesystemStoreCreateError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The base path is invalid.
    #[error("base path {} is not valid", _0.display())]
    InvalidBasePath(PathBuf),
}

/// A filesystem chunk store.
#[derive(Debug)]
pub struct FilesystemChunkStore {
    base_path: PathBuf,
}

impl FilesystemChunkStore {
    /// Create a new filesystem chunk store rooted at `base_path`.
    ///
    /// # Errors
    /// Returns a [`FilesystemStoreCreateError`] if `base_path` points to an
    /// existing file rather than a directory.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, FilesystemStoreCreateError> {
        let base_path = base_path.as_ref().to_path_buf();
        if base_path.is_file() {
            return Err(FilesystemStoreCreateError::InvalidBasePath(base_path));
        }
        Ok(Self { base_path })
    }

    /// Maps chunk indices to their filesystem path.
    #[must_use]
    pub fn chunk_path(&self, chunk_indices: &ArrayIndices) -> PathBuf {
        let [z, y, x] = chunk_indices;
        self.base_path.join(z.to_string()).join(y.to_string()).join(x.to_string())
    }

    fn metadata_path(&self) -> PathBuf {
        self.base_path.join(ARRAY_METADATA_FILENAME)
    }

    /// Maps a filesystem path back to chunk indices.
    ///
    /// Returns [`None`] for paths that are not `<z>/<y>/<x>` chunk files,
    /// such as the metadata record.
    fn path_to_chunk_indices(&self, path: &Path) -> Option<ArrayIndices> {
        let relative = pathdiff::diff_paths(path, &self.base_path)?;
        let components: Vec<u64> = relative
            .iter()
            .map(|component| component.to_str()?.parse().ok())
            .collect::<Option<_>>()?;
        match components[..] {
            [z, y, x] => Some([z, y, x]),
            _ => None,
        }
    }
}

#[async_trait]
impl ChunkStore for FilesystemChunkStore {
    async fn create(&self, metadata: &ArrayMetadata) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|err| StorageError::Other(err.to_string()))?;
        tokio::fs::write(self.metadata_path(), json).await?;
        Ok(())
    }

    async fn metadata(&self) -> Result<Option<ArrayMetadata>, StorageError> {
        let path = self.metadata_path();
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

    async fn patch_shape(&self, shape: ArrayShape) -> Result<(), StorageError> {
        let path = self.metadata_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::MissingMetadata)
            }
            Err(err) => return Err(err.into()),
        };
        // Rewrite only the shape field so fields this crate does not model
        // survive the patch.
        let mut record: serde_json::Value = serde_json::from_slice(&bytes).map_err(|err| {
            StorageError::InvalidMetadata(path.display().to_string(), err.to_string())
        })?;
        let Some(object) = record.as_object_mut() else {
            return Err(StorageError::InvalidMetadata(
                path.display().to_string(),
                "expected a JSON object".to_string(),
            ));
        };
        object.insert("shape".to_string(), serde_json::json!(shape));
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|err| StorageError::Other(err.to_string()))?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    async fn read_chunk(&self, chunk_indices: ArrayIndices) -> Result<MaybeBytes, StorageError> {
        match tokio::fs::read(self.chunk_path(&chunk_indices)).await {
            Ok(bytes) => Ok(Some(bytes.into())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_chunk(
        &self,
        chunk_indices: ArrayIndices,
        bytes: Bytes,
    ) -> Result<(), StorageError> {
        let path = self.chunk_path(&chunk_indices);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &bytes).await?;
        Ok(())
    }

    async fn erase_chunk(&self, chunk_indices: ArrayIndices) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.chunk_path(&chunk_indices)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_chunks(&self) -> Result<Vec<ArrayIndices>, StorageError> {
        let mut chunks = Vec::new();
        for entry in WalkDir::new(&self.base_path).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|err| StorageError::Other(err.to_string()))?;
            if entry.path().is_file() {
                if let Some(chunk_indices) = self.path_to_chunk_indices(entry.path()) {
                    chunks.push(chunk_indices);
                }
            }
        }
        Ok(chunks)
    }

    async fn erase_axis_slice(&self, axis: usize, index: u64) -> Result<(), StorageError> {
        if axis == 0 {
            // a whole <z> directory
            match tokio::fs::remove_dir_all(self.base_path.join(index.to_string())).await {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        for chunk_indices in self.list_chunks().await? {
            if chunk_indices[axis] == index {
                self.erase_chunk(chunk_indices).await?;
            }
        }
        Ok(())
    }

    async fn relocate_chunks(
        &self,
        axis: usize,
        from: u64,
        shift: i64,
    ) -> Result<(), StorageError> {
        if shift == 0 {
            return Ok(());
        }
        let mut chunks: Vec<ArrayIndices> = self
            .list_chunks()
            .await?
            .into_iter()
            .filter(|chunk_indices| chunk_indices[axis] >= from)
            .collect();
        chunks.sort_unstable_by_key(|chunk_indices| chunk_indices[axis]);
        if shift > 0 {
            chunks.reverse();
        }
        debug!(
            "relocating {} chunks on axis {axis} from index {from} by {shift}",
            chunks.len()
        );
        for chunk_indices in chunks {
            let index = i64::try_from(chunk_indices[axis])
                .ok()
                .and_then(|index| index.checked_add(shift))
                .and_then(|index| u64::try_from(index).ok())
                .ok_or(StorageError::InvalidRelocation(chunk_indices, shift, axis))?;
            let mut target = chunk_indices;
            target[axis] = index;
            let target_path = self.chunk_path(&target);
            if let Some(parent) = target_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(self.chunk_path(&chunk_indices), target_path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filesystem_store_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        assert!(store.metadata().await.unwrap().is_none());

        store
            .create(&ArrayMetadata::new([2, 4, 4], [1, 2, 2]))
            .await
            .unwrap();
        store
            .write_chunk([1, 0, 1], Bytes::from_static(&[9, 8, 7, 6]))
            .await
            .unwrap();
        assert!(dir.path().join("1").join("0").join("1").is_file());
        assert_eq!(
            store.read_chunk([1, 0, 1]).await.unwrap().as_deref(),
            Some(&[9u8, 8, 7, 6][..])
        );
        assert!(store.read_chunk([0, 0, 0]).await.unwrap().is_none());
        assert_eq!(store.list_chunks().await.unwrap(), vec![[1, 0, 1]]);

        store.erase_chunk([1, 0, 1]).await.unwrap();
        assert!(store.read_chunk([1, 0, 1]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filesystem_store_patches_shape_preserving_unknown_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        store
            .create(&ArrayMetadata::new([2, 4, 4], [1, 2, 2]))
            .await
            .unwrap();

        // a field this crate does not model
        let path = dir.path().join(ARRAY_METADATA_FILENAME);
        let mut record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        record["dimension_separator"] = serde_json::json!("/");
        std::fs::write(&path, serde_json::to_vec_pretty(&record).unwrap()).unwrap();

        store.patch_shape([5, 4, 4]).await.unwrap();
        let metadata = store.metadata().await.unwrap().unwrap();
        assert_eq!(metadata.shape, [5, 4, 4]);
        let record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(record["dimension_separator"], "/");
    }

    #[tokio::test]
    async fn filesystem_store_relocates_by_rename() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        store
            .create(&ArrayMetadata::new([1, 4, 6], [1, 2, 2]))
            .await
            .unwrap();
        for y in 0..2u64 {
            for x in 0..3u64 {
                store
                    .write_chunk([0, y, x], Bytes::from(vec![(y * 3 + x) as u8; 4]))
                    .await
                    .unwrap();
            }
        }

        // prepend one chunk column
        store.relocate_chunks(2, 0, 1).await.unwrap();
        assert!(store.read_chunk([0, 0, 0]).await.unwrap().is_none());
        for y in 0..2u64 {
            for x in 0..3u64 {
                assert_eq!(
                    store.read_chunk([0, y, x + 1]).await.unwrap().as_deref(),
                    Some(&[(y * 3 + x) as u8; 4][..])
                );
            }
        }

        store.erase_axis_slice(0, 0).await.unwrap();
        assert!(store.list_chunks().await.unwrap().is_empty());
    }

    #[test]
    fn filesystem_store_rejects_file_base_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"").unwrap();
        assert!(matches!(
            FilesystemChunkStore::new(&file),
            Err(FilesystemStoreCreateError::InvalidBasePath(_))
        ));
    }
}
