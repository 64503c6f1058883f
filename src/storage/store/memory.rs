//! An in-memory chunk store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{ArrayIndices, ArrayShape};

use crate::storage::{ArrayMetadata, Bytes, ChunkStore, MaybeBytes, StorageError};

/// An in-memory chunk store.
///
/// Useful for tests and for staging a volume that is later copied to a
/// durable backend.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    metadata: RwLock<Option<ArrayMetadata>>,
    chunks: RwLock<BTreeMap<ArrayIndices, Bytes>>,
}

impl MemoryChunkStore {
    /// Create a new empty in-memory chunk store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn create(&self, metadata: &ArrayMetadata) -> Result<(), StorageError> {
        *self.metadata.write() = Some(metadata.clone());
        Ok(())
    }

    async fn metadata(&self) -> Result<Option<ArrayMetadata>, StorageError> {
        Ok(self.metadata.read().clone())
    }

    async fn patch_shape(&self, shape: ArrayShape) -> Result<(), StorageError> {
        let mut metadata = self.metadata.write();
        let Some(metadata) = metadata.as_mut() else {
            return Err(StorageError::MissingMetadata);
        };
        metadata.shape = shape;
        Ok(())
    }

    async fn read_chunk(&self, chunk_indices: ArrayIndices) -> Result<MaybeBytes, StorageError> {
        Ok(self.chunks.read().get(&chunk_indices).cloned())
    }

    async fn write_chunk(
        &self,
        chunk_indices: ArrayIndices,
        bytes: Bytes,
    ) -> Result<(), StorageError> {
        self.chunks.write().insert(chunk_indices, bytes);
        Ok(())
    }

    async fn erase_chunk(&self, chunk_indices: ArrayIndices) -> Result<(), StorageError> {
        self.chunks.write().remove(&chunk_indices);
        Ok(())
    }

    async fn list_chunks(&self) -> Result<Vec<ArrayIndices>, StorageError> {
        Ok(self.chunks.read().keys().copied().collect())
    }
}
