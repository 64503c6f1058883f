use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ArrayIndices, ArrayShape};

use super::{Bytes, MaybeBytes, StorageError};

/// The data type of every array in this crate.
pub const UINT8_DATA_TYPE: &str = "uint8";

/// The metadata record of a chunked array.
///
/// Stores patch the `shape` field of this record in place when an array is
/// resized; chunk payloads are never rewritten on resize.
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug)]
pub struct ArrayMetadata {
    /// The declared array shape in voxels.
    pub shape: ArrayShape,
    /// The chunk shape in voxels.
    pub chunk_shape: ArrayShape,
    /// The element data type.
    pub data_type: String,
}

impl ArrayMetadata {
    /// Create metadata for a `uint8` array of `shape` chunked by `chunk_shape`.
    #[must_use]
    pub fn new(shape: ArrayShape, chunk_shape: ArrayShape) -> Self {
        Self {
            shape,
            chunk_shape,
            data_type: UINT8_DATA_TYPE.to_string(),
        }
    }
}

/// The capability interface of a chunked array backend.
///
/// Chunks are addressed by per-axis `(z, y, x)` indices and always hold a
/// full chunk's worth of bytes; edge chunks are zero-padded past the declared
/// array shape. An absent chunk reads as [`None`] and callers substitute
/// zeros.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Create the array, writing its metadata record.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on an underlying store error.
    async fn create(&self, metadata: &ArrayMetadata) -> Result<(), StorageError>;

    /// Retrieve the array metadata record.
    ///
    /// Returns [`None`] if the array has not been created.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the record exists but cannot be parsed,
    /// or on an underlying store error.
    async fn metadata(&self) -> Result<Option<ArrayMetadata>, StorageError>;

    /// Patch the declared array shape in the metadata record, in place.
    ///
    /// Fields of the stored record that this crate does not model are
    /// preserved.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the array has not been created or on an
    /// underlying store error.
    async fn patch_shape(&self, shape: ArrayShape) -> Result<(), StorageError>;

    /// Retrieve the chunk at `chunk_indices`.
    ///
    /// Returns [`None`] if the chunk has never been written.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on an underlying store error.
    async fn read_chunk(&self, chunk_indices: ArrayIndices) -> Result<MaybeBytes, StorageError>;

    /// Store the chunk at `chunk_indices`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on an underlying store error.
    async fn write_chunk(
        &self,
        chunk_indices: ArrayIndices,
        bytes: Bytes,
    ) -> Result<(), StorageError>;

    /// Erase the chunk at `chunk_indices`.
    ///
    /// Succeeds if the chunk does not exist.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on an underlying store error.
    async fn erase_chunk(&self, chunk_indices: ArrayIndices) -> Result<(), StorageError>;

    /// Return the indices of every stored chunk.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on an underlying store error.
    async fn list_chunks(&self) -> Result<Vec<ArrayIndices>, StorageError>;

    /// Erase every chunk whose index on `axis` equals `index`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on an underlying store error.
    async fn erase_axis_slice(&self, axis: usize, index: u64) -> Result<(), StorageError> {
        for chunk_indices in self.list_chunks().await? {
            if chunk_indices[axis] == index {
                self.erase_chunk(chunk_indices).await?;
            }
        }
        Ok(())
    }

    /// Relocate every chunk whose index on `axis` is at least `from` by
    /// `shift` chunk indices along that axis.
    ///
    /// Chunks are moved highest index first for a positive `shift` and lowest
    /// index first for a negative `shift`, so moves never clobber chunks that
    /// are themselves about to move.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidRelocation`] if a chunk would move to a
    /// negative index, or a [`StorageError`] on an underlying store error.
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
        for chunk_indices in chunks {
            let index = i64::try_from(chunk_indices[axis])
                .ok()
                .and_then(|index| index.checked_add(shift))
                .and_then(|index| u64::try_from(index).ok())
                .ok_or(StorageError::InvalidRelocation(chunk_indices, shift, axis))?;
            let mut target = chunk_indices;
            target[axis] = index;
            if let Some(bytes) = self.read_chunk(chunk_indices).await? {
                self.write_chunk(target, bytes).await?;
                self.erase_chunk(chunk_indices).await?;
            }
        }
        Ok(())
    }
}
