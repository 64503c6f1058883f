//! The chunked array.
//!
//! A [`ChunkedArray`] performs region reads and writes against a
//! [`ChunkStore`] backend. Writes that cover a whole chunk go straight to the
//! store; writes that cover part of a chunk read-modify-write it, with absent
//! chunks materialized as zeros, so a region write is always chunk aligned
//! regardless of where it starts. Reads of absent chunks likewise yield
//! zeros.
//!
//! The declared array shape is metadata only: resizing patches the metadata
//! record in place and never touches chunk payloads.

use std::sync::Arc;

use futures::future::try_join_all;
use thiserror::Error;

use crate::{
    array_subset::{ArraySubset, SubsetBytesError},
    chunk_grid::{InvalidChunkShapeError, RegularChunkGrid},
    storage::{ArrayMetadata, ChunkStore, StorageError},
    ArrayIndices, ArrayShape,
};

/// A chunked array error.
#[derive(Debug, Error)]
pub enum ChunkedArrayError {
    /// A store error.
    #[error(transparent)]
    StorageError(#[from] StorageError),
    /// An invalid chunk shape.
    #[error(transparent)]
    InvalidChunkShape(#[from] InvalidChunkShapeError),
    /// Incompatible array subset.
    #[error("array subset {_0} is not compatible with array shape {_1:?}")]
    InvalidArraySubset(ArraySubset, ArrayShape),
    /// An unexpected bytes input size.
    #[error("got bytes with size {_0}, expected {_1}")]
    InvalidBytesInputSize(usize, u64),
    /// A stored chunk has an unexpected size.
    #[error("chunk {_0:?} has {_1} bytes, expected {_2}")]
    UnexpectedChunkSize(ArrayIndices, usize, u64),
    /// A subset byte copy failed.
    #[error(transparent)]
    SubsetBytesError(#[from] SubsetBytesError),
}

/// A chunked `uint8` array over a [`ChunkStore`].
#[derive(Clone)]
pub struct ChunkedArray {
    storage: Arc<dyn ChunkStore>,
    shape: ArrayShape,
    chunk_grid: RegularChunkGrid,
}

impl ChunkedArray {
    /// Create a new array of `shape` chunked by `chunk_shape` in `storage`.
    ///
    /// # Errors
    /// Returns a [`ChunkedArrayError`] if `chunk_shape` has a zero component
    /// or the metadata record cannot be written.
    pub async fn create(
        storage: Arc<dyn ChunkStore>,
        shape: ArrayShape,
        chunk_shape: ArrayShape,
    ) -> Result<Self, ChunkedArrayError> {
        let chunk_grid = RegularChunkGrid::new(chunk_shape)?;
        storage
            .create(&ArrayMetadata::new(shape, chunk_shape))
            .await?;
        Ok(Self {
            storage,
            shape,
            chunk_grid,
        })
    }

    /// Open the existing array in `storage`.
    ///
    /// # Errors
    /// Returns a [`ChunkedArrayError`] if the metadata record is missing or
    /// invalid.
    pub async fn open(storage: Arc<dyn ChunkStore>) -> Result<Self, ChunkedArrayError> {
        let metadata = storage
            .metadata()
            .await?
            .ok_or(StorageError::MissingMetadata)?;
        let chunk_grid = RegularChunkGrid::new(metadata.chunk_shape)?;
        Ok(Self {
            storage,
            shape: metadata.shape,
            chunk_grid,
        })
    }

    /// Return the declared array shape.
    #[must_use]
    pub fn shape(&self) -> &ArrayShape {
        &self.shape
    }

    /// Return the chunk shape.
    #[must_use]
    pub fn chunk_shape(&self) -> &ArrayShape {
        self.chunk_grid.chunk_shape()
    }

    /// Return the chunk grid.
    #[must_use]
    pub fn chunk_grid(&self) -> &RegularChunkGrid {
        &self.chunk_grid
    }

    /// Return the underlying chunk store.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn ChunkStore> {
        &self.storage
    }

    /// Set the declared array shape, patching the metadata record in place.
    ///
    /// # Errors
    /// Returns a [`ChunkedArrayError`] on an underlying store error.
    pub async fn resize(&mut self, shape: ArrayShape) -> Result<(), ChunkedArrayError> {
        self.storage.patch_shape(shape).await?;
        self.shape = shape;
        Ok(())
    }

    /// Write `bytes`, the row-major voxels of `subset`, into the array.
    ///
    /// Chunks fully covered by `subset` are stored directly; partially
    /// covered chunks are read, modified, and stored, with absent chunks
    /// zero-filled first.
    ///
    /// # Errors
    /// Returns a [`ChunkedArrayError`] if `subset` leaves the array bounds,
    /// `bytes` has the wrong length, or the store fails.
    pub async fn write_region(
        &self,
        subset: &ArraySubset,
        bytes: &[u8],
    ) -> Result<(), ChunkedArrayError> {
        if !subset.inbounds(&self.shape) {
            return Err(ChunkedArrayError::InvalidArraySubset(*subset, self.shape));
        }
        if bytes.len() as u64 != subset.num_elements() {
            return Err(ChunkedArrayError::InvalidBytesInputSize(
                bytes.len(),
                subset.num_elements(),
            ));
        }
        if subset.is_empty() {
            return Ok(());
        }
        let subset_local = ArraySubset::new_with_shape(*subset.shape());
        let chunk_local = ArraySubset::new_with_shape(*self.chunk_grid.chunk_shape());
        for chunk_indices in self.chunk_grid.chunks_in_subset(subset).indices() {
            let chunk_subset = self.chunk_grid.chunk_subset(&chunk_indices);
            let overlap = chunk_subset.overlap(subset);
            let piece = overlap
                .relative_to(subset.start())
                .extract_from(&subset_local, bytes)?;
            if overlap == chunk_subset {
                self.storage
                    .write_chunk(chunk_indices, piece.into())
                    .await?;
            } else {
                let mut chunk_bytes = self.retrieve_chunk_or_zeros(chunk_indices).await?;
                overlap
                    .relative_to(chunk_subset.start())
                    .store_into(&piece, &chunk_local, &mut chunk_bytes)?;
                self.storage
                    .write_chunk(chunk_indices, chunk_bytes.into())
                    .await?;
            }
        }
        Ok(())
    }

    /// Read the row-major voxels of `subset` out of the array.
    ///
    /// Absent chunks read as zeros. Chunk retrievals are issued concurrently.
    ///
    /// # Errors
    /// Returns a [`ChunkedArrayError`] if `subset` leaves the array bounds or
    /// the store fails.
    pub async fn read_region(&self, subset: &ArraySubset) -> Result<Vec<u8>, ChunkedArrayError> {
        if !subset.inbounds(&self.shape) {
            return Err(ChunkedArrayError::InvalidArraySubset(*subset, self.shape));
        }
        let mut bytes = vec![0u8; subset.num_elements_usize()];
        if subset.is_empty() {
            return Ok(bytes);
        }
        let chunk_reads = self
            .chunk_grid
            .chunks_in_subset(subset)
            .indices()
            .map(|chunk_indices| {
                let storage = self.storage.clone();
                async move {
                    storage
                        .read_chunk(chunk_indices)
                        .await
                        .map(|chunk_bytes| (chunk_indices, chunk_bytes))
                }
            });
        let subset_local = ArraySubset::new_with_shape(*subset.shape());
        let chunk_local = ArraySubset::new_with_shape(*self.chunk_grid.chunk_shape());
        for (chunk_indices, chunk_bytes) in try_join_all(chunk_reads).await? {
            let Some(chunk_bytes) = chunk_bytes else {
                continue;
            };
            if chunk_bytes.len() as u64 != self.chunk_grid.chunk_num_elements() {
                return Err(ChunkedArrayError::UnexpectedChunkSize(
                    chunk_indices,
                    chunk_bytes.len(),
                    self.chunk_grid.chunk_num_elements(),
                ));
            }
            let chunk_subset = self.chunk_grid.chunk_subset(&chunk_indices);
            let overlap = chunk_subset.overlap(subset);
            let piece = overlap
                .relative_to(chunk_subset.start())
                .extract_from(&chunk_local, &chunk_bytes)?;
            overlap
                .relative_to(subset.start())
                .store_into(&piece, &subset_local, &mut bytes)?;
        }
        Ok(bytes)
    }

    /// Erase every chunk whose index on `axis` equals `index`.
    ///
    /// # Errors
    /// Returns a [`ChunkedArrayError`] on an underlying store error.
    pub async fn erase_axis_slice(&self, axis: usize, index: u64) -> Result<(), ChunkedArrayError> {
        Ok(self.storage.erase_axis_slice(axis, index).await?)
    }

    /// Relocate every chunk whose index on `axis` is at least `from` by
    /// `shift` chunk indices.
    ///
    /// # Errors
    /// Returns a [`ChunkedArrayError`] on an underlying store error.
    pub async fn relocate_chunks(
        &self,
        axis: usize,
        from: u64,
        shift: i64,
    ) -> Result<(), ChunkedArrayError> {
        Ok(self.storage.relocate_chunks(axis, from, shift).await?)
    }

    async fn retrieve_chunk_or_zeros(
        &self,
        chunk_indices: ArrayIndices,
    ) -> Result<Vec<u8>, ChunkedArrayError> {
        let chunk_num_elements = self.chunk_grid.chunk_num_elements();
        match self.storage.read_chunk(chunk_indices).await? {
            Some(chunk_bytes) => {
                if chunk_bytes.len() as u64 != chunk_num_elements {
                    return Err(ChunkedArrayError::UnexpectedChunkSize(
                        chunk_indices,
                        chunk_bytes.len(),
                        chunk_num_elements,
                    ));
                }
                Ok(chunk_bytes.to_vec())
            }
            None => Ok(vec![0u8; usize::try_from(chunk_num_elements).unwrap()]),
        }
    }
}
