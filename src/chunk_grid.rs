//! The regular chunk grid.
//!
//! Every array in this crate is chunked on a regular grid: a fixed
//! `(z, y, x)` chunk shape tiles the array from its origin, and chunks are
//! addressed by per-axis integer indices. [`RegularChunkGrid`] holds the
//! voxel/chunk index arithmetic shared by the growable volume store and the
//! shard planner.

use thiserror::Error;

use crate::{array_subset::ArraySubset, ArrayIndices, ArrayShape};

/// An invalid chunk shape error.
#[derive(Clone, Debug, Error)]
#[error("invalid chunk shape {_0:?}, each axis must be non-zero")]
pub struct InvalidChunkShapeError(ArrayShape);

/// A regular chunk grid.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RegularChunkGrid {
    chunk_shape: ArrayShape,
}

impl RegularChunkGrid {
    /// Create a new regular chunk grid with chunk shape `chunk_shape`.
    ///
    /// # Errors
    /// Returns [`InvalidChunkShapeError`] if any component of `chunk_shape` is zero.
    pub fn new(chunk_shape: ArrayShape) -> Result<Self, InvalidChunkShapeError> {
        if chunk_shape.iter().any(|&size| size == 0) {
            Err(InvalidChunkShapeError(chunk_shape))
        } else {
            Ok(Self { chunk_shape })
        }
    }

    /// Return the chunk shape.
    #[must_use]
    pub fn chunk_shape(&self) -> &ArrayShape {
        &self.chunk_shape
    }

    /// Return the number of voxels in a chunk.
    #[must_use]
    pub fn chunk_num_elements(&self) -> u64 {
        self.chunk_shape.iter().product()
    }

    /// Return the shape of the chunk grid covering an array of `array_shape`.
    #[must_use]
    pub fn grid_shape(&self, array_shape: &ArrayShape) -> ArrayShape {
        std::array::from_fn(|i| array_shape[i].div_ceil(self.chunk_shape[i]))
    }

    /// Return the indices of the chunk holding the voxel at `array_indices`.
    #[must_use]
    pub fn chunk_indices(&self, array_indices: &ArrayIndices) -> ArrayIndices {
        std::array::from_fn(|i| array_indices[i] / self.chunk_shape[i])
    }

    /// Return the voxel origin of the chunk at `chunk_indices`.
    #[must_use]
    pub fn chunk_origin(&self, chunk_indices: &ArrayIndices) -> ArrayIndices {
        std::array::from_fn(|i| chunk_indices[i] * self.chunk_shape[i])
    }

    /// Return the voxel subset of the chunk at `chunk_indices`.
    ///
    /// The subset is not clamped to any array shape; edge chunks extend past
    /// the declared array extent.
    #[must_use]
    pub fn chunk_subset(&self, chunk_indices: &ArrayIndices) -> ArraySubset {
        ArraySubset::new_with_start_shape(self.chunk_origin(chunk_indices), self.chunk_shape)
    }

    /// Return the box of chunk indices overlapping the voxel `subset`.
    #[must_use]
    pub fn chunks_in_subset(&self, subset: &ArraySubset) -> ArraySubset {
        if subset.is_empty() {
            return ArraySubset::default();
        }
        let start = self.chunk_indices(subset.start());
        let end = subset.end_exc();
        let end_chunks = std::array::from_fn(|i| end[i].div_ceil(self.chunk_shape[i]));
        ArraySubset::new_with_start_end_exc(start, end_chunks)
    }
}

/// Return `ceil(log2(value))`, the minimum number of bits needed to encode
/// values up to `value`.
///
/// Zero and one both encode in zero bits.
#[must_use]
pub fn ceil_log2(value: u64) -> u32 {
    if value <= 1 {
        0
    } else {
        u64::BITS - (value - 1).leading_zeros()
    }
}
