//! The volume size hierarchy.
//!
//! A [`SizeHierarchy`] relates a volume's voxel extent to its chunk grid and,
//! once a shard size is chosen, to its shard grid. The grid shapes and the
//! per-axis chunk index bits are derived values: they are recomputed whenever
//! the chunk or shard size is set and never stored independently of their
//! inputs.

use serde::Serialize;

use crate::{
    array_subset::ArraySubset,
    chunk_grid::{ceil_log2, InvalidChunkShapeError, RegularChunkGrid},
    sharding::ShardingError,
    ArrayIndices, ArrayShape,
};

/// The size hierarchy of a volume: voxels, chunks, and optionally shards.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SizeHierarchy {
    volume_size: ArrayShape,
    chunk_size: ArrayShape,
    shard_size: Option<ArrayShape>,
    grid_shape_in_chunks: ArrayShape,
    grid_shape_in_shards: Option<ArrayShape>,
    bits_per_axis: [u32; 3],
}

impl SizeHierarchy {
    /// Create a new size hierarchy for a volume of `volume_size` chunked by
    /// `chunk_size`.
    ///
    /// # Errors
    /// Returns [`InvalidChunkShapeError`] if any component of `chunk_size` is zero.
    pub fn new(
        volume_size: ArrayShape,
        chunk_size: ArrayShape,
    ) -> Result<Self, InvalidChunkShapeError> {
        let mut hierarchy = Self {
            volume_size,
            chunk_size,
            shard_size: None,
            grid_shape_in_chunks: [0; 3],
            grid_shape_in_shards: None,
            bits_per_axis: [0; 3],
        };
        hierarchy.set_chunk_size(chunk_size)?;
        Ok(hierarchy)
    }

    /// Return the volume size in voxels.
    #[must_use]
    pub fn volume_size(&self) -> &ArrayShape {
        &self.volume_size
    }

    /// Return the chunk size in voxels.
    #[must_use]
    pub fn chunk_size(&self) -> &ArrayShape {
        &self.chunk_size
    }

    /// Return the shard size in voxels, if one has been set.
    #[must_use]
    pub fn shard_size(&self) -> Option<&ArrayShape> {
        self.shard_size.as_ref()
    }

    /// Return the shape of the chunk grid.
    #[must_use]
    pub fn grid_shape_in_chunks(&self) -> &ArrayShape {
        &self.grid_shape_in_chunks
    }

    /// Return the shape of the shard grid, if a shard size has been set.
    #[must_use]
    pub fn grid_shape_in_shards(&self) -> Option<&ArrayShape> {
        self.grid_shape_in_shards.as_ref()
    }

    /// Return the chunk index bits per `(z, y, x)` axis.
    #[must_use]
    pub fn bits_per_axis(&self) -> &[u32; 3] {
        &self.bits_per_axis
    }

    /// Set the chunk size, recomputing the chunk grid shape and index bits.
    ///
    /// # Errors
    /// Returns [`InvalidChunkShapeError`] if any component of `chunk_size` is zero.
    pub fn set_chunk_size(
        &mut self,
        chunk_size: ArrayShape,
    ) -> Result<(), InvalidChunkShapeError> {
        let grid = RegularChunkGrid::new(chunk_size)?;
        self.chunk_size = chunk_size;
        self.grid_shape_in_chunks = grid.grid_shape(&self.volume_size);
        self.bits_per_axis =
            std::array::from_fn(|i| ceil_log2(self.grid_shape_in_chunks[i].saturating_sub(1)));
        Ok(())
    }

    /// Set the shard size, recomputing the shard grid shape.
    pub fn set_shard_size(&mut self, shard_size: ArrayShape) {
        self.grid_shape_in_shards = Some(std::array::from_fn(|i| {
            if shard_size[i] == 0 {
                0
            } else {
                self.volume_size[i].div_ceil(shard_size[i])
            }
        }));
        self.shard_size = Some(shard_size);
    }

    /// Derive a shard size from a preshift/minishard bit budget and set it.
    ///
    /// The budget is apportioned uniformly: each axis receives
    /// `(preshift_bits + minishard_bits) / 3` bits of shard extent, so a shard
    /// spans `2^((preshift_bits + minishard_bits) / 3)` chunks per axis. The
    /// uniform apportionment is only valid when every axis carries at least
    /// that many index bits; rather than silently producing an undersized
    /// shard on anisotropic volumes, the assumption is validated here.
    ///
    /// # Errors
    /// Returns [`ShardingError::UnevenBitSplit`] if any axis carries fewer
    /// index bits than the uniform split assigns to it.
    pub fn compute_shard_size(
        &mut self,
        preshift_bits: u32,
        minishard_bits: u32,
    ) -> Result<ArrayShape, ShardingError> {
        let split = (preshift_bits + minishard_bits) / 3;
        if self.bits_per_axis.iter().any(|&bits| bits < split) {
            return Err(ShardingError::UnevenBitSplit {
                bits_per_axis: self.bits_per_axis,
                split,
            });
        }
        let shard_size_in_chunks = 1u64 << split;
        let shard_size = std::array::from_fn(|i| shard_size_in_chunks * self.chunk_size[i]);
        self.set_shard_size(shard_size);
        Ok(shard_size)
    }

    /// Return the voxel subset of the shard at `shard_indices`, clamped to the
    /// volume bounds.
    ///
    /// Returns an empty subset if no shard size has been set.
    #[must_use]
    pub fn shard_subset(&self, shard_indices: &ArrayIndices) -> ArraySubset {
        let Some(shard_size) = &self.shard_size else {
            return ArraySubset::default();
        };
        let start = std::array::from_fn(|i| shard_indices[i] * shard_size[i]);
        ArraySubset::new_with_start_shape(start, *shard_size).bound(&self.volume_size)
    }

    /// Returns an iterator over the shard indices of the shard grid.
    ///
    /// Iteration order is Z outermost, then X, then Y, matching the shard
    /// numbering of the bulk writer. Empty if no shard size has been set.
    #[must_use]
    pub fn shard_indices(&self) -> ShardIndicesIterator {
        ShardIndicesIterator::new(self.grid_shape_in_shards.unwrap_or([0; 3]))
    }
}

/// An iterator over the shard indices of a shard grid.
///
/// Y varies fastest, then X, then Z.
#[derive(Clone, Debug)]
pub struct ShardIndicesIterator {
    grid_shape: ArrayShape,
    next: Option<ArrayIndices>,
}

impl ShardIndicesIterator {
    fn new(grid_shape: ArrayShape) -> Self {
        let next = grid_shape.iter().all(|&size| size > 0).then_some([0; 3]);
        Self { grid_shape, next }
    }
}

impl Iterator for ShardIndicesIterator {
    type Item = ArrayIndices;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let mut next = current;
        next[1] += 1;
        if next[1] == self.grid_shape[1] {
            next[1] = 0;
            next[2] += 1;
            if next[2] == self.grid_shape[2] {
                next[2] = 0;
                next[0] += 1;
            }
        }
        self.next = (next[0] < self.grid_shape[0]).then_some(next);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn hierarchy_grid_shapes_and_bits() {
        let hierarchy = SizeHierarchy::new([5, 100, 100], [1, 16, 16]).unwrap();
        assert_eq!(hierarchy.grid_shape_in_chunks(), &[5, 7, 7]);
        // ceil(log2(grid - 1)) per axis
        assert_eq!(hierarchy.bits_per_axis(), &[2, 3, 3]);
        assert!(hierarchy.shard_size().is_none());
        assert!(hierarchy.grid_shape_in_shards().is_none());
        assert_eq!(hierarchy.shard_indices().count(), 0);
    }

    #[test]
    fn hierarchy_single_chunk_axis_has_zero_bits() {
        let hierarchy = SizeHierarchy::new([1, 16, 64], [1, 16, 16]).unwrap();
        assert_eq!(hierarchy.grid_shape_in_chunks(), &[1, 1, 4]);
        assert_eq!(hierarchy.bits_per_axis(), &[0, 0, 2]);
    }

    #[test]
    fn hierarchy_compute_shard_size() {
        let mut hierarchy = SizeHierarchy::new([64, 1024, 1024], [1, 16, 16]).unwrap();
        assert_eq!(hierarchy.grid_shape_in_chunks(), &[64, 64, 64]);
        assert_eq!(hierarchy.bits_per_axis(), &[6, 6, 6]);

        // 6 bits split uniformly: 2 bits per axis, 4 chunks of shard extent.
        let shard_size = hierarchy.compute_shard_size(4, 2).unwrap();
        assert_eq!(shard_size, [4, 64, 64]);
        assert_eq!(hierarchy.grid_shape_in_shards(), Some(&[16, 16, 16]));

        // An axis with too few index bits rejects the uniform split.
        let mut flat = SizeHierarchy::new([2, 1024, 1024], [1, 16, 16]).unwrap();
        assert!(matches!(
            flat.compute_shard_size(4, 2),
            Err(ShardingError::UnevenBitSplit { split: 2, .. })
        ));
    }

    #[test]
    fn shard_iteration_order_is_z_then_x_then_y() {
        let mut hierarchy = SizeHierarchy::new([4, 4, 4], [1, 1, 1]).unwrap();
        hierarchy.set_shard_size([2, 2, 2]);
        let indices: Vec<_> = hierarchy.shard_indices().collect();
        assert_eq!(
            indices,
            vec![
                [0, 0, 0],
                [0, 1, 0],
                [0, 0, 1],
                [0, 1, 1],
                [1, 0, 0],
                [1, 1, 0],
                [1, 0, 1],
                [1, 1, 1],
            ]
        );
    }

    #[test]
    fn shard_subsets_partition_the_volume() {
        let mut hierarchy = SizeHierarchy::new([5, 100, 90], [1, 16, 16]).unwrap();
        hierarchy.set_shard_size([2, 64, 64]);
        assert_eq!(hierarchy.grid_shape_in_shards(), Some(&[3, 2, 2]));

        let mut covered = HashSet::new();
        for shard_indices in hierarchy.shard_indices() {
            let subset = hierarchy.shard_subset(&shard_indices);
            assert!(subset.inbounds(hierarchy.volume_size()));
            for voxel in subset.indices() {
                // no overlaps
                assert!(covered.insert(voxel));
            }
        }
        // no gaps
        assert_eq!(covered.len(), 5 * 100 * 90);
    }
}
