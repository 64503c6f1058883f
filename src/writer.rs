//! The sharded volume writer.
//!
//! The bulk export path: given a shard layout planned by a
//! [`SizeHierarchy`] and [`pick_shard_bits`](crate::sharding::pick_shard_bits),
//! a [`ShardedVolumeWriter`] places a whole pre-offset section stack into a
//! sharded destination in one pass, one atomic write transaction per shard.
//!
//! Sections stream through the writer: pixels load lazily through a
//! [`SectionSource`] when a shard first touches them and are dropped as soon
//! as no later shard can, so the writer never holds the whole stack resident.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;

use crate::{
    array_subset::{ArraySubset, SubsetBytesError},
    hierarchy::SizeHierarchy,
    sharding::ShardSpec,
    storage::{ShardStore, ShardedArrayMetadata, StorageError, UINT8_DATA_TYPE},
    volume::{SectionImage, Volume},
    ArrayIndices, ArrayShape, SectionId,
};

/// A bulk write error.
#[derive(Debug, Error)]
pub enum WriteVolumeError {
    /// A store error.
    #[error(transparent)]
    StorageError(#[from] StorageError),
    /// Sections and placements differ in length.
    #[error("{_0} sections but {_1} placements")]
    MismatchedPlacements(usize, usize),
    /// The hierarchy has no shard size.
    #[error("the size hierarchy has no shard size; call compute_shard_size or set_shard_size first")]
    MissingShardSize,
    /// A section extends beyond the destination volume.
    #[error("section {_0} of shape {_1:?} placed at {_2:?} extends beyond volume size {_3:?}")]
    SectionOutOfBounds(usize, ArrayShape, ArrayIndices, ArrayShape),
    /// A subset byte copy failed.
    #[error(transparent)]
    SubsetBytesError(#[from] SubsetBytesError),
}

/// A lazily-loadable source of one section's pixels.
///
/// The writer defers loading until a shard first intersects the section, and
/// releases the pixels once the shard sweep has passed it.
#[async_trait]
pub trait SectionSource: Send + Sync {
    /// Return the `(1, height, width)` shape of the section.
    fn shape(&self) -> ArrayShape;

    /// Load the section's row-major voxels.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the pixels cannot be read.
    async fn load(&self) -> Result<Vec<u8>, StorageError>;
}

#[async_trait]
impl SectionSource for SectionImage {
    fn shape(&self) -> ArrayShape {
        *SectionImage::shape(self)
    }

    async fn load(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.data().to_vec())
    }
}

/// A [`SectionSource`] reading a section back from a [`Volume`].
///
/// Connects the incremental path to the bulk path: sections stitched into a
/// growable volume can be re-exported into a sharded layout without an
/// intermediate copy of the stack.
pub struct VolumeSectionSource {
    volume: Arc<Volume>,
    section_id: SectionId,
    shape: ArrayShape,
}

impl VolumeSectionSource {
    /// Create a source for `section_id` in `volume`.
    ///
    /// # Errors
    /// Returns [`crate::volume::VolumeError::SectionNotFound`] if the section
    /// is not placed.
    pub fn new(
        volume: Arc<Volume>,
        section_id: SectionId,
    ) -> Result<Self, crate::volume::VolumeError> {
        let shape = volume.get_section_shape(section_id)?;
        Ok(Self {
            volume,
            section_id,
            shape,
        })
    }
}

#[async_trait]
impl SectionSource for VolumeSectionSource {
    fn shape(&self) -> ArrayShape {
        self.shape
    }

    async fn load(&self) -> Result<Vec<u8>, StorageError> {
        let section = self
            .volume
            .get_section_data(self.section_id)
            .await
            .map_err(|err| StorageError::Other(err.to_string()))?;
        Ok(section.into_data())
    }
}

/// A writer placing a pre-offset section stack into a sharded destination.
pub struct ShardedVolumeWriter {
    hierarchy: SizeHierarchy,
    shard_spec: ShardSpec,
    resolution: [u64; 3],
}

impl ShardedVolumeWriter {
    /// Create a writer for a planned shard layout.
    ///
    /// # Errors
    /// Returns [`WriteVolumeError::MissingShardSize`] if `hierarchy` has no
    /// shard size.
    pub fn new(
        hierarchy: SizeHierarchy,
        shard_spec: ShardSpec,
        resolution: [u64; 3],
    ) -> Result<Self, WriteVolumeError> {
        if hierarchy.shard_size().is_none() {
            return Err(WriteVolumeError::MissingShardSize);
        }
        Ok(Self {
            hierarchy,
            shard_spec,
            resolution,
        })
    }

    /// Write every section into `destination`, one transaction per shard.
    ///
    /// Shards are visited Z outermost, then X, then Y, and processed
    /// sequentially; within a shard, each intersecting section's overlap is
    /// cropped against both the section bounds and the shard box and staged
    /// at its placement-shifted location. A shard either commits in full or
    /// leaves no trace.
    ///
    /// # Errors
    /// Returns a [`WriteVolumeError`] on invalid inputs or a storage failure;
    /// the failing shard is left uncommitted.
    pub async fn write_volume(
        &self,
        destination: &dyn ShardStore,
        sections: &[Arc<dyn SectionSource>],
        placements: &[ArrayIndices],
    ) -> Result<(), WriteVolumeError> {
        if sections.len() != placements.len() {
            return Err(WriteVolumeError::MismatchedPlacements(
                sections.len(),
                placements.len(),
            ));
        }
        let volume_size = *self.hierarchy.volume_size();
        for (index, (section, placement)) in
            std::iter::zip(sections, placements).enumerate()
        {
            let subset = ArraySubset::new_with_start_shape(*placement, section.shape());
            if !subset.inbounds(&volume_size) {
                return Err(WriteVolumeError::SectionOutOfBounds(
                    index,
                    section.shape(),
                    *placement,
                    volume_size,
                ));
            }
        }
        let shard_size = self
            .hierarchy
            .shard_size()
            .copied()
            .ok_or(WriteVolumeError::MissingShardSize)?;
        destination
            .create(&ShardedArrayMetadata {
                size: volume_size,
                chunk_size: *self.hierarchy.chunk_size(),
                shard_size,
                resolution: self.resolution,
                sharding: self.shard_spec,
                data_type: UINT8_DATA_TYPE.to_string(),
            })
            .await?;
        info!(
            "writing {} sections into {:?} shards of {shard_size:?} voxels",
            sections.len(),
            self.hierarchy.grid_shape_in_shards()
        );

        let mut pixels: Vec<Option<Vec<u8>>> = vec![None; sections.len()];
        let section_z_ends: Vec<u64> = std::iter::zip(sections, placements)
            .map(|(section, placement)| placement[0] + section.shape()[0])
            .collect();
        let mut current_row = 0;
        for shard_indices in self.hierarchy.shard_indices() {
            if shard_indices[0] > current_row {
                current_row = shard_indices[0];
                release_finished_sections(
                    &mut pixels,
                    &section_z_ends,
                    current_row * shard_size[0],
                );
            }
            let shard_subset = self.hierarchy.shard_subset(&shard_indices);
            let mut transaction = destination
                .begin_shard(shard_indices, shard_subset)
                .await?;
            for (index, (section, placement)) in
                std::iter::zip(sections, placements).enumerate()
            {
                let section_subset =
                    ArraySubset::new_with_start_shape(*placement, section.shape());
                let overlap = section_subset.overlap(transaction.subset());
                if overlap.is_empty() {
                    continue;
                }
                if pixels[index].is_none() {
                    debug!("loading section {index} for shard {shard_indices:?}");
                    pixels[index] = Some(section.load().await?);
                }
                let Some(data) = pixels[index].as_deref() else {
                    unreachable!()
                };
                let piece = overlap
                    .relative_to(placement)
                    .extract_from(&ArraySubset::new_with_shape(section.shape()), data)?;
                transaction.write_region(&overlap, &piece).await?;
            }
            transaction.commit().await?;
            debug!("committed shard {shard_indices:?}");
        }
        Ok(())
    }
}

/// Drop the pixels of every section the Z sweep has passed.
///
/// With Z-outermost iteration, a section whose Z range ends at or before the
/// current shard row's start can never intersect a later shard.
fn release_finished_sections(
    pixels: &mut [Option<Vec<u8>>],
    section_z_ends: &[u64],
    row_start: u64,
) {
    for (index, entry) in pixels.iter_mut().enumerate() {
        if entry.is_some() && section_z_ends[index] <= row_start {
            debug!("releasing section {index}");
            *entry = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_release_once_the_sweep_passes_them() {
        let mut pixels = vec![Some(vec![0u8; 4]); 4];
        // sections ending at Z 1, 2, 3, 4; the second shard row starts at Z 2
        let section_z_ends = [1, 2, 3, 4];
        release_finished_sections(&mut pixels, &section_z_ends, 2);
        assert!(pixels[0].is_none());
        assert!(pixels[1].is_none());
        assert!(pixels[2].is_some());
        assert!(pixels[3].is_some());

        // an already released section stays released
        release_finished_sections(&mut pixels, &section_z_ends, 4);
        assert_eq!(pixels.iter().filter(|entry| entry.is_some()).count(), 0);
    }
}
