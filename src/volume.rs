//! The growable section volume.
//!
//! A [`Volume`] owns a chunked on-disk array and the bookkeeping that places
//! 2D sections into it: the ordered section list, each section's offset and
//! shape, and the running origin correction. Sections can be written at
//! arbitrary, possibly negative, `(z, y, x)` offsets; the volume extends
//! itself by whole chunks in either direction, relocating existing chunk
//! files when it grows backward so every stored index stays non-negative.
//!
//! The bookkeeping is durable: a human-readable sidecar record is rewritten
//! after every mutation and [`Volume::load`] reconstructs the exact state,
//! cross-checking it against the stored array before trusting it.
//!
//! Mutating methods take `&mut self`: chunk relocation is a multi-step
//! filesystem operation with no isolation, so one writer owns the volume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    array::{ChunkedArray, ChunkedArrayError},
    array_subset::ArraySubset,
    chunk_grid::InvalidChunkShapeError,
    storage::{
        store::{FilesystemChunkStore, FilesystemStoreCreateError},
        ChunkStore, StorageError,
    },
    ArrayIndices, ArrayShape, SectionId, VoxelOffset,
};

/// The name of the volume sidecar record.
const VOLUME_METADATA_FILENAME: &str = "volume.json";

/// The name of the chunked array directory within a volume directory.
const DATA_DIR: &str = "data";

/// A volume error.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// The section has already been placed.
    #[error("section {_0} exists already")]
    DuplicateSection(SectionId),
    /// The section is not in the volume.
    #[error("section {_0} is not in the volume")]
    SectionNotFound(SectionId),
    /// A placement remains negative after origin correction.
    #[error("section placement {_0:?} is out of bounds after origin correction")]
    PlacementOutOfBounds(VoxelOffset),
    /// Inserting or removing a slice needs single-slice chunking in Z.
    #[error("inserting or removing sections requires a chunk depth of 1, the volume has {_0}")]
    UnsupportedChunkDepth(u64),
    /// A volume already exists at the target directory.
    #[error("a volume already exists at {}", _0.display())]
    AlreadyExists(PathBuf),
    /// The sidecar record disagrees with the stored array.
    #[error("volume metadata at {} is inconsistent with the stored array: {_1}", _0.display())]
    InconsistentMetadata(PathBuf, String),
    /// Section data has the wrong length for its shape.
    #[error(transparent)]
    InvalidSectionData(#[from] InvalidSectionDataError),
    /// An invalid chunk shape.
    #[error(transparent)]
    InvalidChunkShape(#[from] InvalidChunkShapeError),
    /// A chunked array error.
    #[error(transparent)]
    ChunkedArrayError(#[from] ChunkedArrayError),
    /// A store error.
    #[error(transparent)]
    StorageError(#[from] StorageError),
    /// A store create error.
    #[error(transparent)]
    StoreCreateError(#[from] FilesystemStoreCreateError),
    /// An error serializing or deserializing the sidecar record.
    #[error(transparent)]
    InvalidRecord(#[from] serde_json::Error),
    /// An IO error on the sidecar record.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// An invalid section data error.
#[derive(Debug, Error)]
#[error("section data has {_0} bytes, expected {_1}")]
pub struct InvalidSectionDataError(usize, u64);

/// One section image: a depth-1 box of `uint8` voxels.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SectionImage {
    shape: ArrayShape,
    data: Vec<u8>,
}

impl SectionImage {
    /// Create a section image of `(1, height, width)` from row-major `data`.
    ///
    /// # Errors
    /// Returns [`InvalidSectionDataError`] if `data` does not hold
    /// `height * width` bytes.
    pub fn from_2d(height: u64, width: u64, data: Vec<u8>) -> Result<Self, InvalidSectionDataError> {
        if data.len() as u64 != height * width {
            return Err(InvalidSectionDataError(data.len(), height * width));
        }
        Ok(Self {
            shape: [1, height, width],
            data,
        })
    }

    /// Return the `(1, height, width)` shape.
    #[must_use]
    pub fn shape(&self) -> &ArrayShape {
        &self.shape
    }

    /// Return the row-major voxels.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the section image, returning its voxels.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(feature = "ndarray")]
impl SectionImage {
    /// Create a section image from a 2D [`ndarray`] array.
    #[must_use]
    pub fn from_ndarray(array: &ndarray::Array2<u8>) -> Self {
        let (height, width) = array.dim();
        Self {
            shape: [1, height as u64, width as u64],
            data: array.iter().copied().collect(),
        }
    }

    /// Return the section as a 3D [`ndarray`] array of shape `(1, height, width)`.
    ///
    /// # Panics
    /// Panics if the section extent exceeds `usize`.
    #[must_use]
    pub fn to_ndarray(&self) -> ndarray::Array3<u8> {
        let [depth, height, width] = self.shape.map(|size| usize::try_from(size).unwrap());
        ndarray::Array3::from_shape_vec((depth, height, width), self.data.clone())
            .expect("shape matches data length")
    }
}

/// The sidecar record of a volume.
#[derive(Serialize, Deserialize, Debug)]
struct VolumeRecord {
    name: String,
    root_dir: PathBuf,
    data_path: PathBuf,
    chunk_shape: ArrayShape,
    sections: Vec<Option<SectionId>>,
    offsets: BTreeMap<SectionId, ArrayIndices>,
    shapes: BTreeMap<SectionId, ArrayShape>,
    origin: ArrayShape,
}

/// A growable volume of placed sections over a chunked on-disk array.
pub struct Volume {
    name: String,
    root_dir: PathBuf,
    data_path: PathBuf,
    storage: Arc<dyn ChunkStore>,
    array: Option<ChunkedArray>,
    chunk_shape: ArrayShape,
    section_order: Vec<Option<SectionId>>,
    section_offsets: BTreeMap<SectionId, ArrayIndices>,
    section_shapes: BTreeMap<SectionId, ArrayShape>,
    origin: ArrayShape,
}

impl Volume {
    /// Create a new volume named `name` under `root_dir`, chunked by
    /// `chunk_shape`.
    ///
    /// The chunk layout is fixed for the life of the volume. The volume
    /// directory is `<root_dir>/<name>` with the chunked array under its
    /// `data` subdirectory.
    ///
    /// # Errors
    /// Returns a [`VolumeError`] if a volume already exists there, the chunk
    /// shape is invalid, or the directories cannot be created.
    pub async fn create(
        root_dir: impl AsRef<Path>,
        name: &str,
        chunk_shape: ArrayShape,
    ) -> Result<Self, VolumeError> {
        crate::chunk_grid::RegularChunkGrid::new(chunk_shape)?;
        let root_dir = root_dir.as_ref().to_path_buf();
        let volume_dir = root_dir.join(name);
        if volume_dir.join(VOLUME_METADATA_FILENAME).exists() {
            return Err(VolumeError::AlreadyExists(volume_dir));
        }
        let data_path = volume_dir.join(DATA_DIR);
        tokio::fs::create_dir_all(&data_path).await?;
        let storage: Arc<dyn ChunkStore> = Arc::new(FilesystemChunkStore::new(&data_path)?);
        let volume = Self {
            name: name.to_string(),
            root_dir,
            data_path,
            storage,
            array: None,
            chunk_shape,
            section_order: Vec::new(),
            section_offsets: BTreeMap::new(),
            section_shapes: BTreeMap::new(),
            origin: [0; 3],
        };
        volume.save().await?;
        info!("created volume {name} at {}", volume.volume_dir().display());
        Ok(volume)
    }

    /// Load a volume from its directory.
    ///
    /// Reconstructs the exact saved state, including the origin and removed
    /// slots, and cross-checks it against the stored array: a chunk shape
    /// mismatch or a section extending beyond the declared array shape is a
    /// fatal [`VolumeError::InconsistentMetadata`], the signature of an
    /// interrupted relocation or resize.
    ///
    /// # Errors
    /// Returns a [`VolumeError`] if the sidecar record is missing, invalid,
    /// or inconsistent with the stored array.
    pub async fn load(volume_dir: impl AsRef<Path>) -> Result<Self, VolumeError> {
        let volume_dir = volume_dir.as_ref();
        let record_path = volume_dir.join(VOLUME_METADATA_FILENAME);
        let record: VolumeRecord = serde_json::from_slice(&tokio::fs::read(&record_path).await?)?;
        let storage: Arc<dyn ChunkStore> = Arc::new(FilesystemChunkStore::new(&record.data_path)?);

        let inconsistent = |reason: String| {
            VolumeError::InconsistentMetadata(record_path.clone(), reason)
        };
        let array = match storage.metadata().await? {
            Some(_) => Some(ChunkedArray::open(storage.clone()).await?),
            None => None,
        };
        match &array {
            Some(array) => {
                if array.chunk_shape() != &record.chunk_shape {
                    return Err(inconsistent(format!(
                        "stored chunk shape {:?} does not match recorded chunk shape {:?}",
                        array.chunk_shape(),
                        record.chunk_shape
                    )));
                }
                for (section_id, offset) in &record.offsets {
                    let Some(shape) = record.shapes.get(section_id) else {
                        return Err(inconsistent(format!(
                            "section {section_id} has an offset but no shape"
                        )));
                    };
                    if !record.sections.contains(&Some(*section_id)) {
                        return Err(inconsistent(format!(
                            "section {section_id} is missing from the section order"
                        )));
                    }
                    let subset = ArraySubset::new_with_start_shape(*offset, *shape);
                    if !subset.inbounds(array.shape()) {
                        return Err(inconsistent(format!(
                            "section {section_id} at {offset:?} with shape {shape:?} extends \
                             beyond the stored array shape {:?}",
                            array.shape()
                        )));
                    }
                }
                if std::iter::zip(&record.origin, &record.chunk_shape)
                    .any(|(origin, chunk)| origin % chunk != 0)
                {
                    return Err(inconsistent(format!(
                        "origin {:?} is not chunk aligned",
                        record.origin
                    )));
                }
            }
            None => {
                if !record.offsets.is_empty() {
                    return Err(inconsistent(
                        "sections are recorded but the array does not exist".to_string(),
                    ));
                }
            }
        }

        info!(
            "loaded volume {} with {} sections",
            record.name,
            record.offsets.len()
        );
        Ok(Self {
            name: record.name,
            root_dir: record.root_dir,
            data_path: record.data_path,
            storage,
            array,
            chunk_shape: record.chunk_shape,
            section_order: record.sections,
            section_offsets: record.offsets,
            section_shapes: record.shapes,
            origin: record.origin,
        })
    }

    /// Return the volume name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the volume directory.
    #[must_use]
    pub fn volume_dir(&self) -> PathBuf {
        self.root_dir.join(&self.name)
    }

    /// Return the chunked array directory.
    #[must_use]
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Return the chunk shape.
    #[must_use]
    pub fn chunk_shape(&self) -> &ArrayShape {
        &self.chunk_shape
    }

    /// Return the declared array shape, `[0, 0, 0]` before the first write.
    #[must_use]
    pub fn array_shape(&self) -> ArrayShape {
        self.array
            .as_ref()
            .map_or([0; 3], |array| *array.shape())
    }

    /// Return the running origin correction.
    ///
    /// Component-wise, the origin never decreases, and it only changes by
    /// whole multiples of the chunk shape.
    #[must_use]
    pub fn origin(&self) -> &ArrayShape {
        &self.origin
    }

    /// Return the ordered section slots; `None` marks a removed slot.
    #[must_use]
    pub fn sections(&self) -> &[Option<SectionId>] {
        &self.section_order
    }

    /// Return a section's offset from the origin.
    pub fn get_section_offset(&self, section_id: SectionId) -> Result<ArrayIndices, VolumeError> {
        self.section_offsets
            .get(&section_id)
            .copied()
            .ok_or(VolumeError::SectionNotFound(section_id))
    }

    /// Return a section's shape.
    pub fn get_section_shape(&self, section_id: SectionId) -> Result<ArrayShape, VolumeError> {
        self.section_shapes
            .get(&section_id)
            .copied()
            .ok_or(VolumeError::SectionNotFound(section_id))
    }

    /// Return a section's absolute origin: its recorded offset corrected by
    /// the volume origin.
    ///
    /// This is the `(z, y, x)` position the section was originally written
    /// at, and it is invariant under operations that do not touch the
    /// section, including backward extensions triggered by other sections.
    pub fn get_section_origin(&self, section_id: SectionId) -> Result<VoxelOffset, VolumeError> {
        let offset = self.get_section_offset(section_id)?;
        Ok(std::array::from_fn(|i| {
            offset[i] as i64 - self.origin[i] as i64
        }))
    }

    /// Write a section into the volume at `offset` from the current origin.
    ///
    /// The first write creates the array with the section's shape. Later
    /// writes extend the array as needed: a negative offset component grows
    /// the array backward by whole chunks, relocating every existing chunk on
    /// that axis and folding the shift into the origin and every recorded
    /// section offset; an overhang past the current extent grows the declared
    /// shape forward to exactly cover it. A Z offset inside the existing
    /// stack inserts the slice, shifting higher slices up by one chunk row.
    ///
    /// # Errors
    /// Returns [`VolumeError::DuplicateSection`] if the section was already
    /// placed, [`VolumeError::UnsupportedChunkDepth`] for an insert with
    /// chunked Z, or a [`VolumeError`] if storage fails.
    pub async fn write_section(
        &mut self,
        section_id: SectionId,
        data: &SectionImage,
        offset: VoxelOffset,
    ) -> Result<(), VolumeError> {
        if self.section_offsets.contains_key(&section_id) {
            return Err(VolumeError::DuplicateSection(section_id));
        }
        let shape = *data.shape();
        let current_shape = self.array_shape();
        let inserting = self.array.is_some()
            && offset[0] >= 0
            && (offset[0] as usize) < self.section_order.len();
        if inserting && self.chunk_shape[0] != 1 {
            return Err(VolumeError::UnsupportedChunkDepth(self.chunk_shape[0]));
        }
        debug!(
            "writing section {section_id} of shape {shape:?} at offset {offset:?} \
             (current array shape {current_shape:?})"
        );

        // Backward extension: whole chunks per negative axis, relocating
        // existing chunks highest index first.
        let mut effective_offset = offset;
        let mut new_shape = current_shape;
        for axis in 0..3 {
            if offset[axis] >= 0 {
                continue;
            }
            let chunk = self.chunk_shape[axis];
            let chunks_to_prepend = offset[axis].unsigned_abs().div_ceil(chunk);
            let voxel_shift = chunks_to_prepend * chunk;
            if let Some(array) = &self.array {
                array.relocate_chunks(axis, 0, chunks_to_prepend as i64).await?;
            }
            self.origin[axis] += voxel_shift;
            for section_offset in self.section_offsets.values_mut() {
                section_offset[axis] += voxel_shift;
            }
            effective_offset[axis] += voxel_shift as i64;
            new_shape[axis] = current_shape[axis] + voxel_shift;
            debug!(
                "extended axis {axis} backward by {chunks_to_prepend} chunks, origin now {:?}",
                self.origin
            );
        }
        let placement: ArrayShape = {
            let converted: [Option<u64>; 3] =
                std::array::from_fn(|i| u64::try_from(effective_offset[i]).ok());
            if converted.iter().any(Option::is_none) {
                return Err(VolumeError::PlacementOutOfBounds(offset));
            }
            std::array::from_fn(|i| converted[i].unwrap_or_default())
        };

        // Insert into the stack: free the slice row by shifting higher rows up.
        if inserting {
            let insert_row = placement[0];
            if let Some(array) = &self.array {
                array.relocate_chunks(0, insert_row, 1).await?;
            }
            for section_offset in self.section_offsets.values_mut() {
                if section_offset[0] >= insert_row {
                    section_offset[0] += 1;
                }
            }
            new_shape[0] += 1;
            debug!("inserted a slice at Z {insert_row}");
        }

        // Forward extension: the declared shape grows to exactly cover the
        // overhang, the trailing chunk absorbs the remainder.
        for axis in 0..3 {
            new_shape[axis] = std::cmp::max(new_shape[axis], placement[axis] + shape[axis]);
        }

        if let Some(array) = &mut self.array {
            if new_shape != current_shape {
                array.resize(new_shape).await?;
            }
        } else {
            self.array = Some(
                ChunkedArray::create(self.storage.clone(), new_shape, self.chunk_shape).await?,
            );
        }
        let array = self.array.as_ref().unwrap_or_else(|| unreachable!());
        let subset = ArraySubset::new_with_start_shape(placement, shape);
        array.write_region(&subset, data.data()).await?;

        if offset[0] < 0 {
            self.section_order.insert(0, Some(section_id));
        } else {
            let index = offset[0] as usize;
            if inserting {
                self.section_order.insert(index, Some(section_id));
            } else {
                while self.section_order.len() < index {
                    self.section_order.push(None);
                }
                self.section_order.insert(index, Some(section_id));
            }
        }
        self.section_offsets.insert(section_id, placement);
        self.section_shapes.insert(section_id, shape);
        self.save().await?;
        Ok(())
    }

    /// Write a section at an offset relative to the last non-removed section.
    ///
    /// The canonical relative offset is `[1, 0, 0]`: one slice deeper, no XY
    /// shift. An empty volume writes at the origin.
    ///
    /// # Errors
    /// See [`write_section`](Self::write_section).
    pub async fn append_section(
        &mut self,
        section_id: SectionId,
        data: &SectionImage,
        relative_offset: VoxelOffset,
    ) -> Result<(), VolumeError> {
        let previous = self
            .section_order
            .iter()
            .rev()
            .find_map(|slot| slot.as_ref())
            .copied();
        match previous {
            None => self.write_section(section_id, data, [0, 0, 0]).await,
            Some(previous) => {
                let previous_offset = self.get_section_offset(previous)?;
                let offset: VoxelOffset = std::array::from_fn(|i| {
                    previous_offset[i] as i64 + relative_offset[i]
                });
                self.write_section(section_id, data, offset).await
            }
        }
    }

    /// Remove a section, dropping its slice from the stack.
    ///
    /// The chunk row at the section's Z index is erased, every higher row
    /// shifts down by one, the declared Z extent shrinks by one chunk row,
    /// and the Z offset of every section above decrements. The section's slot
    /// in the order list is kept as a `None` placeholder.
    ///
    /// # Errors
    /// Returns [`VolumeError::SectionNotFound`] if the section is not placed
    /// or [`VolumeError::UnsupportedChunkDepth`] for chunked Z.
    pub async fn remove_section(&mut self, section_id: SectionId) -> Result<(), VolumeError> {
        let offset = self.get_section_offset(section_id)?;
        if self.chunk_shape[0] != 1 {
            return Err(VolumeError::UnsupportedChunkDepth(self.chunk_shape[0]));
        }
        let row = offset[0];
        debug!("removing section {section_id} at Z {row}");
        let array = self
            .array
            .as_mut()
            .ok_or(VolumeError::SectionNotFound(section_id))?;
        array.erase_axis_slice(0, row).await?;
        array.relocate_chunks(0, row + 1, -1).await?;
        let mut shape = *array.shape();
        shape[0] -= 1;
        array.resize(shape).await?;

        for section_offset in self.section_offsets.values_mut() {
            if section_offset[0] > row {
                section_offset[0] -= 1;
            }
        }
        if let Some(slot) = self
            .section_order
            .iter_mut()
            .find(|slot| **slot == Some(section_id))
        {
            *slot = None;
        }
        self.section_offsets.remove(&section_id);
        self.section_shapes.remove(&section_id);
        self.save().await?;
        Ok(())
    }

    /// Read back exactly the voxels a section was written with.
    ///
    /// # Errors
    /// Returns [`VolumeError::SectionNotFound`] if the section is not placed
    /// or a [`VolumeError`] if storage fails.
    pub async fn get_section_data(&self, section_id: SectionId) -> Result<SectionImage, VolumeError> {
        let offset = self.get_section_offset(section_id)?;
        let shape = self
            .section_shapes
            .get(&section_id)
            .copied()
            .ok_or(VolumeError::SectionNotFound(section_id))?;
        let array = self
            .array
            .as_ref()
            .ok_or(VolumeError::SectionNotFound(section_id))?;
        let subset = ArraySubset::new_with_start_shape(offset, shape);
        let data = array.read_region(&subset).await?;
        Ok(SectionImage { shape, data })
    }

    /// Persist the sidecar record.
    ///
    /// Called after every mutation; also safe to call at any time.
    ///
    /// # Errors
    /// Returns a [`VolumeError`] if the record cannot be written.
    pub async fn save(&self) -> Result<(), VolumeError> {
        let record = VolumeRecord {
            name: self.name.clone(),
            root_dir: self.root_dir.clone(),
            data_path: self.data_path.clone(),
            chunk_shape: self.chunk_shape,
            sections: self.section_order.clone(),
            offsets: self.section_offsets.clone(),
            shapes: self.section_shapes.clone(),
            origin: self.origin,
        };
        let json = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(self.volume_dir().join(VOLUME_METADATA_FILENAME), json).await?;
        Ok(())
    }
}
