//! A volumetric storage engine for assembling large 3D image volumes out of
//! independently-acquired 2D section images.
//!
//! Sections arrive with arbitrary, possibly negative, `(z, y, x)` placement
//! offsets relative to each other. `voxstack` places them into a growable
//! chunked on-disk array, transparently extending and relocating chunk
//! directories as the volume grows in either direction, and can bulk-export a
//! pre-placed section stack into a sharded array layout for distribution.
//!
//! ## Getting started
//! - [`volume::Volume`] is the incremental path: create a volume, then
//!   [`write_section`](volume::Volume::write_section) /
//!   [`append_section`](volume::Volume::append_section) /
//!   [`remove_section`](volume::Volume::remove_section) one section at a time.
//! - [`writer::ShardedVolumeWriter`] is the bulk path: plan a shard layout
//!   with [`hierarchy::SizeHierarchy`] and [`sharding::pick_shard_bits`], then
//!   write every section in one pass, one atomic transaction per shard.
//! - [`storage`] defines the backend capabilities ([`storage::ChunkStore`],
//!   [`storage::ShardStore`]) and the bundled filesystem and in-memory stores.
//!
//! ## Example
//! ```rust,ignore
//! # use voxstack::volume::{SectionImage, Volume};
//! let mut volume = Volume::create("/path/to/root", "stack", [1, 2744, 2744]).await?;
//! let section = SectionImage::from_2d(123, 342, vec![1; 123 * 342])?;
//! volume.write_section(1, &section, [0, 0, 0]).await?;
//! let restored = volume.get_section_data(1).await?;
//! assert_eq!(restored.data(), section.data());
//! # Ok::<(), voxstack::volume::VolumeError>(())
//! ```
//!
//! ## Crate features
//! - `ndarray` (default): [`ndarray`] conversions for
//!   [`SectionImage`](volume::SectionImage).
//!
//! ## Concurrency
//! Volume mutation is single-writer: chunk relocation is a multi-step
//! filesystem operation with no isolation, so the mutating methods take
//! `&mut self`. Shards are the unit of atomicity on the bulk path; a shard
//! transaction either commits in full or is abandoned.

pub mod array;
pub mod array_subset;
pub mod chunk_grid;
pub mod hierarchy;
pub mod placement;
pub mod sharding;
pub mod storage;
pub mod volume;
pub mod writer;

/// An index to a voxel or chunk along each `(z, y, x)` axis.
pub type ArrayIndices = [u64; 3];

/// The extent of an array along each `(z, y, x)` axis.
pub type ArrayShape = [u64; 3];

/// A signed `(z, y, x)` voxel offset, measured from a volume origin.
pub type VoxelOffset = [i64; 3];

/// The identifier of a section placed into a volume.
pub type SectionId = u64;
