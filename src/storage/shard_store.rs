use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{array_subset::ArraySubset, sharding::ShardSpec, ArrayIndices, ArrayShape};

use super::StorageError;

/// The metadata record of a sharded output array.
///
/// This is the declarative description consumed by the sharded-array backend;
/// it carries the shard bit split alongside the geometry so downstream
/// readers can address chunks without re-deriving the layout.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct ShardedArrayMetadata {
    /// The array size in voxels.
    pub size: ArrayShape,
    /// The chunk size in voxels.
    pub chunk_size: ArrayShape,
    /// The shard size in voxels.
    pub shard_size: ArrayShape,
    /// The voxel resolution in nanometres, per `(z, y, x)` axis.
    pub resolution: [u64; 3],
    /// The shard bit split.
    pub sharding: ShardSpec,
    /// The element data type.
    pub data_type: String,
}

/// One open shard write transaction.
///
/// All writes staged through a transaction become visible together on
/// [`commit`](ShardTransaction::commit); a transaction that is dropped
/// without committing leaves no trace in the destination.
#[async_trait]
pub trait ShardTransaction: Send {
    /// Return the shard's voxel subset of the destination volume.
    fn subset(&self) -> &ArraySubset;

    /// Stage `bytes`, the row-major voxels of `region`, into the shard.
    ///
    /// `region` is in volume coordinates and must lie within the shard's
    /// subset. Distinct regions of one transaction must be disjoint.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if `region` leaves the shard subset or
    /// `bytes` has the wrong length.
    async fn write_region(&mut self, region: &ArraySubset, bytes: &[u8])
        -> Result<(), StorageError>;

    /// Atomically publish every staged write.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on an underlying store error; the shard is
    /// then absent from the destination, never partially visible.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// The capability interface of a sharded array backend.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Create the sharded array, writing its metadata record.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on an underlying store error.
    async fn create(&self, metadata: &ShardedArrayMetadata) -> Result<(), StorageError>;

    /// Open a write transaction for the shard at `shard_indices` covering
    /// `subset` of the destination volume.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on an underlying store error.
    async fn begin_shard(
        &self,
        shard_indices: ArrayIndices,
        subset: ArraySubset,
    ) -> Result<Box<dyn ShardTransaction>, StorageError>;
}
