//! Storage capabilities for chunked and sharded arrays.
//!
//! The volume store is portable across backends: everything it needs from the
//! on-disk format is captured by the [`ChunkStore`] capability (create an
//! array, read/write/erase a chunk, patch the declared shape in place,
//! relocate a range of chunks), and everything the bulk writer needs by the
//! [`ShardStore`] capability (create a sharded array, open an atomic per-shard
//! write transaction).
//!
//! Concrete stores live in [`store`]: a filesystem store with nested
//! `<z>/<y>/<x>` chunk files, a filesystem shard store with one file per
//! shard, and an in-memory store.
//!
//! All store I/O is asynchronous; chunk and shard operations are suspension
//! points.

mod chunk_store;
mod shard_store;
pub mod store;

use thiserror::Error;

pub use chunk_store::{ArrayMetadata, ChunkStore, UINT8_DATA_TYPE};
pub use shard_store::{ShardStore, ShardTransaction, ShardedArrayMetadata};

/// The type for bytes crossing the storage boundary.
///
/// An alias for [`bytes::Bytes`].
pub type Bytes = bytes::Bytes;

/// An alias for bytes which may or may not be present.
///
/// Reading an absent chunk returns [`None`]; the caller substitutes the fill
/// value (zeros).
pub type MaybeBytes = Option<Bytes>;

/// A storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// An error parsing a metadata record.
    #[error("error parsing metadata at {_0}: {_1}")]
    InvalidMetadata(String, String),
    /// The array metadata record is missing.
    #[error("array metadata is missing")]
    MissingMetadata,
    /// A chunk relocation would move a chunk to a negative index.
    #[error("relocating chunk {_0:?} by {_1} on axis {_2} moves it out of the grid")]
    InvalidRelocation(crate::ArrayIndices, i64, usize),
    /// Any other error.
    #[error("{_0}")]
    Other(String),
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}
