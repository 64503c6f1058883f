//! Shard bit allocation.
//!
//! A sharded array addresses its chunks with a fixed-width bit string: the
//! low `preshift_bits` and `minishard_bits` select the position within a
//! shard, and the remaining `shard_bits` select the shard itself. The split
//! must exactly cover the chunk-grid index, so the shard bit count is derived
//! from the grid rather than chosen freely.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The bit split of a sharded chunk index.
///
/// Invariant: `preshift_bits + minishard_bits + shard_bits` equals the total
/// number of chunk-grid index bits. Construct with [`pick_shard_bits`] to
/// uphold it.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Debug, Display)]
#[serde(deny_unknown_fields)]
#[display("{}", serde_json::to_string(self).unwrap_or_default())]
pub struct ShardSpec {
    /// Bits selecting a chunk within a minishard.
    pub preshift_bits: u32,
    /// Bits selecting a minishard within a shard.
    pub minishard_bits: u32,
    /// Bits selecting a shard.
    pub shard_bits: u32,
}

impl ShardSpec {
    /// Return the total number of index bits covered by the split.
    #[must_use]
    pub fn total_bits(&self) -> u32 {
        self.preshift_bits + self.minishard_bits + self.shard_bits
    }
}

/// A shard layout error.
#[derive(Debug, Error)]
pub enum ShardingError {
    /// The requested preshift/minishard bits leave no shard bits.
    #[error("insufficient bit budget: {preshift_bits} preshift and {minishard_bits} minishard bits exhaust the {total_bits} bit chunk index")]
    InsufficientBitBudget {
        /// Total chunk-grid index bits available.
        total_bits: u32,
        /// Requested preshift bits.
        preshift_bits: u32,
        /// Requested minishard bits.
        minishard_bits: u32,
    },
    /// An axis carries fewer index bits than the uniform per-axis shard extent requires.
    #[error("axis bits {bits_per_axis:?} cannot carry {split} uniform shard bits per axis")]
    UnevenBitSplit {
        /// Index bits per `(z, y, x)` axis.
        bits_per_axis: [u32; 3],
        /// Shard bits apportioned to each axis.
        split: u32,
    },
}

/// Derive the shard bit count from the chunk-grid index bits and the caller's
/// preshift/minishard bit counts.
///
/// # Errors
/// Returns [`ShardingError::InsufficientBitBudget`] if no bits remain for the
/// shard index. This is a hard precondition: callers must reduce
/// `preshift_bits`/`minishard_bits` or coarsen the chunk size before retrying.
pub fn pick_shard_bits(
    bits_per_axis: &[u32; 3],
    preshift_bits: u32,
    minishard_bits: u32,
) -> Result<ShardSpec, ShardingError> {
    let total_bits: u32 = bits_per_axis.iter().sum();
    if preshift_bits + minishard_bits >= total_bits {
        return Err(ShardingError::InsufficientBitBudget {
            total_bits,
            preshift_bits,
            minishard_bits,
        });
    }
    Ok(ShardSpec {
        preshift_bits,
        minishard_bits,
        shard_bits: total_bits - preshift_bits - minishard_bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_bits_cover_the_index() {
        let bits_per_axis = [4, 11, 12];
        let spec = pick_shard_bits(&bits_per_axis, 9, 6).unwrap();
        assert_eq!(spec.preshift_bits, 9);
        assert_eq!(spec.minishard_bits, 6);
        assert_eq!(spec.shard_bits, 12);
        assert_eq!(spec.total_bits(), bits_per_axis.iter().sum::<u32>());
    }

    #[test]
    fn shard_bits_insufficient_budget() {
        assert!(matches!(
            pick_shard_bits(&[1, 2, 2], 3, 2),
            Err(ShardingError::InsufficientBitBudget { total_bits: 5, .. })
        ));
        assert!(pick_shard_bits(&[0, 0, 0], 0, 0).is_err());
    }

    #[test]
    fn shard_spec_serialization() {
        let spec = ShardSpec {
            preshift_bits: 9,
            minishard_bits: 6,
            shard_bits: 15,
        };
        let json = serde_json::to_string(&spec).unwrap();
        let restored: ShardSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, spec);
    }
}
