//! Section placement helpers.
//!
//! The registration layer hands the storage engine relative XY offsets
//! between consecutive sections. These helpers turn them into the absolute,
//! non-negative placements the bulk writer needs, and size the destination
//! volume to fit them. The storage engine itself never sees registration
//! quality or tile metadata, only the resulting placements.

use thiserror::Error;

use crate::ArrayShape;

/// A negative placement error.
///
/// Bulk-path placements are absolute voxel coordinates in the destination
/// volume and must be non-negative.
#[derive(Clone, Debug, Error)]
#[error("negative placement {coords:?} for section index {index}")]
pub struct NegativePlacementError {
    /// The index of the offending section.
    pub index: usize,
    /// The offending coordinates.
    pub coords: [i64; 2],
}

/// Accumulate relative `(y, x)` offsets between consecutive sections into
/// per-section coordinates.
///
/// The first section sits at `[0, 0]` and each subsequent coordinate is the
/// running sum of the offsets. The result is normalized so the minimum
/// coordinate on each axis is zero; the returned coordinates are therefore
/// non-negative.
#[must_use]
pub fn offsets_to_coords(relative_offsets: &[[i64; 2]]) -> Vec<[i64; 2]> {
    let mut coords = Vec::with_capacity(relative_offsets.len() + 1);
    let mut running = [0i64; 2];
    coords.push(running);
    for offset in relative_offsets {
        running = [running[0] + offset[0], running[1] + offset[1]];
        coords.push(running);
    }
    let min: [i64; 2] = std::array::from_fn(|i| {
        coords.iter().map(|coord| coord[i]).min().unwrap_or(0)
    });
    for coord in &mut coords {
        coord[0] -= min[0];
        coord[1] -= min[1];
    }
    coords
}

/// Convert per-section `(y, x)` coordinates into `(z, y, x)` volume
/// placements, one section per Z slice.
///
/// # Errors
/// Returns [`NegativePlacementError`] for the first section with a negative
/// coordinate.
pub fn coords_to_placements(
    coords: &[[i64; 2]],
) -> Result<Vec<[u64; 3]>, NegativePlacementError> {
    coords
        .iter()
        .enumerate()
        .map(|(index, coord)| {
            let y = u64::try_from(coord[0]);
            let x = u64::try_from(coord[1]);
            match (y, x) {
                (Ok(y), Ok(x)) => Ok([index as u64, y, x]),
                _ => Err(NegativePlacementError {
                    index,
                    coords: *coord,
                }),
            }
        })
        .collect()
}

/// Estimate the voxel extent of a volume holding `shapes[i]` placed at
/// `placements[i]`.
///
/// The extent on each axis is the maximum of `placement + shape` over all
/// sections; `[0, 0, 0]` if there are none.
#[must_use]
pub fn estimate_volume_size(shapes: &[ArrayShape], placements: &[[u64; 3]]) -> ArrayShape {
    let mut size = [0u64; 3];
    for (shape, placement) in std::iter::zip(shapes, placements) {
        for (axis, extent) in size.iter_mut().enumerate() {
            *extent = std::cmp::max(*extent, placement[axis] + shape[axis]);
        }
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_accumulate_and_normalize() {
        let coords = offsets_to_coords(&[[10, -5], [-30, 5], [5, 5]]);
        // raw cumulative coords: [0,0], [10,-5], [-20,0], [-15,5]; minimum [-20,-5]
        assert_eq!(coords, vec![[20, 5], [30, 0], [0, 5], [5, 10]]);
        assert_eq!(offsets_to_coords(&[]), vec![[0, 0]]);
    }

    #[test]
    fn coords_become_placements() {
        let placements = coords_to_placements(&[[0, 0], [20, 5]]).unwrap();
        assert_eq!(placements, vec![[0, 0, 0], [1, 20, 5]]);

        let err = coords_to_placements(&[[0, 0], [-1, 5]]).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.coords, [-1, 5]);
    }

    #[test]
    fn volume_size_covers_every_section() {
        let shapes = [[1, 100, 200], [1, 120, 150]];
        let placements = [[0, 0, 0], [1, 30, 80]];
        assert_eq!(
            estimate_volume_size(&shapes, &placements),
            [2, 150, 230]
        );
        assert_eq!(estimate_volume_size(&[], &[]), [0, 0, 0]);
    }
}
