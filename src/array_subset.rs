//! Array subsets.
//!
//! An [`ArraySubset`] is a half-open axis-aligned box of voxels used whenever
//! a region of a section, chunk, or shard is read, written, or intersected.
//! Subsets are ephemeral computation intermediates; every coordinate is an
//! unsigned array index, so callers resolve signed placement offsets before
//! constructing one.
//!
//! This module also provides the raw-byte copy kernels for moving the
//! contents of a subset in and out of the row-major bytes of an enclosing
//! subset.

use std::ops::Range;

use derive_more::Display;
use itertools::izip;
use thiserror::Error;

use crate::{ArrayIndices, ArrayShape};

/// An array subset.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Display, Default)]
#[display("start {start:?} shape {shape:?}")]
pub struct ArraySubset {
    /// The start of the array subset.
    start: ArrayIndices,
    /// The shape of the array subset.
    shape: ArrayShape,
}

/// A subset bytes error.
///
/// Returned when copying bytes between a subset and an enclosing subset with
/// incompatible bounds or buffer lengths.
#[derive(Debug, Error)]
pub enum SubsetBytesError {
    /// The subset does not lie within the enclosing subset.
    #[error("subset {_0} does not lie within {_1}")]
    SubsetOutOfBounds(ArraySubset, ArraySubset),
    /// A buffer length does not match the subset it represents.
    #[error("buffer of {_0} bytes is incompatible with {_1}")]
    InvalidLength(usize, ArraySubset),
}

impl From<[Range<u64>; 3]> for ArraySubset {
    fn from(ranges: [Range<u64>; 3]) -> Self {
        Self {
            start: std::array::from_fn(|i| ranges[i].start),
            shape: std::array::from_fn(|i| ranges[i].end.saturating_sub(ranges[i].start)),
        }
    }
}

impl ArraySubset {
    /// Create a new array subset with `shape` starting at the origin.
    #[must_use]
    pub fn new_with_shape(shape: ArrayShape) -> Self {
        Self {
            start: [0; 3],
            shape,
        }
    }

    /// Create a new array subset.
    #[must_use]
    pub fn new_with_start_shape(start: ArrayIndices, shape: ArrayShape) -> Self {
        Self { start, shape }
    }

    /// Create a new array subset from a start and end (exclusive).
    ///
    /// Any axis where `end` is below `start` yields an empty extent.
    #[must_use]
    pub fn new_with_start_end_exc(start: ArrayIndices, end: ArrayIndices) -> Self {
        let shape = std::array::from_fn(|i| end[i].saturating_sub(start[i]));
        Self { start, shape }
    }

    /// Return the start of the array subset.
    #[must_use]
    pub fn start(&self) -> &ArrayIndices {
        &self.start
    }

    /// Return the shape of the array subset.
    #[must_use]
    pub fn shape(&self) -> &ArrayShape {
        &self.shape
    }

    /// Return the end (exclusive) of the array subset.
    #[must_use]
    pub fn end_exc(&self) -> ArrayIndices {
        std::array::from_fn(|i| self.start[i] + self.shape[i])
    }

    /// Return the number of elements of the array subset.
    ///
    /// Equal to the product of the components of its shape.
    #[must_use]
    pub fn num_elements(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Return the number of elements of the array subset as a `usize`.
    ///
    /// # Panics
    /// Panics if [`num_elements()`](Self::num_elements) is greater than [`usize::MAX`].
    #[must_use]
    pub fn num_elements_usize(&self) -> usize {
        usize::try_from(self.num_elements()).unwrap()
    }

    /// Returns true if the array subset is empty (any axis has zero extent).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shape.iter().any(|&size| size == 0)
    }

    /// Return the intersection of this array subset with `other`.
    ///
    /// The intersection is empty if the subsets are disjoint.
    #[must_use]
    pub fn overlap(&self, other: &Self) -> Self {
        let start = std::array::from_fn(|i| std::cmp::max(self.start[i], other.start[i]));
        let end = std::array::from_fn(|i| {
            std::cmp::min(self.start[i] + self.shape[i], other.start[i] + other.shape[i])
        });
        Self::new_with_start_end_exc(start, end)
    }

    /// Bound the array subset to the domain within `end` (exclusive).
    #[must_use]
    pub fn bound(&self, end: &ArrayShape) -> Self {
        let start = std::array::from_fn(|i| std::cmp::min(self.start[i], end[i]));
        let end = std::array::from_fn(|i| std::cmp::min(self.start[i] + self.shape[i], end[i]));
        Self::new_with_start_end_exc(start, end)
    }

    /// Return this array subset relative to `origin`, preserving its shape.
    ///
    /// The subset start must not precede `origin` on any axis; an axis where
    /// it does saturates to zero.
    #[must_use]
    pub fn relative_to(&self, origin: &ArrayIndices) -> Self {
        debug_assert!(izip!(&self.start, origin).all(|(start, origin)| start >= origin));
        Self {
            start: std::array::from_fn(|i| self.start[i].saturating_sub(origin[i])),
            shape: self.shape,
        }
    }

    /// Return this array subset shifted forward by `offset`.
    #[must_use]
    pub fn shifted(&self, offset: &ArrayIndices) -> Self {
        Self {
            start: std::array::from_fn(|i| self.start[i] + offset[i]),
            shape: self.shape,
        }
    }

    /// Returns true if the array subset is within the bounds of `array_shape`.
    #[must_use]
    pub fn inbounds(&self, array_shape: &ArrayShape) -> bool {
        izip!(&self.start, &self.shape, array_shape)
            .all(|(start, size, bound)| start + size <= *bound)
    }

    /// Returns an iterator over the `(z, y, x)` indices of elements within the subset.
    #[must_use]
    pub fn indices(&self) -> IndicesIterator {
        IndicesIterator::new(self)
    }

    /// Extract the bytes of this subset out of `outer_bytes`, the row-major
    /// bytes of `outer`.
    ///
    /// Both subsets are in the same coordinate space.
    ///
    /// # Errors
    /// Returns a [`SubsetBytesError`] if this subset does not lie within
    /// `outer` or `outer_bytes` has the wrong length.
    pub fn extract_from(
        &self,
        outer: &ArraySubset,
        outer_bytes: &[u8],
    ) -> Result<Vec<u8>, SubsetBytesError> {
        self.validate_against(outer, outer_bytes.len())?;
        let rel = self.relative_to(&outer.start);
        let [depth, height, width] = rel.shape.map(|size| usize::try_from(size).unwrap());
        let [_, outer_height, outer_width] = outer.shape.map(|size| usize::try_from(size).unwrap());
        let [start_z, start_y, start_x] = rel.start.map(|index| usize::try_from(index).unwrap());
        let mut bytes = Vec::with_capacity(depth * height * width);
        for z in 0..depth {
            for y in 0..height {
                let offset = ((start_z + z) * outer_height + start_y + y) * outer_width + start_x;
                bytes.extend_from_slice(&outer_bytes[offset..offset + width]);
            }
        }
        Ok(bytes)
    }

    /// Overlay `subset_bytes`, the row-major bytes of this subset, into
    /// `outer_bytes`, the row-major bytes of `outer`.
    ///
    /// Both subsets are in the same coordinate space.
    ///
    /// # Errors
    /// Returns a [`SubsetBytesError`] if this subset does not lie within
    /// `outer` or either buffer has the wrong length.
    pub fn store_into(
        &self,
        subset_bytes: &[u8],
        outer: &ArraySubset,
        outer_bytes: &mut [u8],
    ) -> Result<(), SubsetBytesError> {
        self.validate_against(outer, outer_bytes.len())?;
        if subset_bytes.len() as u64 != self.num_elements() {
            return Err(SubsetBytesError::InvalidLength(subset_bytes.len(), *self));
        }
        let rel = self.relative_to(&outer.start);
        let [depth, height, width] = rel.shape.map(|size| usize::try_from(size).unwrap());
        let [_, outer_height, outer_width] = outer.shape.map(|size| usize::try_from(size).unwrap());
        let [start_z, start_y, start_x] = rel.start.map(|index| usize::try_from(index).unwrap());
        for z in 0..depth {
            for y in 0..height {
                let src = (z * height + y) * width;
                let dst = ((start_z + z) * outer_height + start_y + y) * outer_width + start_x;
                outer_bytes[dst..dst + width].copy_from_slice(&subset_bytes[src..src + width]);
            }
        }
        Ok(())
    }

    fn validate_against(
        &self,
        outer: &ArraySubset,
        outer_bytes_len: usize,
    ) -> Result<(), SubsetBytesError> {
        let within = izip!(&self.start, &self.shape, &outer.start, &outer.shape).all(
            |(start, size, outer_start, outer_size)| {
                start >= outer_start && start + size <= outer_start + outer_size
            },
        );
        if !within {
            return Err(SubsetBytesError::SubsetOutOfBounds(*self, *outer));
        }
        if outer_bytes_len as u64 != outer.num_elements() {
            return Err(SubsetBytesError::InvalidLength(outer_bytes_len, *outer));
        }
        Ok(())
    }
}

/// An iterator over the `(z, y, x)` indices of elements within an [`ArraySubset`].
///
/// X varies fastest, then Y, then Z.
#[derive(Clone, Debug)]
pub struct IndicesIterator {
    start: ArrayIndices,
    end: ArrayIndices,
    next: Option<ArrayIndices>,
}

impl IndicesIterator {
    fn new(subset: &ArraySubset) -> Self {
        let next = (!subset.is_empty()).then_some(subset.start);
        Self {
            start: subset.start,
            end: subset.end_exc(),
            next,
        }
    }
}

impl Iterator for IndicesIterator {
    type Item = ArrayIndices;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let mut next = current;
        next[2] += 1;
        if next[2] == self.end[2] {
            next[2] = self.start[2];
            next[1] += 1;
            if next[1] == self.end[1] {
                next[1] = self.start[1];
                next[0] += 1;
            }
        }
        self.next = (next[0] < self.end[0]).then_some(next);
        Some(current)
    }
}
