// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Linear and pitched byte layouts, and the pool compatibility key.
//!
//! A pitched layout pads every row to a multiple of the allocator's
//! alignment unit so that each row starts on an aligned address. Rows are
//! stored back to back, and the `height` rows of one slice are followed
//! directly by the rows of the next slice:
//!
//! ```text
//!   offset(x, y, z) = (z * height + y) * pitch + x * element_size
//! ```

use crate::{DType, Extent, MemorySpace, ShapeError};

/// The physical byte layout of a buffer.
///
/// Only the constructors produce layouts, so `pitch >= row_bytes` always
/// holds; layouts serialise for reporting but are never deserialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct BufferLayout {
    extent: Extent,
    dtype: DType,
    pitch: usize,
    pitched: bool,
}

impl BufferLayout {
    /// A densely packed layout: `pitch == width * element_size`.
    pub fn linear(extent: Extent, dtype: DType) -> Result<Self, ShapeError> {
        let pitch = row_bytes_for(extent, dtype)?;
        Self::checked(extent, dtype, pitch, false)
    }

    /// A row-padded layout whose pitch is the row size rounded up to a
    /// multiple of `alignment` bytes.
    pub fn pitched(extent: Extent, dtype: DType, alignment: usize) -> Result<Self, ShapeError> {
        if !alignment.is_power_of_two() {
            return Err(ShapeError::InvalidAlignment(alignment));
        }
        let row_bytes = row_bytes_for(extent, dtype)?;
        let pitch = row_bytes
            .checked_add(alignment - 1)
            .map(|n| n & !(alignment - 1))
            .ok_or_else(|| overflow(extent))?;
        Self::checked(extent, dtype, pitch, true)
    }

    fn checked(
        extent: Extent,
        dtype: DType,
        pitch: usize,
        pitched: bool,
    ) -> Result<Self, ShapeError> {
        pitch
            .checked_mul(extent.rows())
            .ok_or_else(|| overflow(extent))?;
        Ok(Self {
            extent,
            dtype,
            pitch,
            pitched,
        })
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn element_size(&self) -> usize {
        self.dtype.size_bytes()
    }

    /// Row stride in bytes.
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Row stride in elements.
    pub fn pitch_elements(&self) -> usize {
        self.pitch / self.element_size()
    }

    /// Bytes of payload per row (`width * element_size`).
    pub fn row_bytes(&self) -> usize {
        self.extent.width() * self.element_size()
    }

    /// Number of rows across all slices.
    pub fn rows(&self) -> usize {
        self.extent.rows()
    }

    /// Total allocation size in bytes, padding included.
    pub fn size_bytes(&self) -> usize {
        self.pitch * self.rows()
    }

    /// Whether the layout was produced by a pitched allocator.
    pub fn is_pitched(&self) -> bool {
        self.pitched
    }

    /// `true` when rows carry no padding, so the payload is one
    /// contiguous span.
    pub fn is_contiguous(&self) -> bool {
        self.pitch == self.row_bytes()
    }

    /// Byte offset of the first element of row `y` in slice `z`.
    pub fn row_offset(&self, y: usize, z: usize) -> usize {
        (z * self.extent.height() + y) * self.pitch
    }

    /// Whether data can be copied between the two layouts: same extent
    /// and element type, regardless of pitch.
    pub fn is_copy_compatible(&self, other: &BufferLayout) -> bool {
        self.extent == other.extent && self.dtype == other.dtype
    }

    /// The pool key for a buffer with this layout in `space`.
    pub fn key(&self, space: MemorySpace) -> ShapeKey {
        ShapeKey {
            extent: self.extent,
            dtype: self.dtype,
            space,
            pitched: self.pitched,
        }
    }
}

/// Identifies which pooled buffers may satisfy a request.
///
/// Two buffers with equal keys that were produced by the same memory
/// manager also have equal pitch, because the pitch is a pure function of
/// the row size and the manager's alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ShapeKey {
    pub extent: Extent,
    pub dtype: DType,
    pub space: MemorySpace,
    pub pitched: bool,
}

impl std::fmt::Display for ShapeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}{}",
            self.space,
            self.dtype,
            self.extent,
            if self.pitched { " (pitched)" } else { "" }
        )
    }
}

fn row_bytes_for(extent: Extent, dtype: DType) -> Result<usize, ShapeError> {
    extent
        .width()
        .checked_mul(dtype.size_bytes())
        .ok_or_else(|| overflow(extent))
}

fn overflow(extent: Extent) -> ShapeError {
    ShapeError::Overflow {
        width: extent.width(),
        height: extent.height(),
        depth: extent.depth(),
    }
}
