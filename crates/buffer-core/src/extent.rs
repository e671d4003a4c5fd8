// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Logical buffer dimensions.

use crate::ShapeError;
use std::fmt;

/// The logical dimensions of a 1D, 2D or 3D buffer, in elements.
///
/// Unused dimensions are 1, so a 1D buffer of 64 elements is `64x1x1`.
/// Every dimension is at least 1; zero-sized buffers cannot be described.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "RawExtent")]
pub struct Extent {
    width: usize,
    height: usize,
    depth: usize,
}

/// Unvalidated wire form of [`Extent`].
#[derive(serde::Deserialize)]
struct RawExtent {
    width: usize,
    height: usize,
    depth: usize,
}

impl TryFrom<RawExtent> for Extent {
    type Error = ShapeError;

    fn try_from(raw: RawExtent) -> Result<Self, Self::Error> {
        Self::new(raw.width, raw.height, raw.depth)
    }
}

impl Extent {
    /// Creates a validated extent.
    ///
    /// # Examples
    /// ```
    /// use buffer_core::Extent;
    /// let e = Extent::new(640, 480, 3).unwrap();
    /// assert_eq!(e.rank(), 3);
    /// assert_eq!(e.num_elements(), 640 * 480 * 3);
    /// assert!(Extent::new(640, 0, 1).is_err());
    /// ```
    pub fn new(width: usize, height: usize, depth: usize) -> Result<Self, ShapeError> {
        if width == 0 || height == 0 || depth == 0 {
            return Err(ShapeError::ZeroDimension {
                width,
                height,
                depth,
            });
        }
        width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(depth))
            .ok_or(ShapeError::Overflow {
                width,
                height,
                depth,
            })?;
        Ok(Self {
            width,
            height,
            depth,
        })
    }

    /// Creates a 1D extent of `len` elements.
    pub fn linear(len: usize) -> Result<Self, ShapeError> {
        Self::new(len, 1, 1)
    }

    /// Creates a 2D extent.
    pub fn plane(width: usize, height: usize) -> Result<Self, ShapeError> {
        Self::new(width, height, 1)
    }

    /// Creates a 3D extent.
    pub fn volume(width: usize, height: usize, depth: usize) -> Result<Self, ShapeError> {
        Self::new(width, height, depth)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of rows across all slices (`height * depth`).
    pub fn rows(&self) -> usize {
        self.height * self.depth
    }

    /// Total number of logical elements.
    pub fn num_elements(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Returns 1, 2 or 3 depending on the highest dimension above 1.
    pub fn rank(&self) -> usize {
        if self.depth > 1 {
            3
        } else if self.height > 1 {
            2
        } else {
            1
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let l = Extent::linear(64).unwrap();
        assert_eq!((l.width(), l.height(), l.depth()), (64, 1, 1));
        assert_eq!(l.rank(), 1);

        let p = Extent::plane(32, 16).unwrap();
        assert_eq!(p.rank(), 2);
        assert_eq!(p.rows(), 16);

        let v = Extent::volume(8, 4, 2).unwrap();
        assert_eq!(v.rank(), 3);
        assert_eq!(v.rows(), 8);
        assert_eq!(v.num_elements(), 64);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        for (w, h, d) in [(0, 1, 1), (1, 0, 1), (1, 1, 0)] {
            assert_eq!(
                Extent::new(w, h, d),
                Err(ShapeError::ZeroDimension {
                    width: w,
                    height: h,
                    depth: d
                })
            );
        }
    }

    #[test]
    fn test_overflow_rejected() {
        let err = Extent::new(usize::MAX, 2, 1).unwrap_err();
        assert!(matches!(err, ShapeError::Overflow { .. }));
    }

    #[test]
    fn test_deserialize_validates() {
        let e: Extent = serde_json::from_str(r#"{"width":4,"height":3,"depth":2}"#).unwrap();
        assert_eq!(e, Extent::new(4, 3, 2).unwrap());

        let zero = serde_json::from_str::<Extent>(r#"{"width":0,"height":4,"depth":1}"#);
        assert!(zero.unwrap_err().to_string().contains("at least 1"));

        let huge = format!(r#"{{"width":1,"height":{},"depth":2}}"#, usize::MAX);
        assert!(serde_json::from_str::<Extent>(&huge).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Extent::plane(640, 480).unwrap().to_string(), "640x480x1");
    }
}
