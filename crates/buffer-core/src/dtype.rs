// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Supported pixel element types.

/// Enumerates the numeric types a buffer can hold.
///
/// The element type is part of a buffer's [`crate::ShapeKey`]: two buffers
/// with identical extents but different element types are never
/// interchangeable in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Unsigned 8-bit integer (8-bit detector frames, masks).
    U8,
    /// Unsigned 16-bit integer (raw detector counts).
    U16,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 32-bit integer.
    I32,
    /// 32-bit IEEE 754 floating point.
    F32,
    /// 64-bit IEEE 754 floating point.
    F64,
}

impl DType {
    /// Returns the size of a single element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    /// Returns a human-readable label for this data type.
    pub fn as_str(self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::I16 => "i16",
            DType::U32 => "u32",
            DType::I32 => "i32",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A plain numeric type that can live in a host or device buffer.
///
/// The trait is sealed: every implementor is a primitive for which the
/// all-zero bit pattern is a valid value and whose size is a power of two,
/// which the buffer layer relies on when it hands out typed views of
/// freshly zeroed allocations.
pub trait Element: sealed::Sealed + Copy + Default + PartialEq + Send + Sync + 'static {
    /// The runtime tag for this element type.
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Element for $ty {
                const DTYPE: DType = DType::$tag;
            }
        )*
    };
}

impl_element! {
    u8 => U8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    f32 => F32,
    f64 => F64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_matches_rust_type() {
        assert_eq!(<u8 as Element>::DTYPE.size_bytes(), std::mem::size_of::<u8>());
        assert_eq!(<u16 as Element>::DTYPE.size_bytes(), std::mem::size_of::<u16>());
        assert_eq!(<i16 as Element>::DTYPE.size_bytes(), std::mem::size_of::<i16>());
        assert_eq!(<u32 as Element>::DTYPE.size_bytes(), std::mem::size_of::<u32>());
        assert_eq!(<i32 as Element>::DTYPE.size_bytes(), std::mem::size_of::<i32>());
        assert_eq!(<f32 as Element>::DTYPE.size_bytes(), std::mem::size_of::<f32>());
        assert_eq!(<f64 as Element>::DTYPE.size_bytes(), std::mem::size_of::<f64>());
    }

    #[test]
    fn test_sizes_are_powers_of_two() {
        for dtype in [
            DType::U8,
            DType::U16,
            DType::I16,
            DType::U32,
            DType::I32,
            DType::F32,
            DType::F64,
        ] {
            assert!(dtype.size_bytes().is_power_of_two(), "{dtype}");
        }
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&DType::F32).unwrap();
        assert_eq!(json, "\"f32\"");
        let back: DType = serde_json::from_str("\"u16\"").unwrap();
        assert_eq!(back, DType::U16);
    }
}
