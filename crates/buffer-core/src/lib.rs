// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # buffer-core
//!
//! Shape and element descriptors shared by every buffer in the image
//! pipeline, independent of where the bytes live.
//!
//! This crate provides:
//! - [`DType`] and the sealed [`Element`] trait — the numeric pixel types a
//!   buffer can hold (u8, u16, i16, u32, i32, f32, f64).
//! - [`MemorySpace`] — host RAM or accelerator memory.
//! - [`Extent`] — validated width × height × depth (unused dimensions are 1).
//! - [`BufferLayout`] — linear or pitched (row-padded) byte layout.
//! - [`ShapeKey`] — the compatibility key used to recycle pooled buffers.
//!
//! # Example
//! ```
//! use buffer_core::{BufferLayout, DType, Extent};
//!
//! let extent = Extent::plane(100, 8).unwrap();
//! let layout = BufferLayout::pitched(extent, DType::F32, 256).unwrap();
//! assert_eq!(layout.row_bytes(), 400);
//! assert_eq!(layout.pitch(), 512);
//! assert_eq!(layout.size_bytes(), 512 * 8);
//! ```

mod dtype;
mod error;
mod extent;
mod layout;
mod space;

pub use dtype::{DType, Element};
pub use error::ShapeError;
pub use extent::Extent;
pub use layout::{BufferLayout, ShapeKey};
pub use space::MemorySpace;
