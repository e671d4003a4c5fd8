// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for shape and layout construction.

/// Errors produced while describing a buffer's shape or layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    /// One of the dimensions is zero.
    #[error("invalid shape {width}x{height}x{depth}: every dimension must be at least 1")]
    ZeroDimension {
        width: usize,
        height: usize,
        depth: usize,
    },

    /// The byte size of the layout does not fit in `usize`.
    #[error("shape {width}x{height}x{depth} overflows the addressable size")]
    Overflow {
        width: usize,
        height: usize,
        depth: usize,
    },

    /// The pitch alignment is not a power of two.
    #[error("pitch alignment {0} is not a power of two")]
    InvalidAlignment(usize),
}
