// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for buffer allocation, transfer and pooling.

use crate::Capacity;
use buffer_core::{MemorySpace, ShapeError, ShapeKey};
use std::time::Duration;

/// Errors that can occur while allocating, copying or pooling buffers.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// A requested dimension is zero or the layout overflows.
    #[error("invalid shape: {0}")]
    InvalidShape(#[from] ShapeError),

    /// The memory space cannot satisfy the request.
    #[error("allocation failure in {space} memory: requested {requested_bytes} bytes, but only {available_bytes} available (capacity: {capacity})")]
    AllocationFailure {
        space: MemorySpace,
        requested_bytes: usize,
        available_bytes: usize,
        capacity: Capacity,
    },

    /// Source and destination of a copy (or a returned buffer and its
    /// slot) do not describe the same data.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// A lower-level copy or stream operation failed.
    #[error("transfer failure: {0}")]
    TransferFailure(String),

    /// A slot that is already free was released again.
    #[error("double release of pool slot {slot}")]
    DoubleRelease { slot: usize },

    /// A slot handle no longer refers to the entry it was issued for.
    #[error("use after release: slot {slot} (generation {generation}) is no longer valid")]
    UseAfterRelease { slot: usize, generation: u64 },

    /// The pool that issued a buffer no longer exists.
    #[error("memory pool has been torn down")]
    PoolTornDown,

    /// An image was released through a pool that did not issue it.
    #[error("image was issued by a different pool")]
    ForeignImage,

    /// The pool was torn down while buffers were still checked out.
    #[error("memory pool torn down with {in_use} entries still in use")]
    OutstandingEntries { in_use: usize },

    /// A blocking acquire was issued for a shape the pool holds no entries for.
    #[error("no pool entries reserved for {0}")]
    NotReserved(ShapeKey),

    /// A blocking acquire gave up waiting.
    #[error("timed out after {waited:?} waiting for a free {key} buffer")]
    Timeout { waited: Duration, key: ShapeKey },

    /// A capacity string could not be parsed.
    #[error("invalid capacity: {0}")]
    InvalidCapacity(String),
}
