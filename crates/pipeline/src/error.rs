// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for pipeline setup and stage memory.

/// Errors that can occur while configuring or running a pipeline context.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A pool or manager operation failed.
    #[error("memory error: {0}")]
    Memory(#[from] memory_manager::MemoryError),

    /// A stage name that was never registered.
    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    /// A stage was requested with the wrong element type or memory space.
    #[error("stage '{stage}' holds {expected} buffers, requested {requested}")]
    StageMismatch {
        stage: String,
        expected: String,
        requested: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),
}
