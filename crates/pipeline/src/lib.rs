// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # pipeline
//!
//! Memory setup for multi-stage image-processing pipelines.
//!
//! A [`PipelineContext`] takes a [`PipelineConfig`] and owns:
//! - A device `MemoryPool` and a host `MemoryPool` from `memory-manager`.
//! - The transfer stream, when copies are asynchronous.
//! - The table of registered stages and the buffers reserved for them.
//!
//! Stages request buffers by name and give them back by dropping the
//! returned images. When every stage is done, [`PipelineContext::teardown`]
//! frees all memory and reports images that were never returned.
//!
//! # Example
//! ```
//! use pipeline::{PipelineConfig, PipelineContext};
//!
//! let config = PipelineConfig::from_toml(r#"
//! device_capacity = "64M"
//! copy_mode = "sync"
//!
//! [[stages]]
//! name = "filter"
//! space = "device"
//! dtype = "f32"
//! width = 256
//! height = 256
//! count = 2
//! "#).unwrap();
//!
//! let ctx = PipelineContext::new(config).unwrap();
//! ctx.register_all().unwrap();
//!
//! let image = ctx.acquire_device::<f32>("filter", None).unwrap();
//! assert_eq!(image.pitch(), 1024);
//! drop(image);
//!
//! ctx.teardown().unwrap();
//! ```

mod config;
mod context;
mod error;

pub use config::{PipelineConfig, StageConfig};
pub use context::PipelineContext;
pub use error::PipelineError;
