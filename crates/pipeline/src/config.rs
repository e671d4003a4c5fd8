// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Pipeline configuration loaded from TOML files or constructed programmatically.
//!
//! # TOML Format
//! ```toml
//! device_capacity = "512M"
//! host_capacity = "1G"
//! pitch_alignment = 256
//! copy_mode = "async"
//!
//! [[stages]]
//! name = "mask"
//! space = "device"
//! dtype = "f32"
//! width = 1024
//! height = 1024
//! depth = 1
//! count = 4
//! ```

use crate::PipelineError;
use buffer_core::{DType, Extent, MemorySpace};
use memory_manager::{Capacity, CopyMode, DEFAULT_PITCH_ALIGNMENT};
use std::collections::HashSet;
use std::path::Path;

/// Memory configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PipelineConfig {
    /// Device memory ceiling (human-readable, e.g. `"512M"`).
    #[serde(default)]
    pub device_capacity: Capacity,
    /// Host memory ceiling.
    #[serde(default)]
    pub host_capacity: Capacity,
    /// Row alignment in bytes for pitched buffers.
    #[serde(default = "default_pitch_alignment")]
    pub pitch_alignment: usize,
    /// Whether transfers block (`"sync"`) or run on a stream (`"async"`).
    #[serde(default = "default_copy_mode")]
    pub copy_mode: CopyMode,
    /// Buffers preallocated per stage.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// Buffers one pipeline stage works on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub space: MemorySpace,
    pub dtype: DType,
    pub width: usize,
    #[serde(default = "default_one")]
    pub height: usize,
    #[serde(default = "default_one")]
    pub depth: usize,
    /// Number of buffers to preallocate.
    pub count: usize,
}

fn default_pitch_alignment() -> usize {
    DEFAULT_PITCH_ALIGNMENT
}

fn default_copy_mode() -> CopyMode {
    CopyMode::Sync
}

fn default_one() -> usize {
    1
}

impl StageConfig {
    /// Extent of each buffer in this stage.
    pub fn extent(&self) -> Result<Extent, PipelineError> {
        Extent::new(self.width, self.height, self.depth).map_err(|e| {
            PipelineError::ConfigError(format!("stage '{}': {e}", self.name))
        })
    }
}

impl PipelineConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::ConfigError(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, PipelineError> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| PipelineError::ConfigError(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, PipelineError> {
        toml::to_string_pretty(self)
            .map_err(|e| PipelineError::ConfigError(format!("TOML serialise error: {e}")))
    }

    /// Checks alignment, stage names and stage shapes.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.pitch_alignment.is_power_of_two() {
            return Err(PipelineError::ConfigError(format!(
                "pitch_alignment must be a power of two, got {}",
                self.pitch_alignment
            )));
        }
        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::ConfigError(format!(
                    "duplicate stage '{}'",
                    stage.name
                )));
            }
            if stage.count == 0 {
                return Err(PipelineError::ConfigError(format!(
                    "stage '{}' reserves no buffers",
                    stage.name
                )));
            }
            stage.extent()?;
        }
        Ok(())
    }

    /// Looks up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_capacity: Capacity::from_mb(512),
            host_capacity: Capacity::from_gb(1),
            pitch_alignment: DEFAULT_PITCH_ALIGNMENT,
            copy_mode: CopyMode::Sync,
            stages: Vec::new(),
        }
    }
}
