// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The memory context shared by the stages of one pipeline.
//!
//! ```text
//! PipelineConfig
//!     │  PipelineContext::new()
//!     ▼
//! PipelineContext ── device: MemoryPool<DeviceMemoryManager>
//!     │            └─ host:   MemoryPool<HostMemoryManager>
//!     │  .register_stage() / .register_all()   reserve buffers per stage
//!     ▼
//! stages call .acquire_device() / .acquire_host() and drop images
//!     │  .teardown()
//!     ▼
//!   pools destroyed, outstanding images reported
//! ```
//!
//! The context is built once and handed to every stage by reference
//! (typically behind an `Arc`); there is no process-wide pool.

use crate::{PipelineConfig, PipelineError, StageConfig};
use buffer_core::{DType, Element, Extent, MemorySpace};
use memory_manager::{
    AsyncCopy, CopyMode, CopyPolicy, DeviceMemoryManager, HostMemoryManager, Image,
    MemoryError, MemoryPool, PoolStats, SlotHandle, Stream, SyncCopy,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Runs `$body` with `$t` bound to the element type of `$dtype`.
macro_rules! with_element {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            DType::U8 => {
                type $t = u8;
                $body
            }
            DType::U16 => {
                type $t = u16;
                $body
            }
            DType::I16 => {
                type $t = i16;
                $body
            }
            DType::U32 => {
                type $t = u32;
                $body
            }
            DType::I32 => {
                type $t = i32;
                $body
            }
            DType::F32 => {
                type $t = f32;
                $body
            }
            DType::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

/// A registered stage and the extent of its buffers.
#[derive(Debug, Clone)]
struct Stage {
    config: StageConfig,
    extent: Extent,
}

/// Device and host pools plus the stage table of one pipeline.
pub struct PipelineContext {
    device: MemoryPool<DeviceMemoryManager>,
    host: MemoryPool<HostMemoryManager>,
    stream: Option<Arc<Stream>>,
    stages: Mutex<HashMap<String, Stage>>,
    config: PipelineConfig,
}

impl PipelineContext {
    /// Builds the managers and pools described by `config`.
    ///
    /// Stages listed in the config are not reserved yet; call
    /// [`PipelineContext::register_all`].
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let stream = match config.copy_mode {
            CopyMode::Sync => None,
            CopyMode::Async => Some(Arc::new(Stream::new("transfer")?)),
        };
        let policy: Arc<dyn CopyPolicy> = match &stream {
            Some(stream) => Arc::new(AsyncCopy::new(Arc::clone(stream))),
            None => Arc::new(SyncCopy),
        };

        let device = DeviceMemoryManager::new(config.device_capacity)
            .with_policy(Arc::clone(&policy))
            .with_pitch_alignment(config.pitch_alignment)?;
        let host = HostMemoryManager::new(config.host_capacity)
            .with_policy(policy)
            .with_pitch_alignment(config.pitch_alignment)?;

        tracing::info!(
            "pipeline context: device {}, host {}, pitch alignment {}, {:?} copies",
            config.device_capacity,
            config.host_capacity,
            config.pitch_alignment,
            config.copy_mode
        );

        Ok(Self {
            device: MemoryPool::new(device),
            host: MemoryPool::new(host),
            stream,
            stages: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn device(&self) -> &MemoryPool<DeviceMemoryManager> {
        &self.device
    }

    pub fn host(&self) -> &MemoryPool<HostMemoryManager> {
        &self.host
    }

    /// The transfer stream, when copies are asynchronous.
    pub fn stream(&self) -> Option<&Arc<Stream>> {
        self.stream.as_ref()
    }

    /// Waits for every queued transfer and deferred free.
    pub fn synchronize(&self) -> Result<(), PipelineError> {
        if let Some(stream) = &self.stream {
            stream.synchronize()?;
        }
        Ok(())
    }

    /// Registers every stage from the configuration.
    pub fn register_all(&self) -> Result<(), PipelineError> {
        for stage in &self.config.stages {
            self.register_stage(stage)?;
        }
        Ok(())
    }

    /// Preallocates `stage.count` buffers for `stage` in its memory space.
    ///
    /// The buffers belong to the stage: other stages and plain pool
    /// acquires never take them, even when their shape matches.
    /// Registering a name again adds buffers if the shape is unchanged and
    /// fails otherwise. Registrations are serialised, so a conflicting
    /// concurrent registration cannot leave buffers behind.
    pub fn register_stage(&self, stage: &StageConfig) -> Result<Vec<SlotHandle>, PipelineError> {
        let extent = stage.extent()?;
        let mut stages = self.stages();
        if let Some(existing) = stages.get(&stage.name) {
            let same = existing.config.space == stage.space
                && existing.config.dtype == stage.dtype
                && existing.extent == extent;
            if !same {
                return Err(PipelineError::ConfigError(format!(
                    "stage '{}' already registered with a different shape",
                    stage.name
                )));
            }
        }

        let name = stage.name.as_str();
        let slots = match stage.space {
            MemorySpace::Device => with_element!(stage.dtype, T => {
                self.device.reserve_group::<T>(name, extent, stage.count)
            })?,
            MemorySpace::Host => with_element!(stage.dtype, T => {
                self.host.reserve_group::<T>(name, extent, stage.count)
            })?,
        };
        tracing::debug!(
            "stage '{}': {} {} {} buffers of {}",
            stage.name,
            stage.count,
            stage.space,
            stage.dtype,
            extent
        );

        stages.insert(
            stage.name.clone(),
            Stage {
                config: stage.clone(),
                extent,
            },
        );
        Ok(slots)
    }

    /// Names of the registered stages, sorted.
    pub fn stage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages().keys().cloned().collect();
        names.sort();
        names
    }

    /// Takes one of `stage`'s device buffers, waiting up to `timeout` for
    /// one to be released.
    pub fn acquire_device<T: Element>(
        &self,
        stage: &str,
        timeout: Option<Duration>,
    ) -> Result<Image<T, DeviceMemoryManager>, PipelineError> {
        let extent = self.lookup::<T>(stage, MemorySpace::Device)?;
        Ok(self.device.acquire_group_wait::<T>(stage, extent, timeout)?)
    }

    /// Takes one of `stage`'s host buffers, waiting up to `timeout`.
    pub fn acquire_host<T: Element>(
        &self,
        stage: &str,
        timeout: Option<Duration>,
    ) -> Result<Image<T, HostMemoryManager>, PipelineError> {
        let extent = self.lookup::<T>(stage, MemorySpace::Host)?;
        Ok(self.host.acquire_group_wait::<T>(stage, extent, timeout)?)
    }

    fn lookup<T: Element>(&self, stage: &str, space: MemorySpace) -> Result<Extent, PipelineError> {
        let stages = self.stages();
        let entry = stages
            .get(stage)
            .ok_or_else(|| PipelineError::UnknownStage(stage.to_string()))?;
        if entry.config.dtype != T::DTYPE || entry.config.space != space {
            return Err(PipelineError::StageMismatch {
                stage: stage.to_string(),
                expected: format!("{} {}", entry.config.space, entry.config.dtype),
                requested: format!("{} {}", space, T::DTYPE),
            });
        }
        Ok(entry.extent)
    }

    /// Destroys the free buffers of `stage` and forgets it. Buffers still
    /// in use are destroyed when released; other stages are untouched.
    pub fn free_stage(&self, stage: &str) -> Result<usize, PipelineError> {
        let mut stages = self.stages();
        let removed = stages
            .remove(stage)
            .ok_or_else(|| PipelineError::UnknownStage(stage.to_string()))?;
        let purged = match removed.config.space {
            MemorySpace::Device => self.device.purge_group(stage),
            MemorySpace::Host => self.host.purge_group(stage),
        };
        drop(stages);
        tracing::info!("stage '{stage}' freed {purged} buffers");
        Ok(purged)
    }

    /// Pool statistics as `(device, host)`.
    pub fn stats(&self) -> (PoolStats, PoolStats) {
        (self.device.stats(), self.host.stats())
    }

    /// Tears down both pools and drains the transfer stream.
    ///
    /// Fails with `OutstandingEntries` (summed over both pools) if images
    /// are still checked out.
    pub fn teardown(self) -> Result<(), PipelineError> {
        let (device_stats, host_stats) = self.stats();
        tracing::info!("device {}", device_stats.summary());
        tracing::info!("host {}", host_stats.summary());

        let mut in_use = 0;
        for result in [self.device.teardown(), self.host.teardown()] {
            match result {
                Ok(()) => {}
                Err(MemoryError::OutstandingEntries { in_use: n }) => in_use += n,
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(stream) = self.stream {
            stream.synchronize()?;
        }
        if in_use > 0 {
            return Err(MemoryError::OutstandingEntries { in_use }.into());
        }
        Ok(())
    }

    fn stages(&self) -> std::sync::MutexGuard<'_, HashMap<String, Stage>> {
        self.stages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("device", &self.device)
            .field("host", &self.host)
            .field("copy_mode", &self.config.copy_mode)
            .field("stages", &self.stage_names())
            .finish()
    }
}
