// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Memory managers: primitive allocators for one memory space.
//!
//! A manager allocates a fresh buffer for every request and knows nothing
//! about reuse; that is the pool's job. All three managers share one call
//! contract, which is what lets [`crate::MemoryPool`] be generic over them:
//!
//! | manager                  | space  | 2D/3D layout | default policy |
//! |--------------------------|--------|--------------|----------------|
//! | [`DeviceMemoryManager`]  | device | pitched      | sync           |
//! | [`HostMemoryManager`]    | host   | pitched      | sync           |
//! | [`DefaultMemoryManager`] | host   | linear       | sync           |
//!
//! Single-row requests (`height == depth == 1`) always get a linear layout.

use crate::block::Block;
use crate::copy::{CopyPolicy, SyncCopy};
use crate::ptr::{BufferPtr, Device, Host, RawBuffer, Space};
use crate::resource::ResourceUsage;
use crate::{Capacity, HeapResource, MemoryError, MemoryResource};
use buffer_core::{BufferLayout, DType, Element, Extent, MemorySpace, ShapeError};
use std::sync::Arc;

/// Pitch alignment used unless configured otherwise, in bytes.
pub const DEFAULT_PITCH_ALIGNMENT: usize = 256;

/// Minimum base alignment of every allocation.
const MIN_BASE_ALIGNMENT: usize = 64;

/// A primitive allocator for one memory space.
pub trait MemoryManager: Send + Sync + 'static {
    /// The space this manager allocates in.
    type Space: Space;

    /// The resource backing this manager.
    fn resource(&self) -> &Arc<dyn MemoryResource>;

    /// The policy bound to every pointer this manager creates.
    fn policy(&self) -> &Arc<dyn CopyPolicy>;

    /// Alignment unit of 2D/3D pitches, or `None` for linear layouts.
    fn pitch_alignment(&self) -> Option<usize>;

    /// The layout this manager produces for `extent` elements of `dtype`.
    fn layout_for(&self, extent: Extent, dtype: DType) -> Result<BufferLayout, ShapeError> {
        match self.pitch_alignment() {
            Some(alignment) if extent.rank() > 1 => {
                BufferLayout::pitched(extent, dtype, alignment)
            }
            _ => BufferLayout::linear(extent, dtype),
        }
    }

    /// Allocates an untyped buffer with exactly `layout`.
    fn allocate_raw(&self, layout: BufferLayout) -> Result<RawBuffer, MemoryError> {
        let align = self
            .pitch_alignment()
            .unwrap_or(MIN_BASE_ALIGNMENT)
            .max(MIN_BASE_ALIGNMENT);
        let block = Block::allocate(self.resource(), layout.size_bytes(), align)?;
        tracing::debug!(
            "{} allocated {} {} buffer, pitch {} ({} bytes)",
            Self::Space::SPACE,
            layout.dtype(),
            layout.extent(),
            layout.pitch(),
            layout.size_bytes()
        );
        Ok(RawBuffer::new(block, layout, Arc::clone(self.policy())))
    }

    /// Allocates a buffer of `T` covering `extent`.
    fn allocate<T: Element>(&self, extent: Extent) -> Result<BufferPtr<T, Self::Space>, MemoryError> {
        let layout = self.layout_for(extent, T::DTYPE)?;
        BufferPtr::from_raw(self.allocate_raw(layout)?)
    }

    /// A contiguous buffer of `len` elements.
    fn make_ptr<T: Element>(&self, len: usize) -> Result<BufferPtr<T, Self::Space>, MemoryError> {
        self.allocate(Extent::linear(len)?)
    }

    /// A `width × height` buffer.
    fn make_ptr_2d<T: Element>(
        &self,
        width: usize,
        height: usize,
    ) -> Result<BufferPtr<T, Self::Space>, MemoryError> {
        self.allocate(Extent::plane(width, height)?)
    }

    /// A `width × height × depth` buffer; slices are contiguous in depth.
    fn make_ptr_3d<T: Element>(
        &self,
        width: usize,
        height: usize,
        depth: usize,
    ) -> Result<BufferPtr<T, Self::Space>, MemoryError> {
        self.allocate(Extent::volume(width, height, depth)?)
    }

    /// Allocation counters of the backing resource.
    fn usage(&self) -> ResourceUsage {
        self.resource().usage()
    }

    /// Number of successful allocations so far.
    fn allocation_count(&self) -> u64 {
        self.usage().allocations
    }
}

/// Fields shared by all managers.
#[derive(Debug, Clone)]
struct ManagerCore {
    resource: Arc<dyn MemoryResource>,
    policy: Arc<dyn CopyPolicy>,
    pitch_alignment: Option<usize>,
}

impl ManagerCore {
    fn new(
        space: MemorySpace,
        resource: Arc<dyn MemoryResource>,
        policy: Arc<dyn CopyPolicy>,
        pitch_alignment: Option<usize>,
    ) -> Result<Self, MemoryError> {
        if resource.space() != space {
            return Err(MemoryError::ShapeMismatch {
                expected: format!("{space} resource"),
                actual: format!("{} resource", resource.space()),
            });
        }
        if let Some(alignment) = pitch_alignment {
            if !alignment.is_power_of_two() {
                return Err(ShapeError::InvalidAlignment(alignment).into());
            }
        }
        Ok(Self {
            resource,
            policy,
            pitch_alignment,
        })
    }

    fn heap(space: MemorySpace, capacity: Capacity, pitch_alignment: Option<usize>) -> Self {
        let resource: Arc<dyn MemoryResource> = Arc::new(match space {
            MemorySpace::Host => HeapResource::host(capacity),
            MemorySpace::Device => HeapResource::emulated_device(capacity),
        });
        Self {
            resource,
            policy: Arc::new(SyncCopy),
            pitch_alignment,
        }
    }
}

macro_rules! impl_manager {
    ($ty:ident, $space:ty) => {
        impl $ty {
            /// Replaces the copy policy bound to new pointers.
            pub fn with_policy(mut self, policy: Arc<dyn CopyPolicy>) -> Self {
                self.core.policy = policy;
                self
            }
        }

        impl MemoryManager for $ty {
            type Space = $space;

            fn resource(&self) -> &Arc<dyn MemoryResource> {
                &self.core.resource
            }

            fn policy(&self) -> &Arc<dyn CopyPolicy> {
                &self.core.policy
            }

            fn pitch_alignment(&self) -> Option<usize> {
                self.core.pitch_alignment
            }
        }
    };
}

/// Allocates pitched buffers in accelerator memory.
///
/// # Example
/// ```
/// use memory_manager::{Capacity, DeviceMemoryManager, MemoryManager};
///
/// let manager = DeviceMemoryManager::new(Capacity::from_mb(16));
/// let image = manager.make_ptr_2d::<u16>(1000, 100).unwrap();
/// assert_eq!(image.pitch(), 2048);
/// assert_eq!(manager.allocation_count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct DeviceMemoryManager {
    core: ManagerCore,
}

impl DeviceMemoryManager {
    /// An emulated device with `capacity` bytes and the default pitch
    /// alignment.
    pub fn new(capacity: Capacity) -> Self {
        Self {
            core: ManagerCore::heap(
                MemorySpace::Device,
                capacity,
                Some(DEFAULT_PITCH_ALIGNMENT),
            ),
        }
    }

    /// A manager over an arbitrary device resource.
    pub fn with_resource(
        resource: Arc<dyn MemoryResource>,
        policy: Arc<dyn CopyPolicy>,
        pitch_alignment: usize,
    ) -> Result<Self, MemoryError> {
        Ok(Self {
            core: ManagerCore::new(MemorySpace::Device, resource, policy, Some(pitch_alignment))?,
        })
    }

    /// Changes the pitch alignment of future allocations.
    pub fn with_pitch_alignment(mut self, alignment: usize) -> Result<Self, MemoryError> {
        if !alignment.is_power_of_two() {
            return Err(ShapeError::InvalidAlignment(alignment).into());
        }
        self.core.pitch_alignment = Some(alignment);
        Ok(self)
    }
}

impl_manager!(DeviceMemoryManager, Device);

/// Allocates pitched buffers in host memory, laid out exactly like their
/// device counterparts so host↔device copies need no repacking.
#[derive(Debug, Clone)]
pub struct HostMemoryManager {
    core: ManagerCore,
}

impl HostMemoryManager {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            core: ManagerCore::heap(MemorySpace::Host, capacity, Some(DEFAULT_PITCH_ALIGNMENT)),
        }
    }

    pub fn with_resource(
        resource: Arc<dyn MemoryResource>,
        policy: Arc<dyn CopyPolicy>,
        pitch_alignment: usize,
    ) -> Result<Self, MemoryError> {
        Ok(Self {
            core: ManagerCore::new(MemorySpace::Host, resource, policy, Some(pitch_alignment))?,
        })
    }

    pub fn with_pitch_alignment(mut self, alignment: usize) -> Result<Self, MemoryError> {
        if !alignment.is_power_of_two() {
            return Err(ShapeError::InvalidAlignment(alignment).into());
        }
        self.core.pitch_alignment = Some(alignment);
        Ok(self)
    }
}

impl_manager!(HostMemoryManager, Host);

/// Host-only fallback for builds without an accelerator: densely packed
/// buffers with synchronous copies.
#[derive(Debug, Clone)]
pub struct DefaultMemoryManager {
    core: ManagerCore,
}

impl DefaultMemoryManager {
    pub fn new() -> Self {
        Self::with_capacity(Capacity::unlimited())
    }

    pub fn with_capacity(capacity: Capacity) -> Self {
        Self {
            core: ManagerCore::heap(MemorySpace::Host, capacity, None),
        }
    }
}

impl Default for DefaultMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl_manager!(DefaultMemoryManager, Host);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::{AsyncCopy, CopyMode};

    #[test]
    fn test_device_2d_is_pitched() {
        let m = DeviceMemoryManager::new(Capacity::from_mb(4));
        let p = m.make_ptr_2d::<f32>(100, 10).unwrap();
        assert!(p.is_pitched());
        assert_eq!(p.pitch(), 512);
        assert_eq!((p.width(), p.height(), p.depth()), (100, 10, 1));
        assert_eq!(m.usage().live_bytes, 512 * 10);
    }

    #[test]
    fn test_3d_slices_contiguous() {
        let m = HostMemoryManager::new(Capacity::unlimited());
        let p = m.make_ptr_3d::<u8>(10, 4, 3).unwrap();
        assert_eq!(p.pitch(), 256);
        assert_eq!(p.size_bytes(), 256 * 4 * 3);
        assert_eq!(p.layout().row_offset(0, 1), 256 * 4);
    }

    #[test]
    fn test_1d_is_linear() {
        let m = DeviceMemoryManager::new(Capacity::unlimited());
        let p = m.make_ptr::<u16>(1000).unwrap();
        assert!(!p.is_pitched());
        assert_eq!(p.pitch(), 2000);
    }

    #[test]
    fn test_default_manager_is_linear() {
        let m = DefaultMemoryManager::new();
        let p = m.make_ptr_3d::<f64>(3, 3, 3).unwrap();
        assert!(!p.is_pitched());
        assert_eq!(p.pitch(), 24);
        assert_eq!(p.size_bytes(), 24 * 9);
        assert_eq!(p.copy_mode(), CopyMode::Sync);
    }

    #[test]
    fn test_invalid_shape() {
        let m = DefaultMemoryManager::new();
        assert!(matches!(
            m.make_ptr_2d::<u8>(0, 4),
            Err(MemoryError::InvalidShape(_))
        ));
        assert!(matches!(
            m.make_ptr::<u8>(0),
            Err(MemoryError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_allocation_failure() {
        let m = DeviceMemoryManager::new(Capacity::from_bytes(4096));
        let _a = m.make_ptr::<u8>(4096).unwrap();
        assert!(matches!(
            m.make_ptr::<u8>(1),
            Err(MemoryError::AllocationFailure { .. })
        ));
        assert_eq!(m.allocation_count(), 1);
    }

    #[test]
    fn test_drop_frees() {
        let m = HostMemoryManager::new(Capacity::unlimited());
        let p = m.make_ptr_2d::<i32>(64, 64).unwrap();
        assert!(m.usage().live_bytes > 0);
        drop(p);
        let u = m.usage();
        assert_eq!(u.live_bytes, 0);
        assert_eq!(u.deallocations, 1);
    }

    #[test]
    fn test_pitch_alignment_override() {
        let m = DeviceMemoryManager::new(Capacity::unlimited())
            .with_pitch_alignment(1024)
            .unwrap();
        let p = m.make_ptr_2d::<u8>(10, 2).unwrap();
        assert_eq!(p.pitch(), 1024);
        assert!(DeviceMemoryManager::new(Capacity::unlimited())
            .with_pitch_alignment(1000)
            .is_err());
    }

    #[test]
    fn test_resource_space_checked() {
        let host: Arc<dyn MemoryResource> = Arc::new(HeapResource::host(Capacity::unlimited()));
        assert!(DeviceMemoryManager::with_resource(host, Arc::new(SyncCopy), 256).is_err());
    }

    #[test]
    fn test_async_policy_bound_to_pointers() {
        let policy = Arc::new(AsyncCopy::with_new_stream("mgr").unwrap());
        let m = DeviceMemoryManager::new(Capacity::unlimited()).with_policy(policy.clone());
        let p = m.make_ptr::<f32>(16).unwrap();
        assert_eq!(p.copy_mode(), CopyMode::Async);
        drop(p);
        policy.stream().synchronize().unwrap();
        assert_eq!(m.usage().live_bytes, 0);
    }
}
