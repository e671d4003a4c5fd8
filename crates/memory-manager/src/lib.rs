// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # memory-manager
//!
//! Pooled, ownership-safe buffers in host and device memory for
//! image-processing pipelines.
//!
//! # Key Components
//!
//! - [`MemoryResource`] — a capacity-bounded allocation source for one
//!   memory space. [`HeapResource`] backs host memory and an emulated
//!   device.
//! - [`CopyPolicy`] — how transfers run and how buffers are freed:
//!   [`SyncCopy`] blocks, [`AsyncCopy`] queues on a [`Stream`].
//! - [`BufferPtr`] ([`HostPtr`], [`DevicePtr`]) — the move-only owner of
//!   one typed buffer, linear or pitched.
//! - [`MemoryManager`] — allocates owning pointers for a space:
//!   [`DeviceMemoryManager`], [`HostMemoryManager`] and the linear
//!   host-only [`DefaultMemoryManager`].
//! - [`MemoryPool`] — recycles buffers by shape and hands them out as
//!   [`Image`]s, tracking [`PoolStats`].
//!
//! # Ownership Model
//!
//! ```text
//! MemoryPool::acquire::<T>(w, h, d)
//!       │
//!       ▼
//!   Image<T, M>  ◄─── owns BufferPtr<T, M::Space>, holds SlotHandle
//!       │
//!       │  drop()
//!       ▼
//!   PoolShared::restore(slot)  ──► free list (MRU per ShapeKey)
//!
//!   BufferPtr ──► RawBuffer ──► Arc<Block> ──► MemoryResource
//!                     │
//!                     └─ drop() ──► CopyPolicy::release(block)
//! ```
//!
//! Blocks are reference counted so a queued transfer keeps both of its
//! endpoints alive. Every block records the events of transfers touching
//! it; later transfers and host access wait for them.
//!
//! # Example
//! ```
//! use memory_manager::{
//!     Capacity, DeviceMemoryManager, HostMemoryManager, MemoryManager, MemoryPool,
//! };
//!
//! let host = HostMemoryManager::new(Capacity::from_mb(16));
//! let device = MemoryPool::new(DeviceMemoryManager::new(Capacity::from_mb(16)));
//!
//! let mut input = host.make_ptr_2d::<f32>(100, 50).unwrap();
//! input.fill(1.5);
//!
//! let mut on_device = device.acquire::<f32>(100, 50, 1).unwrap();
//! on_device.copy_from(&input).unwrap().wait().unwrap();
//!
//! let mut output = host.make_ptr_2d::<f32>(100, 50).unwrap();
//! on_device.copy_to(&mut output).unwrap().wait().unwrap();
//! assert!(output.to_vec().iter().all(|&v| v == 1.5));
//! ```

mod block;
mod capacity;
mod copy;
mod error;
mod image;
mod manager;
pub mod pool;
mod ptr;
mod resource;
mod stats;
mod stream;

pub use block::Block;
pub use capacity::Capacity;
pub use copy::{AsyncCopy, CopyJob, CopyMode, CopyPolicy, SyncCopy};
pub use error::MemoryError;
pub use image::Image;
pub use manager::{
    DefaultMemoryManager, DeviceMemoryManager, HostMemoryManager, MemoryManager,
    DEFAULT_PITCH_ALIGNMENT,
};
pub use pool::{MemoryPool, SlotHandle};
pub use ptr::{BufferPtr, Device, DevicePtr, Host, HostPtr, RawBuffer, Space};
pub use resource::{HeapResource, MemoryResource, ResourceCounters, ResourceUsage};
pub use stats::PoolStats;
pub use stream::{Event, Stream};
