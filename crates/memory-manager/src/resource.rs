// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Memory resources: the single point of contact with an allocation API.
//!
//! Everything above this module (pointers, managers, pools) obtains bytes
//! exclusively through a [`MemoryResource`]. Porting the crate to a real
//! accelerator backend means implementing this trait over the vendor's
//! allocation calls.
//!
//! [`HeapResource`] is the in-process implementation. For the device space
//! it acts as an emulated accelerator: its bytes are tracked against their
//! own capacity and are never handed out as host slices, so device data
//! can only be reached through copies.

use crate::{Capacity, MemoryError};
use buffer_core::MemorySpace;
use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// An allocator for one memory space.
pub trait MemoryResource: Send + Sync + fmt::Debug {
    /// The memory space this resource allocates from.
    fn space(&self) -> MemorySpace;

    /// The configured capacity.
    fn capacity(&self) -> Capacity;

    /// Live accounting for this resource.
    fn counters(&self) -> &ResourceCounters;

    /// Allocates `size` zero-initialised bytes aligned to `align`.
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError>;

    /// Returns an allocation to the resource.
    ///
    /// # Safety
    /// `ptr` must come from [`MemoryResource::allocate`] on this resource
    /// with the same `size` and `align`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize);

    /// A snapshot of the counters.
    fn usage(&self) -> ResourceUsage {
        self.counters().snapshot()
    }
}

/// Lock-free allocation accounting shared by all users of a resource.
#[derive(Debug, Default)]
pub struct ResourceCounters {
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    failed_allocations: AtomicU64,
}

impl ResourceCounters {
    /// Reserves `size` bytes against `capacity`.
    ///
    /// Returns the number of bytes that were available on failure.
    pub fn try_reserve(&self, size: usize, capacity: Capacity) -> Result<(), usize> {
        let mut live = self.live_bytes.load(Ordering::Acquire);
        loop {
            if !capacity.admits(live, size) {
                self.failed_allocations.fetch_add(1, Ordering::Relaxed);
                return Err(capacity.available(live));
            }
            match self.live_bytes.compare_exchange_weak(
                live,
                live + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => live = actual,
            }
        }
        self.peak_bytes.fetch_max(live + size, Ordering::AcqRel);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Undoes a reservation whose allocation never happened.
    pub fn cancel(&self, size: usize) {
        self.live_bytes.fetch_sub(size, Ordering::AcqRel);
        self.allocations.fetch_sub(1, Ordering::Relaxed);
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed deallocation.
    pub fn release(&self, size: usize) {
        self.live_bytes.fetch_sub(size, Ordering::AcqRel);
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ResourceUsage {
        ResourceUsage {
            live_bytes: self.live_bytes.load(Ordering::Acquire),
            peak_bytes: self.peak_bytes.load(Ordering::Acquire),
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time allocation figures for a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResourceUsage {
    /// Bytes currently allocated.
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
    /// Successful allocations since creation.
    pub allocations: u64,
    /// Deallocations since creation.
    pub deallocations: u64,
    /// Requests rejected for lack of capacity or by the system allocator.
    pub failed_allocations: u64,
}

impl ResourceUsage {
    /// Allocations not yet returned.
    pub fn live_allocations(&self) -> u64 {
        self.allocations - self.deallocations
    }
}

/// A capacity-bounded resource backed by the process heap.
pub struct HeapResource {
    space: MemorySpace,
    capacity: Capacity,
    counters: ResourceCounters,
}

impl HeapResource {
    /// Pageable host memory.
    pub fn host(capacity: Capacity) -> Self {
        Self::new(MemorySpace::Host, capacity)
    }

    /// An emulated accelerator memory region.
    pub fn emulated_device(capacity: Capacity) -> Self {
        Self::new(MemorySpace::Device, capacity)
    }

    fn new(space: MemorySpace, capacity: Capacity) -> Self {
        tracing::debug!("{space} heap resource created (capacity {capacity})");
        Self {
            space,
            capacity,
            counters: ResourceCounters::default(),
        }
    }

    fn failure(&self, size: usize, available: usize) -> MemoryError {
        MemoryError::AllocationFailure {
            space: self.space,
            requested_bytes: size,
            available_bytes: available,
            capacity: self.capacity,
        }
    }
}

impl MemoryResource for HeapResource {
    fn space(&self) -> MemorySpace {
        self.space
    }

    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn counters(&self) -> &ResourceCounters {
        &self.counters
    }

    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|_| self.failure(size, self.capacity.available(self.counters.live_bytes())))?;

        self.counters
            .try_reserve(size, self.capacity)
            .map_err(|available| {
                tracing::debug!(
                    "{} allocation of {size} bytes rejected: {available} bytes available",
                    self.space
                );
                self.failure(size, available)
            })?;

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => {
                tracing::trace!("{} allocated {size} bytes at {ptr:?}", self.space);
                Ok(ptr)
            }
            None => {
                self.counters.cancel(size);
                tracing::error!("system allocator returned null for {size} bytes");
                Err(self.failure(size, 0))
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        // SAFETY: the caller guarantees `ptr` was produced by `allocate`
        // with this size and alignment, which already validated the layout.
        let layout = Layout::from_size_align_unchecked(size.max(1), align);
        std::alloc::dealloc(ptr.as_ptr(), layout);
        self.counters.release(size);
        tracing::trace!("{} freed {size} bytes at {ptr:?}", self.space);
    }
}

impl fmt::Debug for HeapResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapResource")
            .field("space", &self.space)
            .field("capacity", &self.capacity)
            .field("live_bytes", &self.counters.live_bytes())
            .finish()
    }
}
