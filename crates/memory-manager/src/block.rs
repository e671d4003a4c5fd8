// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Reference-counted allocation blocks.
//!
//! A [`Block`] is one allocation obtained from a [`MemoryResource`]. The
//! owning pointer holds it exclusively in the logical sense; the `Arc`
//! exists only so in-flight stream work can keep the bytes alive until it
//! finishes. The memory returns to the resource when the last reference
//! drops.

use crate::stream::Event;
use crate::{MemoryError, MemoryResource};
use buffer_core::MemorySpace;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// One allocation in a memory space.
pub struct Block {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
    resource: Arc<dyn MemoryResource>,
    /// Transfers touching this block that may still be running.
    fences: Mutex<Vec<Event>>,
}

// SAFETY: `Block` owns its allocation. Concurrent access to the bytes is
// ordered by the fences: transfers wait on them before touching the bytes,
// and host views settle them first; exclusive writes additionally require
// `&mut` on the owning pointer.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    pub(crate) fn allocate(
        resource: &Arc<dyn MemoryResource>,
        size: usize,
        align: usize,
    ) -> Result<Arc<Self>, MemoryError> {
        let ptr = resource.allocate(size, align)?;
        Ok(Arc::new(Self {
            ptr,
            size,
            align,
            resource: Arc::clone(resource),
            fences: Mutex::new(Vec::new()),
        }))
    }

    pub fn space(&self) -> MemorySpace {
        self.resource.space()
    }

    pub fn size_bytes(&self) -> usize {
        self.size
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The base address, used as an identity for the allocation.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Transfers on this block that have not finished yet.
    pub(crate) fn pending(&self) -> Vec<Event> {
        match self.fences.lock() {
            Ok(mut fences) => {
                fences.retain(|e| !e.is_done());
                fences.clone()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Registers a transfer that touches this block.
    pub(crate) fn push_fence(&self, event: Event) {
        if event.is_done() {
            return;
        }
        if let Ok(mut fences) = self.fences.lock() {
            fences.retain(|e| !e.is_done());
            fences.push(event);
        }
    }

    /// Blocks until every transfer touching this block has finished,
    /// reporting the first failure.
    pub(crate) fn synchronize(&self) -> Result<(), MemoryError> {
        let mut result = Ok(());
        for event in self.pending() {
            if let Err(e) = event.wait() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Like [`Block::synchronize`], but only orders access; failures are
    /// left for whoever waits on the transfer's own event.
    pub(crate) fn settle(&self) {
        for event in self.pending() {
            let _ = event.wait();
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `resource.allocate(size, align)` and this
        // is the last reference to it.
        unsafe { self.resource.deallocate(self.ptr, self.size, self.align) };
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("space", &self.space())
            .field("address", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}
