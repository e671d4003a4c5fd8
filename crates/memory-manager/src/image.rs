// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Pool-checked-out buffers.
//!
//! An [`Image`] pairs an owning pointer with the pool slot it came from.
//! Dropping it returns the buffer to that slot.

use crate::pool::{PoolShared, SlotHandle};
use crate::ptr::BufferPtr;
use crate::{MemoryError, MemoryManager};
use buffer_core::Element;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

/// A buffer on loan from a [`MemoryPool`](crate::MemoryPool).
///
/// Derefs to the underlying [`BufferPtr`]. Moving an `Image` moves the
/// slot association with it; the slot is only a location and never owns
/// the buffer.
pub struct Image<T: Element, M: MemoryManager> {
    buffer: Option<BufferPtr<T, M::Space>>,
    slot: Option<SlotHandle>,
    pool: Weak<PoolShared<M>>,
}

impl<T: Element, M: MemoryManager> Image<T, M> {
    pub(crate) fn pooled(
        buffer: BufferPtr<T, M::Space>,
        slot: SlotHandle,
        pool: Weak<PoolShared<M>>,
    ) -> Self {
        Self {
            buffer: Some(buffer),
            slot: Some(slot),
            pool,
        }
    }

    /// Wraps a buffer that no pool manages. It is freed on drop.
    pub fn detached(buffer: BufferPtr<T, M::Space>) -> Self {
        Self {
            buffer: Some(buffer),
            slot: None,
            pool: Weak::new(),
        }
    }

    /// The slot this image returns to, or `None` if it is not pooled.
    pub fn slot(&self) -> Option<SlotHandle> {
        self.slot
    }

    pub fn is_pool_managed(&self) -> bool {
        self.slot.is_some()
    }

    /// Whether this image came from the pool owning `shared`.
    pub(crate) fn issued_by(&self, shared: &Arc<PoolShared<M>>) -> bool {
        self.slot.is_some() && std::ptr::eq(self.pool.as_ptr(), Arc::as_ptr(shared))
    }

    /// Returns the buffer to its pool now, reporting failures.
    ///
    /// Fails with `PoolTornDown` if the pool no longer exists. A detached
    /// image is simply freed.
    pub fn release(mut self) -> Result<(), MemoryError> {
        self.give_back()
    }

    /// Splits the image into its slot and buffer without returning
    /// anything to the pool. Pair with
    /// [`MemoryPool::release_parts`](crate::MemoryPool::release_parts).
    pub fn into_parts(mut self) -> (Option<SlotHandle>, BufferPtr<T, M::Space>) {
        let slot = self.slot.take();
        let buffer = self
            .buffer
            .take()
            .expect("image buffer present until released");
        (slot, buffer)
    }

    fn give_back(&mut self) -> Result<(), MemoryError> {
        let Some(buffer) = self.buffer.take() else {
            return Ok(());
        };
        let Some(slot) = self.slot.take() else {
            return Ok(());
        };
        match self.pool.upgrade() {
            Some(pool) => pool.restore(slot, buffer.into_raw()),
            None => Err(MemoryError::PoolTornDown),
        }
    }
}

impl<T: Element, M: MemoryManager> Deref for Image<T, M> {
    type Target = BufferPtr<T, M::Space>;

    fn deref(&self) -> &Self::Target {
        self.buffer
            .as_ref()
            .expect("image buffer present until released")
    }
}

impl<T: Element, M: MemoryManager> DerefMut for Image<T, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer
            .as_mut()
            .expect("image buffer present until released")
    }
}

impl<T: Element, M: MemoryManager> Drop for Image<T, M> {
    fn drop(&mut self) {
        let slot = self.slot;
        if let Err(e) = self.give_back() {
            match slot {
                Some(slot) => tracing::error!("image for slot {} not returned: {e}", slot.index()),
                None => tracing::error!("image not returned: {e}"),
            }
        }
    }
}

impl<T: Element, M: MemoryManager> fmt::Debug for Image<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("slot", &self.slot)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Capacity, HostMemoryManager, MemoryPool};

    #[test]
    fn test_detached_image_is_freed() {
        let manager = HostMemoryManager::new(Capacity::unlimited());
        let buffer = manager.make_ptr::<u32>(100).unwrap();
        let image: Image<u32, HostMemoryManager> = Image::detached(buffer);
        assert!(!image.is_pool_managed());
        assert!(image.slot().is_none());
        image.release().unwrap();
        assert_eq!(manager.usage().live_bytes, 0);
    }

    #[test]
    fn test_move_keeps_association() {
        let pool = MemoryPool::new(HostMemoryManager::new(Capacity::unlimited()));
        let image = pool.acquire::<u8>(32, 8, 1).unwrap();
        let slot = image.slot();
        let moved = vec![image];
        assert_eq!(moved[0].slot(), slot);
        assert_eq!(pool.in_use_count(), 1);
        drop(moved);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_host_image_data_survives_reuse() {
        let pool = MemoryPool::new(HostMemoryManager::new(Capacity::unlimited()));
        let mut image = pool.acquire::<f32>(4, 2, 1).unwrap();
        image.write_packed(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
        image.release().unwrap();

        // Pooled buffers are handed out as-is.
        let image = pool.acquire::<f32>(4, 2, 1).unwrap();
        assert_eq!(image.row(1, 0), &[5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_drop_after_pool_gone_frees_buffer() {
        let manager = HostMemoryManager::new(Capacity::unlimited());
        let pool = MemoryPool::new(manager.clone());
        let image = pool.acquire::<u16>(16, 16, 1).unwrap();
        drop(pool);
        assert!(manager.usage().live_bytes > 0);
        drop(image);
        assert_eq!(manager.usage().live_bytes, 0);
    }
}
