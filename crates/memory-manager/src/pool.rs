// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Shape-keyed buffer pool.
//!
//! The [`MemoryPool`] wraps a [`MemoryManager`] and recycles released
//! buffers. It:
//!
//! 1. Serves requests from free entries whose [`ShapeKey`] (and therefore
//!    pitch) matches exactly, most recently freed first.
//! 2. Falls back to the manager on a miss. The allocation runs outside
//!    the table lock, and the table is re-checked before the new entry is
//!    inserted.
//! 3. Never destroys a buffer on release; only [`MemoryPool::purge`],
//!    [`MemoryPool::purge_shape`], [`MemoryPool::purge_group`] and
//!    teardown do.
//!
//! Entries reserved with [`MemoryPool::reserve_group`] belong to a named
//! group and serve only [`MemoryPool::acquire_group_wait`] calls for that
//! group, so two owners of the same shape never drain each other.
//!
//! # Entry lifecycle
//! ```text
//!   reserve / miss          acquire              release
//!   ─────────────► Free ─────────────► InUse ─────────────► Free
//!                   │                    │
//!             purge │                    │ purge, then release
//!                   ▼                    ▼
//!               Destroyed ◄──────────────┘
//! ```
//!
//! Entries are addressed by [`SlotHandle`]s, which carry a generation so a
//! handle outliving its entry is detected instead of hitting a recycled
//! slot.
//!
//! # Thread Safety
//! `MemoryPool` is `Send + Sync`. One mutex guards the entry table and is
//! held only for lookups and updates.

use crate::image::Image;
use crate::ptr::{BufferPtr, RawBuffer, Space};
use crate::{MemoryError, MemoryManager, PoolStats};
use buffer_core::{BufferLayout, Element, Extent, ShapeKey};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Location of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: usize,
    generation: u64,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Which requests an entry may serve: same shape key, same group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Bucket {
    key: ShapeKey,
    group: Option<Arc<str>>,
}

impl Bucket {
    fn shared(key: ShapeKey) -> Self {
        Self { key, group: None }
    }

    fn grouped(key: ShapeKey, group: &str) -> Self {
        Self {
            key,
            group: Some(Arc::from(group)),
        }
    }

    fn in_group(&self, group: &str) -> bool {
        self.group.as_deref() == Some(group)
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.group {
            Some(group) => write!(f, "[{group}] {}", self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

enum EntryState {
    Free(RawBuffer),
    /// `doomed` entries are destroyed instead of pooled when released.
    InUse { doomed: bool },
    Destroyed,
}

struct Entry {
    bucket: Bucket,
    layout: BufferLayout,
    generation: u64,
    state: EntryState,
}

enum Returned {
    Pooled,
    Destroyed(RawBuffer),
}

/// The slot table. Every method is a short, non-blocking update.
#[derive(Default)]
pub(crate) struct EntryTable {
    entries: Vec<Entry>,
    /// Free slots per bucket; the most recently freed is last.
    free: HashMap<Bucket, Vec<usize>>,
    vacant: Vec<usize>,
    next_generation: u64,
    in_use: usize,
    closed: bool,
}

impl EntryTable {
    fn take_free(&mut self, bucket: &Bucket) -> Option<(SlotHandle, RawBuffer)> {
        let slots = self.free.get_mut(bucket)?;
        let index = slots.pop()?;
        if slots.is_empty() {
            self.free.remove(bucket);
        }
        let entry = &mut self.entries[index];
        match std::mem::replace(&mut entry.state, EntryState::InUse { doomed: false }) {
            EntryState::Free(raw) => {
                self.in_use += 1;
                Some((
                    SlotHandle {
                        index,
                        generation: entry.generation,
                    },
                    raw,
                ))
            }
            other => {
                entry.state = other;
                None
            }
        }
    }

    fn insert(&mut self, bucket: Bucket, layout: BufferLayout, state: EntryState) -> SlotHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let free_bucket = matches!(state, EntryState::Free(_)).then(|| bucket.clone());
        let entry = Entry {
            bucket,
            layout,
            generation,
            state,
        };
        let index = match self.vacant.pop() {
            Some(index) => {
                self.entries[index] = entry;
                index
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        match free_bucket {
            Some(bucket) => self.free.entry(bucket).or_default().push(index),
            None => self.in_use += 1,
        }
        SlotHandle { index, generation }
    }

    fn restore(
        &mut self,
        slot: SlotHandle,
        raw: RawBuffer,
    ) -> Result<Returned, (MemoryError, RawBuffer)> {
        let stale = MemoryError::UseAfterRelease {
            slot: slot.index,
            generation: slot.generation,
        };
        let Some(entry) = self.entries.get_mut(slot.index) else {
            return Err((stale, raw));
        };
        if entry.generation != slot.generation {
            return Err((stale, raw));
        }
        let doomed = match entry.state {
            EntryState::InUse { doomed } => doomed,
            EntryState::Free(_) => {
                return Err((MemoryError::DoubleRelease { slot: slot.index }, raw));
            }
            EntryState::Destroyed => return Err((stale, raw)),
        };
        if raw.layout() != entry.layout || raw.space() != entry.bucket.key.space {
            let expected = entry.bucket.key.to_string();
            return Err((
                MemoryError::ShapeMismatch {
                    expected,
                    actual: raw.key().to_string(),
                },
                raw,
            ));
        }

        self.in_use -= 1;
        if doomed || self.closed {
            entry.state = EntryState::Destroyed;
            self.vacant.push(slot.index);
            Ok(Returned::Destroyed(raw))
        } else {
            entry.state = EntryState::Free(raw);
            self.free
                .entry(entry.bucket.clone())
                .or_default()
                .push(slot.index);
            Ok(Returned::Pooled)
        }
    }

    fn purge_where(&mut self, matches: impl Fn(&Bucket) -> bool) -> Vec<RawBuffer> {
        let buckets: Vec<Bucket> = self.free.keys().filter(|b| matches(b)).cloned().collect();
        let mut purged = Vec::new();
        for bucket in buckets {
            for index in self.free.remove(&bucket).unwrap_or_default() {
                let entry = &mut self.entries[index];
                if let EntryState::Free(raw) =
                    std::mem::replace(&mut entry.state, EntryState::Destroyed)
                {
                    purged.push(raw);
                    self.vacant.push(index);
                }
            }
        }
        for entry in &mut self.entries {
            if let EntryState::InUse { doomed } = &mut entry.state {
                if matches(&entry.bucket) {
                    *doomed = true;
                }
            }
        }
        purged
    }

    /// Whether any entry of `bucket` can still become free.
    fn has_live(&self, bucket: &Bucket) -> bool {
        self.entries.iter().any(|e| {
            e.bucket == *bucket
                && match e.state {
                    EntryState::Free(_) => true,
                    EntryState::InUse { doomed } => !doomed,
                    EntryState::Destroyed => false,
                }
        })
    }

    /// Live (free or in-use, not doomed) entries reserved under `group`.
    fn group_count(&self, group: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                e.bucket.in_group(group)
                    && matches!(
                        e.state,
                        EntryState::Free(_) | EntryState::InUse { doomed: false }
                    )
            })
            .count()
    }

    fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    fn entry_count(&self) -> usize {
        self.entries.len() - self.vacant.len()
    }
}

/// State shared between a pool and the images it issued.
pub(crate) struct PoolShared<M: MemoryManager> {
    manager: M,
    table: Mutex<EntryTable>,
    available: Condvar,
    stats: Mutex<PoolStats>,
}

impl<M: MemoryManager> PoolShared<M> {
    fn table(&self) -> MutexGuard<'_, EntryTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, update: impl FnOnce(&mut PoolStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// Returns a checked-out buffer to `slot`.
    pub(crate) fn restore(&self, slot: SlotHandle, raw: RawBuffer) -> Result<(), MemoryError> {
        let outcome = self.table().restore(slot, raw);
        match outcome {
            Ok(Returned::Pooled) => {
                self.available.notify_all();
                self.record(|s| s.releases += 1);
                tracing::trace!("slot {} returned to pool", slot.index);
                Ok(())
            }
            Ok(Returned::Destroyed(raw)) => {
                tracing::debug!("slot {} released after purge; freeing {:?}", slot.index, raw);
                drop(raw);
                self.record(|s| {
                    s.releases += 1;
                    s.purged_entries += 1;
                });
                Ok(())
            }
            Err((e, raw)) => {
                tracing::warn!("release of slot {} rejected: {e}", slot.index);
                drop(raw);
                self.record(|s| s.rejected_releases += 1);
                Err(e)
            }
        }
    }

    /// Closes the table and destroys every free entry.
    ///
    /// Returns the number of entries still in use, or `None` if the table
    /// was already closed.
    fn shutdown(&self) -> Option<usize> {
        let (purged, in_use) = {
            let mut table = self.table();
            if table.closed {
                return None;
            }
            table.closed = true;
            (table.purge_where(|_| true), table.in_use)
        };
        self.available.notify_all();
        let destroyed = purged.len();
        drop(purged);
        self.record(|s| s.purged_entries += destroyed as u64);
        tracing::debug!("pool shut down: {destroyed} free entries destroyed, {in_use} in use");
        Some(in_use)
    }
}

/// A thread-safe pool of reusable buffers over a [`MemoryManager`].
///
/// # Example
/// ```
/// use memory_manager::{Capacity, DeviceMemoryManager, MemoryManager, MemoryPool};
///
/// let pool = MemoryPool::new(DeviceMemoryManager::new(Capacity::from_mb(64)));
///
/// let image = pool.acquire::<f32>(512, 512, 1).unwrap();
/// let first = image.address();
/// drop(image); // back to the pool, not freed
///
/// let again = pool.acquire::<f32>(512, 512, 1).unwrap();
/// assert_eq!(again.address(), first);
/// assert_eq!(pool.manager().allocation_count(), 1);
/// ```
pub struct MemoryPool<M: MemoryManager> {
    shared: Arc<PoolShared<M>>,
}

impl<M: MemoryManager> MemoryPool<M> {
    pub fn new(manager: M) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                manager,
                table: Mutex::new(EntryTable::default()),
                available: Condvar::new(),
                stats: Mutex::new(PoolStats::default()),
            }),
        }
    }

    /// The underlying allocator.
    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// The key a request for `extent` elements of `T` is matched by.
    pub fn key_for<T: Element>(&self, extent: Extent) -> Result<ShapeKey, MemoryError> {
        Ok(self.layout_for::<T>(extent)?.key(<M::Space as Space>::SPACE))
    }

    fn layout_for<T: Element>(&self, extent: Extent) -> Result<BufferLayout, MemoryError> {
        Ok(self.shared.manager.layout_for(extent, T::DTYPE)?)
    }

    /// Checks out a `width × height × depth` buffer of `T`.
    ///
    /// Reuses a free ungrouped entry with the same key if one exists;
    /// otherwise the manager allocates a new one. On allocation failure
    /// the table is left exactly as it was.
    pub fn acquire<T: Element>(
        &self,
        width: usize,
        height: usize,
        depth: usize,
    ) -> Result<Image<T, M>, MemoryError> {
        self.acquire_extent(Extent::new(width, height, depth)?)
    }

    /// [`MemoryPool::acquire`] for a prebuilt extent.
    pub fn acquire_extent<T: Element>(&self, extent: Extent) -> Result<Image<T, M>, MemoryError> {
        let layout = self.layout_for::<T>(extent)?;
        let bucket = Bucket::shared(layout.key(<M::Space as Space>::SPACE));

        if let Some(hit) = self.take_free(&bucket) {
            return self.issue(hit, true);
        }

        let fresh = match self.shared.manager.allocate_raw(layout) {
            Ok(raw) => raw,
            Err(e) => {
                self.shared.record(|s| s.allocation_failures += 1);
                return Err(e);
            }
        };

        let mut table = self.shared.table();
        if let Some(hit) = table.take_free(&bucket) {
            drop(table);
            tracing::debug!("{bucket}: entry freed during allocation; discarding the new buffer");
            drop(fresh);
            return self.issue(hit, true);
        }
        let slot = table.insert(bucket.clone(), layout, EntryState::InUse { doomed: false });
        drop(table);
        tracing::debug!("{bucket}: pool miss, new entry in slot {}", slot.index);
        self.issue((slot, fresh), false)
    }

    /// Checks out a reserved ungrouped buffer, waiting for one to be
    /// released if none is free. Never allocates.
    ///
    /// Fails with `NotReserved` if the pool holds no entry that could ever
    /// satisfy the request, and with `Timeout` once `timeout` elapses.
    pub fn acquire_wait<T: Element>(
        &self,
        extent: Extent,
        timeout: Option<Duration>,
    ) -> Result<Image<T, M>, MemoryError> {
        let bucket = Bucket::shared(self.key_for::<T>(extent)?);
        self.wait_for(bucket, timeout)
    }

    /// [`MemoryPool::acquire_wait`] restricted to the entries reserved
    /// under `group`.
    pub fn acquire_group_wait<T: Element>(
        &self,
        group: &str,
        extent: Extent,
        timeout: Option<Duration>,
    ) -> Result<Image<T, M>, MemoryError> {
        let bucket = Bucket::grouped(self.key_for::<T>(extent)?, group);
        self.wait_for(bucket, timeout)
    }

    fn wait_for<T: Element>(
        &self,
        bucket: Bucket,
        timeout: Option<Duration>,
    ) -> Result<Image<T, M>, MemoryError> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let mut waited = false;
        let mut table = self.shared.table();
        loop {
            if let Some(hit) = table.take_free(&bucket) {
                let in_use = table.in_use;
                drop(table);
                self.shared.record(|s| {
                    s.update_peak(in_use);
                    if waited {
                        s.waits += 1;
                    }
                });
                return self.issue(hit, true);
            }
            if !table.has_live(&bucket) {
                return Err(MemoryError::NotReserved(bucket.key));
            }
            waited = true;
            table = match deadline {
                None => self
                    .shared
                    .available
                    .wait(table)
                    .unwrap_or_else(PoisonError::into_inner),
                Some((deadline, limit)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(MemoryError::Timeout {
                            waited: limit,
                            key: bucket.key,
                        });
                    }
                    self.shared
                        .available
                        .wait_timeout(table, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn take_free(&self, bucket: &Bucket) -> Option<(SlotHandle, RawBuffer)> {
        let mut table = self.shared.table();
        let hit = table.take_free(bucket)?;
        let in_use = table.in_use;
        drop(table);
        self.shared.record(|s| s.update_peak(in_use));
        Some(hit)
    }

    fn issue<T: Element>(
        &self,
        (slot, raw): (SlotHandle, RawBuffer),
        hit: bool,
    ) -> Result<Image<T, M>, MemoryError> {
        if hit {
            tracing::trace!("pool hit: slot {}", slot.index);
            self.shared.record(PoolStats::record_hit);
        } else {
            let in_use = self.in_use_count();
            self.shared.record(|s| {
                s.record_miss();
                s.update_peak(in_use);
            });
        }
        let buffer = BufferPtr::from_raw(raw)?;
        Ok(Image::pooled(buffer, slot, Arc::downgrade(&self.shared)))
    }

    /// Preallocates `count` free entries for `extent` elements of `T`,
    /// shared by every ungrouped request of that shape.
    ///
    /// Either all entries are added or, if an allocation fails, none are.
    pub fn reserve<T: Element>(
        &self,
        extent: Extent,
        count: usize,
    ) -> Result<Vec<SlotHandle>, MemoryError> {
        let layout = self.layout_for::<T>(extent)?;
        let bucket = Bucket::shared(layout.key(<M::Space as Space>::SPACE));
        self.reserve_in(bucket, layout, count)
    }

    /// Preallocates `count` entries that only
    /// [`MemoryPool::acquire_group_wait`] with the same `group` can take.
    pub fn reserve_group<T: Element>(
        &self,
        group: &str,
        extent: Extent,
        count: usize,
    ) -> Result<Vec<SlotHandle>, MemoryError> {
        let layout = self.layout_for::<T>(extent)?;
        let bucket = Bucket::grouped(layout.key(<M::Space as Space>::SPACE), group);
        self.reserve_in(bucket, layout, count)
    }

    fn reserve_in(
        &self,
        bucket: Bucket,
        layout: BufferLayout,
        count: usize,
    ) -> Result<Vec<SlotHandle>, MemoryError> {
        let mut fresh = Vec::with_capacity(count);
        for _ in 0..count {
            match self.shared.manager.allocate_raw(layout) {
                Ok(raw) => fresh.push(raw),
                Err(e) => {
                    self.shared.record(|s| s.allocation_failures += 1);
                    return Err(e);
                }
            }
        }

        let slots: Vec<SlotHandle> = {
            let mut table = self.shared.table();
            fresh
                .into_iter()
                .map(|raw| table.insert(bucket.clone(), layout, EntryState::Free(raw)))
                .collect()
        };
        self.shared.available.notify_all();
        self.shared.record(|s| s.reserved_entries += count as u64);
        tracing::info!("{bucket}: reserved {count} entries");
        Ok(slots)
    }

    /// Returns an image's buffer to this pool.
    ///
    /// Fails with `ForeignImage` if the image was not issued by this pool;
    /// the rejected image then drops and returns to its own pool.
    pub fn release<T: Element>(&self, image: Image<T, M>) -> Result<(), MemoryError> {
        if !image.issued_by(&self.shared) {
            tracing::warn!("release of an image issued elsewhere rejected");
            self.shared.record(|s| s.rejected_releases += 1);
            return Err(MemoryError::ForeignImage);
        }
        image.release()
    }

    /// Returns a buffer detached with [`Image::into_parts`] to `slot`.
    ///
    /// Releasing a slot that is already free fails with `DoubleRelease`;
    /// a handle whose entry was destroyed fails with `UseAfterRelease`.
    /// A rejected buffer is freed.
    pub fn release_parts<T: Element>(
        &self,
        slot: SlotHandle,
        buffer: BufferPtr<T, M::Space>,
    ) -> Result<(), MemoryError> {
        self.shared.restore(slot, buffer.into_raw())
    }

    /// Destroys every free entry. Entries in use are destroyed when they
    /// are released. Returns the number of entries destroyed now.
    pub fn purge(&self) -> usize {
        self.purge_matching(|_| true)
    }

    /// Destroys the free entries of one shape, grouped or not.
    pub fn purge_shape<T: Element>(&self, extent: Extent) -> Result<usize, MemoryError> {
        let key = self.key_for::<T>(extent)?;
        Ok(self.purge_matching(|b| b.key == key))
    }

    /// Destroys the entries reserved under `group`.
    pub fn purge_group(&self, group: &str) -> usize {
        self.purge_matching(|b| b.in_group(group))
    }

    fn purge_matching(&self, matches: impl Fn(&Bucket) -> bool) -> usize {
        let purged = self.shared.table().purge_where(matches);
        // Waiters for a purged bucket must see `NotReserved`.
        self.shared.available.notify_all();
        let destroyed = purged.len();
        drop(purged);
        self.shared.record(|s| s.purged_entries += destroyed as u64);
        tracing::info!("purged {destroyed} free entries");
        destroyed
    }

    pub fn stats(&self) -> PoolStats {
        self.shared
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Live entries (free or in use).
    pub fn entry_count(&self) -> usize {
        self.shared.table().entry_count()
    }

    /// Live entries reserved under `group`.
    pub fn group_entry_count(&self, group: &str) -> usize {
        self.shared.table().group_count(group)
    }

    pub fn free_count(&self) -> usize {
        self.shared.table().free_count()
    }

    pub fn in_use_count(&self) -> usize {
        self.shared.table().in_use
    }

    /// Destroys the pool and all free entries.
    ///
    /// Fails with `OutstandingEntries` if images are still checked out;
    /// their buffers are freed when they drop, and explicit releases
    /// report `PoolTornDown`.
    pub fn teardown(self) -> Result<(), MemoryError> {
        match self.shared.shutdown() {
            Some(in_use) if in_use > 0 => {
                tracing::error!("pool torn down with {in_use} entries still in use");
                Err(MemoryError::OutstandingEntries { in_use })
            }
            _ => Ok(()),
        }
    }
}

impl<M: MemoryManager> Drop for MemoryPool<M> {
    fn drop(&mut self) {
        if let Some(in_use) = self.shared.shutdown() {
            if in_use > 0 {
                tracing::error!("pool dropped with {in_use} entries still in use");
            }
        }
    }
}

impl<M: MemoryManager> std::fmt::Debug for MemoryPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.shared.table();
        f.debug_struct("MemoryPool")
            .field("space", &<M::Space as Space>::SPACE)
            .field("entries", &table.entry_count())
            .field("free", &table.free_count())
            .field("in_use", &table.in_use)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Capacity, DefaultMemoryManager, DeviceMemoryManager, HostMemoryManager};
    use std::thread;

    fn device_pool(capacity: Capacity) -> MemoryPool<DeviceMemoryManager> {
        MemoryPool::new(DeviceMemoryManager::new(capacity))
    }

    #[test]
    fn test_reuse_keeps_allocation_count_at_one() {
        let pool = device_pool(Capacity::from_mb(16));
        let mut addresses = Vec::new();
        for _ in 0..2 {
            let image = pool.acquire::<u16>(640, 480, 1).unwrap();
            addresses.push(image.address());
            drop(image);
        }
        assert_eq!(addresses[0], addresses[1]);
        assert_eq!(pool.manager().allocation_count(), 1);
        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses, stats.releases), (1, 1, 2));
    }

    #[test]
    fn test_different_keys_do_not_share() {
        let pool = device_pool(Capacity::unlimited());
        drop(pool.acquire::<f32>(64, 64, 1).unwrap());
        drop(pool.acquire::<u32>(64, 64, 1).unwrap());
        drop(pool.acquire::<f32>(64, 32, 2).unwrap());
        assert_eq!(pool.manager().allocation_count(), 3);
        assert_eq!(pool.entry_count(), 3);
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_mru_tie_break() {
        let pool = device_pool(Capacity::unlimited());
        let a = pool.acquire::<u8>(32, 32, 1).unwrap();
        let b = pool.acquire::<u8>(32, 32, 1).unwrap();
        let b_addr = b.address();
        drop(a);
        drop(b);
        let next = pool.acquire::<u8>(32, 32, 1).unwrap();
        assert_eq!(next.address(), b_addr);
    }

    #[test]
    fn test_failed_acquire_leaves_table_unchanged() {
        let pool = device_pool(Capacity::from_bytes(64 * 1024));
        let held = pool.acquire::<u8>(256, 64, 1).unwrap();
        drop(pool.acquire::<u8>(128, 64, 1).unwrap());
        let (entries, free, in_use) = (pool.entry_count(), pool.free_count(), pool.in_use_count());

        let err = pool.acquire::<f32>(1024, 1024, 1).unwrap_err();
        assert!(matches!(err, MemoryError::AllocationFailure { .. }));
        assert_eq!(
            (pool.entry_count(), pool.free_count(), pool.in_use_count()),
            (entries, free, in_use)
        );
        assert_eq!(pool.stats().allocation_failures, 1);
        drop(held);
    }

    #[test]
    fn test_invalid_shape() {
        let pool = device_pool(Capacity::unlimited());
        assert!(matches!(
            pool.acquire::<u8>(0, 1, 1),
            Err(MemoryError::InvalidShape(_))
        ));
        assert_eq!(pool.entry_count(), 0);
    }

    #[test]
    fn test_double_release() {
        let pool = device_pool(Capacity::unlimited());
        let image = pool.acquire::<f32>(16, 16, 1).unwrap();
        let (slot, buffer) = image.into_parts();
        let slot = slot.unwrap();
        pool.release_parts(slot, buffer).unwrap();

        let imposter = pool.manager().make_ptr_2d::<f32>(16, 16).unwrap();
        let err = pool.release_parts(slot, imposter).unwrap_err();
        assert!(matches!(err, MemoryError::DoubleRelease { slot: s } if s == slot.index()));
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.stats().rejected_releases, 1);
    }

    #[test]
    fn test_stale_handle_is_use_after_release() {
        let pool = device_pool(Capacity::unlimited());
        let (slot, buffer) = pool.acquire::<u8>(8, 8, 1).unwrap().into_parts();
        let slot = slot.unwrap();
        pool.release_parts(slot, buffer).unwrap();
        assert_eq!(pool.purge(), 1);

        // The vacated slot is recycled with a new generation.
        let fresh = pool.acquire::<u8>(8, 8, 1).unwrap();
        assert_eq!(fresh.slot().unwrap().index(), slot.index());
        assert_ne!(fresh.slot().unwrap().generation(), slot.generation());

        let stray = pool.manager().make_ptr_2d::<u8>(8, 8).unwrap();
        assert!(matches!(
            pool.release_parts(slot, stray),
            Err(MemoryError::UseAfterRelease { .. })
        ));
    }

    #[test]
    fn test_release_wrong_shape_rejected() {
        let pool = device_pool(Capacity::unlimited());
        let (slot, _buffer) = pool.acquire::<u8>(8, 8, 1).unwrap().into_parts();
        let other = pool.manager().make_ptr_2d::<u8>(8, 9).unwrap();
        assert!(matches!(
            pool.release_parts(slot.unwrap(), other),
            Err(MemoryError::ShapeMismatch { .. })
        ));
        assert_eq!(pool.in_use_count(), 1);
    }

    #[test]
    fn test_purge_frees_only_free_entries() {
        let pool = device_pool(Capacity::unlimited());
        let held = pool.acquire::<f32>(32, 32, 1).unwrap();
        drop(pool.acquire::<f32>(16, 16, 1).unwrap());
        drop(pool.acquire::<f32>(8, 8, 1).unwrap());

        assert_eq!(pool.purge(), 2);
        assert_eq!(pool.entry_count(), 1);
        assert_eq!(pool.manager().usage().live_allocations(), 1);

        // The held entry is destroyed lazily on release.
        drop(held);
        assert_eq!(pool.entry_count(), 0);
        assert_eq!(pool.manager().usage().live_bytes, 0);
        assert_eq!(pool.stats().purged_entries, 3);
    }

    #[test]
    fn test_purge_shape() {
        let pool = MemoryPool::new(HostMemoryManager::new(Capacity::unlimited()));
        let e1 = Extent::plane(10, 10).unwrap();
        let e2 = Extent::plane(20, 10).unwrap();
        pool.reserve::<u8>(e1, 2).unwrap();
        pool.reserve::<u8>(e2, 3).unwrap();
        assert_eq!(pool.purge_shape::<u8>(e2).unwrap(), 3);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_reserve_then_acquire_hits() {
        let pool = device_pool(Capacity::unlimited());
        let extent = Extent::plane(128, 128).unwrap();
        let slots = pool.reserve::<f32>(extent, 3).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(pool.manager().allocation_count(), 3);

        let images: Vec<_> = (0..3)
            .map(|_| pool.acquire_extent::<f32>(extent).unwrap())
            .collect();
        assert_eq!(pool.manager().allocation_count(), 3);
        assert_eq!(pool.stats().hits, 3);
        assert_eq!(pool.stats().peak_in_use, 3);
        drop(images);
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let pool = device_pool(Capacity::from_bytes(3 * 4096));
        let err = pool.reserve::<u8>(Extent::linear(4096).unwrap(), 4).unwrap_err();
        assert!(matches!(err, MemoryError::AllocationFailure { .. }));
        assert_eq!(pool.entry_count(), 0);
        assert_eq!(pool.manager().usage().live_bytes, 0);
    }

    #[test]
    fn test_acquire_wait_not_reserved() {
        let pool = device_pool(Capacity::unlimited());
        let extent = Extent::plane(4, 4).unwrap();
        assert!(matches!(
            pool.acquire_wait::<u8>(extent, None),
            Err(MemoryError::NotReserved(_))
        ));
    }

    #[test]
    fn test_acquire_wait_timeout() {
        let pool = device_pool(Capacity::unlimited());
        let extent = Extent::plane(4, 4).unwrap();
        pool.reserve::<u8>(extent, 1).unwrap();
        let _held = pool.acquire_wait::<u8>(extent, None).unwrap();
        let err = pool
            .acquire_wait::<u8>(extent, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Timeout { .. }));
    }

    #[test]
    fn test_acquire_wait_wakes_on_release() {
        let pool = Arc::new(device_pool(Capacity::unlimited()));
        let extent = Extent::plane(64, 64).unwrap();
        pool.reserve::<u16>(extent, 1).unwrap();
        let held = pool.acquire_extent::<u16>(extent).unwrap();
        let address = held.address();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let image = pool
                    .acquire_wait::<u16>(extent, Some(Duration::from_secs(10)))
                    .unwrap();
                image.address()
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap(), address);
        assert_eq!(pool.manager().allocation_count(), 1);
    }

    #[test]
    fn test_purge_wakes_waiter_with_not_reserved() {
        let pool = Arc::new(device_pool(Capacity::unlimited()));
        let extent = Extent::plane(32, 32).unwrap();
        pool.reserve::<f32>(extent, 1).unwrap();
        let held = pool.acquire_extent::<f32>(extent).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.acquire_wait::<f32>(extent, Some(Duration::from_secs(10)))
                    .map(|image| image.address())
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.purge_shape::<f32>(extent).unwrap(), 0);

        let started = Instant::now();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(MemoryError::NotReserved(_))));
        assert!(started.elapsed() < Duration::from_secs(5));

        // The doomed entry is destroyed, not pooled, when it comes back.
        drop(held);
        assert_eq!(pool.entry_count(), 0);
        assert_eq!(pool.manager().usage().live_allocations(), 0);
    }

    #[test]
    fn test_group_entries_not_served_to_plain_acquire() {
        let pool = device_pool(Capacity::unlimited());
        let extent = Extent::plane(16, 16).unwrap();
        pool.reserve_group::<f32>("load", extent, 1).unwrap();

        let err = pool.acquire_wait::<f32>(extent, Some(Duration::from_millis(10)));
        assert!(matches!(err, Err(MemoryError::NotReserved(_))));

        let plain = pool.acquire_extent::<f32>(extent).unwrap();
        assert_eq!(pool.manager().allocation_count(), 2);
        assert_eq!(pool.group_entry_count("load"), 1);

        let grouped = pool
            .acquire_group_wait::<f32>("load", extent, Some(Duration::from_millis(10)))
            .unwrap();
        assert_ne!(grouped.address(), plain.address());
    }

    #[test]
    fn test_groups_with_same_shape_are_isolated() {
        let pool = device_pool(Capacity::unlimited());
        let extent = Extent::plane(16, 16).unwrap();
        pool.reserve_group::<f32>("a", extent, 1).unwrap();
        pool.reserve_group::<f32>("b", extent, 1).unwrap();
        let timeout = Some(Duration::from_millis(10));

        let held_a = pool.acquire_group_wait::<f32>("a", extent, timeout).unwrap();
        let err = pool.acquire_group_wait::<f32>("a", extent, timeout);
        assert!(matches!(err, Err(MemoryError::Timeout { .. })));

        let held_b = pool.acquire_group_wait::<f32>("b", extent, timeout).unwrap();
        assert_ne!(held_a.address(), held_b.address());
        let err = pool.acquire_group_wait::<f32>("c", extent, timeout);
        assert!(matches!(err, Err(MemoryError::NotReserved(_))));
    }

    #[test]
    fn test_purge_group_leaves_other_groups() {
        let pool = device_pool(Capacity::unlimited());
        let extent = Extent::plane(16, 16).unwrap();
        pool.reserve_group::<f32>("a", extent, 2).unwrap();
        pool.reserve_group::<f32>("b", extent, 3).unwrap();
        pool.reserve::<f32>(extent, 1).unwrap();

        let held = pool.acquire_group_wait::<f32>("a", extent, None).unwrap();
        assert_eq!(pool.purge_group("a"), 1);
        assert_eq!(pool.group_entry_count("a"), 0);
        assert_eq!(pool.group_entry_count("b"), 3);

        drop(held);
        assert_eq!(pool.entry_count(), 4);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.manager().usage().live_allocations(), 4);
    }

    #[test]
    fn test_release_into_other_pool_rejected() {
        let first = device_pool(Capacity::unlimited());
        let second = device_pool(Capacity::unlimited());
        let image = first.acquire::<u8>(8, 8, 1).unwrap();

        let err = second.release(image).unwrap_err();
        assert!(matches!(err, MemoryError::ForeignImage));
        assert_eq!(second.entry_count(), 0);
        assert_eq!(second.stats().rejected_releases, 1);
        // The rejected image went home to the pool that issued it.
        assert_eq!(first.free_count(), 1);
        assert_eq!(first.in_use_count(), 0);

        let detached = Image::<u8, _>::detached(
            first.manager().make_ptr_2d::<u8>(8, 8).unwrap(),
        );
        assert!(matches!(first.release(detached), Err(MemoryError::ForeignImage)));

        let own = first.acquire::<u8>(8, 8, 1).unwrap();
        first.release(own).unwrap();
        assert_eq!(first.free_count(), 1);
    }

    #[test]
    fn test_teardown_reports_outstanding() {
        let pool = device_pool(Capacity::unlimited());
        let image = pool.acquire::<u8>(16, 16, 1).unwrap();
        drop(pool.acquire::<u8>(8, 8, 1).unwrap());
        let err = pool.teardown().unwrap_err();
        assert!(matches!(err, MemoryError::OutstandingEntries { in_use: 1 }));
        assert!(matches!(image.release(), Err(MemoryError::PoolTornDown)));
    }

    #[test]
    fn test_teardown_frees_everything() {
        let manager = DeviceMemoryManager::new(Capacity::unlimited());
        let pool = MemoryPool::new(manager.clone());
        pool.reserve::<f32>(Extent::plane(32, 32).unwrap(), 4).unwrap();
        assert!(manager.usage().live_bytes > 0);
        pool.teardown().unwrap();
        assert_eq!(manager.usage().live_bytes, 0);
    }

    #[test]
    fn test_default_manager_pool() {
        let pool = MemoryPool::new(DefaultMemoryManager::new());
        let mut image = pool.acquire::<i16>(5, 4, 2).unwrap();
        assert_eq!(image.pitch(), 10);
        image.fill(-3);
        assert!(image.to_vec().iter().all(|&v| v == -3));
    }

    #[test]
    fn test_concurrent_disjoint_shapes_conserve_entries() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;
        let pool = Arc::new(device_pool(Capacity::unlimited()));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let a = pool.acquire::<f32>(16 + t, 8, 1).unwrap();
                        let b = pool.acquire::<f32>(16 + t, 8, 1).unwrap();
                        assert_ne!(a.address(), b.address());
                        drop(a);
                        b.release().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Each thread needed exactly two entries of its own shape.
        assert_eq!(pool.entry_count(), THREADS * 2);
        assert_eq!(pool.free_count(), THREADS * 2);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.manager().allocation_count(), (THREADS * 2) as u64);
        let stats = pool.stats();
        assert_eq!(stats.releases, (THREADS * ROUNDS * 2) as u64);
        assert_eq!(stats.hits + stats.misses, stats.acquisitions);
        assert_eq!(stats.misses, (THREADS * 2) as u64);
    }

    #[test]
    fn test_concurrent_shared_shape_never_duplicates() {
        const THREADS: usize = 6;
        let pool = Arc::new(device_pool(Capacity::unlimited()));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let image = pool.acquire::<u8>(64, 64, 1).unwrap();
                        thread::yield_now();
                        drop(image);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.free_count(), pool.entry_count());
        assert!(pool.entry_count() <= THREADS);
        let live = pool.manager().usage().live_allocations() as usize;
        assert_eq!(live, pool.entry_count());
    }
}
