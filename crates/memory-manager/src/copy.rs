// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Copy policies: how bytes move between buffers and memory spaces.
//!
//! A [`CopyPolicy`] is bound to every owning pointer when it is allocated.
//! It decides whether a transfer runs on the calling thread
//! ([`SyncCopy`]) or is queued on a [`Stream`] ([`AsyncCopy`]), and it
//! owns the deallocation path, so frees issued by an asynchronous pointer
//! are ordered behind the transfers already queued on its stream.
//!
//! Transfers honour pitch: when source and destination pitches match the
//! whole span is copied at once, otherwise row by row.

use crate::block::Block;
use crate::stream::{Event, Stream};
use crate::MemoryError;
use buffer_core::{BufferLayout, MemorySpace};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Whether transfers block the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    Sync,
    Async,
}

/// A validated transfer between two blocks.
///
/// Holding the blocks keeps both allocations alive until the transfer has
/// run, even if the pointers that issued it are dropped first.
pub struct CopyJob {
    src: Arc<Block>,
    src_layout: BufferLayout,
    dst: Arc<Block>,
    dst_layout: BufferLayout,
    /// Earlier transfers on either block that must finish first.
    after: Vec<Event>,
}

impl CopyJob {
    pub(crate) fn new(
        src: &Arc<Block>,
        src_layout: BufferLayout,
        dst: &Arc<Block>,
        dst_layout: BufferLayout,
    ) -> Result<Self, MemoryError> {
        if !src_layout.is_copy_compatible(&dst_layout) {
            return Err(MemoryError::ShapeMismatch {
                expected: format!("{} {}", dst_layout.dtype(), dst_layout.extent()),
                actual: format!("{} {}", src_layout.dtype(), src_layout.extent()),
            });
        }
        if Arc::ptr_eq(src, dst) {
            return Err(MemoryError::TransferFailure(
                "source and destination are the same allocation".into(),
            ));
        }
        debug_assert!(src_layout.size_bytes() <= src.size_bytes());
        debug_assert!(dst_layout.size_bytes() <= dst.size_bytes());

        let mut after = src.pending();
        after.extend(dst.pending());
        Ok(Self {
            src: Arc::clone(src),
            src_layout,
            dst: Arc::clone(dst),
            dst_layout,
            after,
        })
    }

    /// `(source space, destination space)`.
    pub fn direction(&self) -> (MemorySpace, MemorySpace) {
        (self.src.space(), self.dst.space())
    }

    /// Payload bytes moved by this job (padding excluded).
    pub fn payload_bytes(&self) -> usize {
        self.src_layout.row_bytes() * self.src_layout.rows()
    }

    /// Waits for earlier transfers on either block, then moves the bytes.
    pub fn execute(&self) -> Result<(), MemoryError> {
        for event in &self.after {
            event.wait().map_err(|e| {
                MemoryError::TransferFailure(format!("an earlier transfer failed: {e}"))
            })?;
        }

        let (src_pitch, dst_pitch) = (self.src_layout.pitch(), self.dst_layout.pitch());
        let src = self.src.as_ptr() as *const u8;
        let dst = self.dst.as_ptr();

        // SAFETY: both layouts fit their blocks, the blocks are distinct
        // allocations, and the fences above order this job after every
        // earlier access.
        unsafe {
            if src_pitch == dst_pitch {
                std::ptr::copy_nonoverlapping(src, dst, self.src_layout.size_bytes());
            } else {
                let row_bytes = self.src_layout.row_bytes();
                for row in 0..self.src_layout.rows() {
                    std::ptr::copy_nonoverlapping(
                        src.add(row * src_pitch),
                        dst.add(row * dst_pitch),
                        row_bytes,
                    );
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CopyJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (from, to) = self.direction();
        f.debug_struct("CopyJob")
            .field("from", &from)
            .field("to", &to)
            .field("extent", &self.src_layout.extent())
            .field("src_pitch", &self.src_layout.pitch())
            .field("dst_pitch", &self.dst_layout.pitch())
            .finish()
    }
}

/// Strategy for performing transfers and releasing allocations.
pub trait CopyPolicy: Send + Sync + fmt::Debug {
    fn mode(&self) -> CopyMode;

    /// Performs or schedules `job`.
    ///
    /// The returned event is signalled when the bytes have arrived.
    fn submit(&self, job: CopyJob) -> Result<Event, MemoryError>;

    /// Gives up one reference to an allocation.
    fn release(&self, block: Arc<Block>);
}

/// Transfers complete before `submit` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncCopy;

impl CopyPolicy for SyncCopy {
    fn mode(&self) -> CopyMode {
        CopyMode::Sync
    }

    fn submit(&self, job: CopyJob) -> Result<Event, MemoryError> {
        tracing::trace!("sync copy: {job:?}");
        job.execute()?;
        Ok(Event::completed())
    }

    fn release(&self, block: Arc<Block>) {
        drop(block);
    }
}

/// Transfers and frees are queued on a stream; callers wait on the
/// returned event before reading the destination.
#[derive(Debug, Clone)]
pub struct AsyncCopy {
    stream: Arc<Stream>,
}

impl AsyncCopy {
    pub fn new(stream: Arc<Stream>) -> Self {
        Self { stream }
    }

    /// Creates a policy with a dedicated stream.
    pub fn with_new_stream(name: &str) -> Result<Self, MemoryError> {
        Ok(Self::new(Arc::new(Stream::new(name)?)))
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }
}

impl CopyPolicy for AsyncCopy {
    fn mode(&self) -> CopyMode {
        CopyMode::Async
    }

    fn submit(&self, job: CopyJob) -> Result<Event, MemoryError> {
        tracing::trace!("async copy on '{}': {job:?}", self.stream.name());
        let event = Event::pending();
        let signal = event.clone();
        self.stream.enqueue(move || {
            match panic::catch_unwind(AssertUnwindSafe(|| job.execute())) {
                Ok(Ok(())) => signal.complete(),
                Ok(Err(e)) => signal.fail(e.to_string()),
                Err(_) => signal.fail("copy job panicked"),
            }
        })?;
        Ok(event)
    }

    fn release(&self, block: Arc<Block>) {
        // On a closed stream the block drops here; queued jobs hold their
        // own references.
        if let Err(e) = self.stream.enqueue(move || drop(block)) {
            tracing::warn!("deferred free not queued: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Capacity, HeapResource, MemoryResource};
    use buffer_core::{DType, Extent};

    fn resource(space: MemorySpace) -> Arc<dyn MemoryResource> {
        match space {
            MemorySpace::Host => Arc::new(HeapResource::host(Capacity::unlimited())),
            MemorySpace::Device => Arc::new(HeapResource::emulated_device(Capacity::unlimited())),
        }
    }

    fn block(r: &Arc<dyn MemoryResource>, layout: BufferLayout) -> Arc<Block> {
        Block::allocate(r, layout.size_bytes(), 64).unwrap()
    }

    fn bytes(b: &Block) -> &[u8] {
        unsafe { std::slice::from_raw_parts(b.as_ptr(), b.size_bytes()) }
    }

    fn fill(b: &Block, pattern: impl Fn(usize) -> u8) {
        let s = unsafe { std::slice::from_raw_parts_mut(b.as_ptr(), b.size_bytes()) };
        for (i, v) in s.iter_mut().enumerate() {
            *v = pattern(i);
        }
    }

    #[test]
    fn test_row_by_row_when_pitches_differ() {
        let host = resource(MemorySpace::Host);
        let dev = resource(MemorySpace::Device);
        let extent = Extent::plane(5, 3).unwrap();
        let linear = BufferLayout::linear(extent, DType::U8).unwrap();
        let pitched = BufferLayout::pitched(extent, DType::U8, 16).unwrap();

        let src = block(&host, linear);
        fill(&src, |i| i as u8 + 1);
        let dst = block(&dev, pitched);

        let job = CopyJob::new(&src, linear, &dst, pitched).unwrap();
        assert_eq!(job.direction(), (MemorySpace::Host, MemorySpace::Device));
        assert_eq!(job.payload_bytes(), 15);
        SyncCopy.submit(job).unwrap().wait().unwrap();

        let out = bytes(&dst);
        for row in 0..3 {
            let expected: Vec<u8> = (0..5).map(|x| (row * 5 + x) as u8 + 1).collect();
            assert_eq!(&out[row * 16..row * 16 + 5], expected.as_slice());
            assert!(out[row * 16 + 5..row * 16 + 16].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let host = resource(MemorySpace::Host);
        let a = BufferLayout::linear(Extent::plane(4, 4).unwrap(), DType::F32).unwrap();
        let b = BufferLayout::linear(Extent::plane(4, 5).unwrap(), DType::F32).unwrap();
        let c = BufferLayout::linear(Extent::plane(4, 4).unwrap(), DType::U32).unwrap();
        let (ba, bb, bc) = (block(&host, a), block(&host, b), block(&host, c));
        assert!(matches!(
            CopyJob::new(&ba, a, &bb, b),
            Err(MemoryError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            CopyJob::new(&ba, a, &bc, c),
            Err(MemoryError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_async_copy_and_deferred_free() {
        let host = resource(MemorySpace::Host);
        let dev = resource(MemorySpace::Device);
        let layout = BufferLayout::linear(Extent::linear(4096).unwrap(), DType::U8).unwrap();
        let src = block(&host, layout);
        fill(&src, |i| (i % 251) as u8);
        let dst = block(&dev, layout);

        let policy = AsyncCopy::with_new_stream("copy-test").unwrap();
        assert_eq!(policy.mode(), CopyMode::Async);
        let event = policy
            .submit(CopyJob::new(&src, layout, &dst, layout).unwrap())
            .unwrap();
        dst.push_fence(event.clone());
        event.wait().unwrap();
        assert_eq!(bytes(&src), bytes(&dst));

        policy.release(dst);
        policy.stream().synchronize().unwrap();
        assert_eq!(dev.usage().live_bytes, 0);
        assert_eq!(dev.usage().deallocations, 1);
    }

    #[test]
    fn test_failed_dependency_fails_job() {
        let host = resource(MemorySpace::Host);
        let layout = BufferLayout::linear(Extent::linear(16).unwrap(), DType::U8).unwrap();
        let (a, b) = (block(&host, layout), block(&host, layout));
        let broken = Event::pending();
        a.push_fence(broken.clone());
        broken.fail("device lost");
        // Already-failed fences are pruned as done; the job runs normally.
        assert!(SyncCopy.submit(CopyJob::new(&a, layout, &b, layout).unwrap()).is_ok());

        let pending = Event::pending();
        a.push_fence(pending.clone());
        let job = CopyJob::new(&a, layout, &b, layout).unwrap();
        pending.fail("device lost");
        assert!(matches!(
            SyncCopy.submit(job),
            Err(MemoryError::TransferFailure(_))
        ));
    }
}
