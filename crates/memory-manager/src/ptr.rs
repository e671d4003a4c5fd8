// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Owning, move-only buffer pointers.
//!
//! [`BufferPtr<T, S>`] binds one allocation, its layout and the copy policy
//! it was allocated with. It is not `Clone`: moving it moves ownership,
//! and the compiler rejects any use of the moved-from value. Dropping it
//! hands the allocation to the policy's deallocation path.
//!
//! The memory space is part of the type. Only host pointers expose their
//! contents as slices; device pointers are reached through copies.
//!
//! ```text
//!   HostPtr<f32> ──copy_to──► DevicePtr<f32> ──copy_to──► HostPtr<f32>
//!        ▲                          │
//!   as_mut_slice()            (no host access)
//! ```

use crate::block::Block;
use crate::copy::{CopyJob, CopyMode, CopyPolicy};
use crate::stream::Event;
use crate::MemoryError;
use buffer_core::{BufferLayout, DType, Element, Extent, MemorySpace, ShapeKey};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

mod sealed {
    pub trait Sealed {}
}

/// Type-level memory space marker.
pub trait Space: sealed::Sealed + Send + Sync + 'static {
    const SPACE: MemorySpace;
}

/// Host RAM.
#[derive(Debug)]
pub enum Host {}

/// Accelerator memory.
#[derive(Debug)]
pub enum Device {}

impl sealed::Sealed for Host {}
impl sealed::Sealed for Device {}

impl Space for Host {
    const SPACE: MemorySpace = MemorySpace::Host;
}

impl Space for Device {
    const SPACE: MemorySpace = MemorySpace::Device;
}

/// An untyped owning buffer: allocation, layout and copy policy.
///
/// This is the form in which pools store buffers of any element type.
pub struct RawBuffer {
    block: Arc<Block>,
    layout: BufferLayout,
    policy: Arc<dyn CopyPolicy>,
}

impl RawBuffer {
    pub(crate) fn new(block: Arc<Block>, layout: BufferLayout, policy: Arc<dyn CopyPolicy>) -> Self {
        Self {
            block,
            layout,
            policy,
        }
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    pub fn space(&self) -> MemorySpace {
        self.block.space()
    }

    pub fn key(&self) -> ShapeKey {
        self.layout.key(self.space())
    }

    /// Base address of the allocation; equal addresses mean the same
    /// underlying buffer.
    pub fn address(&self) -> usize {
        self.block.address()
    }

    pub fn copy_mode(&self) -> CopyMode {
        self.policy.mode()
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        self.policy.release(Arc::clone(&self.block));
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuffer")
            .field("space", &self.space())
            .field("layout", &self.layout)
            .field("mode", &self.copy_mode())
            .finish()
    }
}

/// An exclusively owned buffer of `T` in memory space `S`.
pub struct BufferPtr<T: Element, S: Space> {
    raw: RawBuffer,
    _marker: PhantomData<(T, S)>,
}

/// A buffer in accelerator memory.
pub type DevicePtr<T> = BufferPtr<T, Device>;

/// A buffer in host memory.
pub type HostPtr<T> = BufferPtr<T, Host>;

impl<T: Element, S: Space> BufferPtr<T, S> {
    /// Wraps a raw buffer whose element type and space match `T` and `S`.
    pub(crate) fn from_raw(raw: RawBuffer) -> Result<Self, MemoryError> {
        if raw.layout.dtype() != T::DTYPE || raw.space() != S::SPACE {
            return Err(MemoryError::ShapeMismatch {
                expected: format!("{} {}", S::SPACE, T::DTYPE),
                actual: format!("{} {}", raw.space(), raw.layout.dtype()),
            });
        }
        Ok(Self {
            raw,
            _marker: PhantomData,
        })
    }

    pub(crate) fn into_raw(self) -> RawBuffer {
        self.raw
    }

    pub fn layout(&self) -> BufferLayout {
        self.raw.layout
    }

    pub fn extent(&self) -> Extent {
        self.raw.layout.extent()
    }

    pub fn width(&self) -> usize {
        self.extent().width()
    }

    pub fn height(&self) -> usize {
        self.extent().height()
    }

    pub fn depth(&self) -> usize {
        self.extent().depth()
    }

    /// Row stride in bytes.
    pub fn pitch(&self) -> usize {
        self.raw.layout.pitch()
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    pub fn space(&self) -> MemorySpace {
        S::SPACE
    }

    pub fn is_pitched(&self) -> bool {
        self.raw.layout.is_pitched()
    }

    /// Total bytes of the allocation, padding included.
    pub fn size_bytes(&self) -> usize {
        self.raw.layout.size_bytes()
    }

    pub fn key(&self) -> ShapeKey {
        self.raw.key()
    }

    pub fn copy_mode(&self) -> CopyMode {
        self.raw.copy_mode()
    }

    /// Base address of the allocation.
    pub fn address(&self) -> usize {
        self.raw.address()
    }

    /// Copies `src` into this buffer using this buffer's copy policy.
    ///
    /// With an asynchronous policy the returned event must be waited on
    /// before the data is relied upon; host views of either buffer wait
    /// for it implicitly.
    pub fn copy_from<S2: Space>(&mut self, src: &BufferPtr<T, S2>) -> Result<Event, MemoryError> {
        let job = CopyJob::new(&src.raw.block, src.raw.layout, &self.raw.block, self.raw.layout)?;
        let event = self.raw.policy.submit(job)?;
        self.raw.block.push_fence(event.clone());
        src.raw.block.push_fence(event.clone());
        Ok(event)
    }

    /// Copies this buffer into `dst` using this buffer's copy policy.
    pub fn copy_to<S2: Space>(&self, dst: &mut BufferPtr<T, S2>) -> Result<Event, MemoryError> {
        let job = CopyJob::new(&self.raw.block, self.raw.layout, &dst.raw.block, dst.raw.layout)?;
        let event = self.raw.policy.submit(job)?;
        self.raw.block.push_fence(event.clone());
        dst.raw.block.push_fence(event.clone());
        Ok(event)
    }

    /// Waits for every transfer touching this buffer, reporting the first
    /// failure.
    pub fn synchronize(&self) -> Result<(), MemoryError> {
        self.raw.block.synchronize()
    }
}

impl<T: Element> BufferPtr<T, Host> {
    /// The whole allocation as elements, row padding included.
    ///
    /// Waits for pending transfers into this buffer first.
    pub fn as_slice(&self) -> &[T] {
        self.raw.block.settle();
        let len = self.size_bytes() / std::mem::size_of::<T>();
        // SAFETY: the block holds at least `size_bytes` zero-initialised,
        // suitably aligned bytes, every bit pattern is a valid `T`, and
        // writers need `&mut self`.
        unsafe { std::slice::from_raw_parts(self.raw.block.as_ptr() as *const T, len) }
    }

    /// Mutable view of the whole allocation, row padding included.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.raw.block.settle();
        let len = self.size_bytes() / std::mem::size_of::<T>();
        // SAFETY: as for `as_slice`; `&mut self` makes the view exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.raw.block.as_ptr() as *mut T, len) }
    }

    /// The `width` elements of row `y` in slice `z`.
    ///
    /// # Panics
    /// Panics if `y >= height` or `z >= depth`.
    pub fn row(&self, y: usize, z: usize) -> &[T] {
        let start = self.row_start(y, z);
        let width = self.width();
        &self.as_slice()[start..start + width]
    }

    /// Mutable access to row `y` of slice `z`.
    ///
    /// # Panics
    /// Panics if `y >= height` or `z >= depth`.
    pub fn row_mut(&mut self, y: usize, z: usize) -> &mut [T] {
        let start = self.row_start(y, z);
        let width = self.width();
        &mut self.as_mut_slice()[start..start + width]
    }

    fn row_start(&self, y: usize, z: usize) -> usize {
        let extent = self.extent();
        assert!(
            y < extent.height() && z < extent.depth(),
            "row ({y}, {z}) out of bounds for {extent}"
        );
        self.layout().row_offset(y, z) / std::mem::size_of::<T>()
    }

    /// Copies the logical elements out, dropping row padding.
    pub fn to_vec(&self) -> Vec<T> {
        let extent = self.extent();
        let mut out = Vec::with_capacity(extent.num_elements());
        for z in 0..extent.depth() {
            for y in 0..extent.height() {
                out.extend_from_slice(self.row(y, z));
            }
        }
        out
    }

    /// Writes densely packed elements into the buffer, row by row.
    pub fn write_packed(&mut self, data: &[T]) -> Result<(), MemoryError> {
        let extent = self.extent();
        if data.len() != extent.num_elements() {
            return Err(MemoryError::ShapeMismatch {
                expected: format!("{} elements ({extent})", extent.num_elements()),
                actual: format!("{} elements", data.len()),
            });
        }
        let width = extent.width();
        for (i, chunk) in data.chunks_exact(width).enumerate() {
            let (y, z) = (i % extent.height(), i / extent.height());
            self.row_mut(y, z).copy_from_slice(chunk);
        }
        Ok(())
    }

    /// Sets every logical element to `value`.
    pub fn fill(&mut self, value: T) {
        let extent = self.extent();
        for z in 0..extent.depth() {
            for y in 0..extent.height() {
                self.row_mut(y, z).fill(value);
            }
        }
    }
}

impl<T: Element, S: Space> fmt::Debug for BufferPtr<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPtr")
            .field("space", &S::SPACE)
            .field("dtype", &T::DTYPE)
            .field("extent", &self.extent())
            .field("pitch", &self.pitch())
            .field("mode", &self.copy_mode())
            .finish()
    }
}
