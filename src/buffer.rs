// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright © 2023 Adrian <adrian.eddy at gmail>

use crate::allocator::{Allocation, AllocatorBackend, AllocatorInterface};
use crate::types::{HwFrameError, PixelFormat, MAX_PLANES};

use std::ptr::NonNull;

/// One hardware-backed frame slot, owned by its pool for the pool's whole
/// lifetime and lent out through reference-counted handles.
///
/// A slot is either fully allocated (backing allocation present, capacity
/// defined) or fully released (no allocation, no mapping, capacity 0); the
/// allocate/free pair below are the only mutators of that state.
pub struct VideoBuffer {
    id: usize,
    allocation: Option<Allocation>,
    mapped: Option<(NonNull<u8>, usize)>,
    format: PixelFormat,
    width: u32,
    height: u32,
    strides: [usize; MAX_PLANES],
    plane_offsets: [usize; MAX_PLANES],
}

// The cached mapping is private to the slot and only reachable through the
// pool's lock, never aliased across threads.
unsafe impl Send for VideoBuffer { }

impl VideoBuffer {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            allocation: None,
            mapped: None,
            format: PixelFormat::Unknown,
            width: 0,
            height: 0,
            strides: [0; MAX_PLANES],
            plane_offsets: [0; MAX_PLANES],
        }
    }

    pub fn id(&self) -> usize { self.id }
    pub fn width(&self) -> u32 { self.width }
    pub fn height(&self) -> u32 { self.height }
    pub fn format(&self) -> PixelFormat { self.format }

    pub fn capacity(&self) -> usize {
        self.allocation.as_ref().map_or(0, |a| a.len())
    }

    pub(crate) fn set_format(&mut self, format: PixelFormat) {
        self.format = format;
    }

    /// Ensure the slot holds `size` bytes of backing storage.
    ///
    /// Re-allocating with the unchanged size is a cheap success; this is what
    /// keeps steady-state decoding of equal-resolution frames free of
    /// allocator churn. A different size frees the old backing store first.
    /// On failure the slot is left fully released.
    pub(crate) fn allocate(&mut self, allocator: &mut AllocatorBackend, size: usize) -> Result<(), HwFrameError> {
        if let Some(allocation) = &self.allocation {
            if allocation.len() == size {
                return Ok(());
            }
            self.free(allocator);
        }
        self.allocation = Some(allocator.allocate(size)?);
        Ok(())
    }

    /// Unmap (if mapped) and return the backing storage to the allocator.
    /// Safe to call on an already-free slot.
    pub(crate) fn free(&mut self, allocator: &mut AllocatorBackend) {
        let Some(allocation) = self.allocation.take() else { return };
        if let Some((ptr, len)) = self.mapped.take() {
            unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
        }
        allocator.free(allocation);
    }

    /// Map the exported descriptor into process memory, lazily, caching the
    /// mapping until the backing storage is freed. `None` when the slot is
    /// unallocated or the mapping fails.
    pub fn map_memory(&mut self) -> Option<NonNull<u8>> {
        let allocation = self.allocation.as_ref()?;
        if allocation.fd() < 0 || allocation.len() == 0 {
            return None;
        }
        if self.mapped.is_none() {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    allocation.len(),
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    allocation.fd(),
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                log::error!("mmap of {} bytes failed: {}", allocation.len(), std::io::Error::last_os_error());
                return None;
            }
            self.mapped = Some((NonNull::new(ptr.cast())?, allocation.len()));
        }
        self.mapped.map(|(ptr, _)| ptr)
    }

    /// Record the planar layout. Does not touch backing storage.
    pub fn set_dimensions(&mut self, width: u32, height: u32, strides: [usize; MAX_PLANES]) {
        self.width = width;
        self.height = height;
        self.strides = strides;
    }

    pub fn set_dimensions_with_offsets(&mut self, width: u32, height: u32, strides: [usize; MAX_PLANES], plane_offsets: [usize; MAX_PLANES]) {
        self.set_dimensions(width, height, strides);
        self.plane_offsets = plane_offsets;
    }

    pub fn strides(&self) -> [usize; MAX_PLANES] {
        self.strides
    }

    pub fn plane_offset(&self, plane: usize) -> usize {
        self.plane_offsets[plane]
    }

    /// All planes share the single backing descriptor; -1 when unallocated.
    pub fn file_descriptor(&self, _plane: usize) -> i32 {
        self.allocation.as_ref().map_or(-1, |a| a.fd())
    }
}
