// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright © 2023 Adrian <adrian.eddy at gmail>

use crate::allocator::AllocatorBackend;
use crate::buffer::VideoBuffer;
use crate::types::{HwFrameError, PixelFormat, MAX_PLANES};

use std::ptr::NonNull;
use std::sync::Arc;
use parking_lot::Mutex;

struct PoolState {
    allocator: AllocatorBackend,

    format: PixelFormat,
    size: usize,
    configured: bool,

    buffers: Vec<VideoBuffer>,
    // Indices of slots currently free. Pop order is unspecified.
    free: Vec<usize>,
    in_flight: usize,
    // Set by a forced teardown while handles are still outstanding; returned
    // slots are then freed instead of recycled, and the collection empties
    // once the last handle drops.
    draining: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn return_slot(&self, id: usize) {
        let mut state = self.state.lock();
        let PoolState { buffers, allocator, .. } = &mut *state;
        if let Some(slot) = buffers.get_mut(id) {
            slot.free(allocator);
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.draining {
            if state.in_flight == 0 {
                state.buffers.clear();
                state.free.clear();
            }
        } else {
            state.free.push(id);
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Free all buffers before the allocator backend (and with it the
        // device session) goes away.
        let state = self.state.get_mut();
        let PoolState { buffers, allocator, .. } = state;
        for slot in buffers.iter_mut() {
            slot.free(allocator);
        }
    }
}

/// Pool of recyclable hardware frame buffers, one (format, size)
/// configuration at a time.
///
/// All operations take one pool-wide lock for their whole duration,
/// allocator syscalls included. Buffer churn is per-frame, so the coarse
/// lock is deliberate.
#[derive(Clone)]
pub struct VideoBufferPool {
    inner: Arc<PoolInner>,
}

impl VideoBufferPool {
    pub fn new(allocator: AllocatorBackend) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    allocator,
                    format: PixelFormat::Unknown,
                    size: 0,
                    configured: false,
                    buffers: Vec::new(),
                    free: Vec::new(),
                    in_flight: 0,
                    draining: false,
                }),
            }),
        }
    }

    /// Set (or overwrite) the accepted configuration. Must be called before
    /// the first `get`.
    pub fn configure(&self, format: PixelFormat, size: usize) {
        let mut state = self.inner.state.lock();
        state.format = format;
        state.size = size;
        state.configured = true;
    }

    pub fn is_configured(&self) -> bool {
        self.inner.state.lock().configured
    }

    /// Exact match on both fields. A mismatch means the caller needs a new
    /// pool rather than this one.
    pub fn is_compatible(&self, format: PixelFormat, size: usize) -> bool {
        let state = self.inner.state.lock();
        state.format == format && state.size == size
    }

    /// Hand out a free buffer, growing the pool by one slot when none is
    /// free. The slot's backing storage is allocated here, lazily; if the
    /// allocator is exhausted the handle is still returned and the failure
    /// shows up as `map_memory()` returning `None`, so callers retry on a
    /// later frame.
    pub fn get(&self) -> Result<PooledBuffer, HwFrameError> {
        let mut state = self.inner.state.lock();
        if !state.configured {
            return Err(HwFrameError::PoolNotConfigured);
        }
        // a get after a forced teardown resumes normal recycling
        state.draining = false;

        let id = match state.free.pop() {
            Some(id) => id,
            None => {
                let id = state.buffers.len();
                state.buffers.push(VideoBuffer::new(id));
                id
            }
        };

        let size = state.size;
        let format = state.format;
        let PoolState { buffers, allocator, .. } = &mut *state;
        let slot = &mut buffers[id];
        slot.set_format(format);
        if let Err(e) = slot.allocate(allocator, size) {
            log::error!("Failed to allocate backing storage for buffer {id}: {e}");
        }

        state.in_flight += 1;
        drop(state);

        Ok(PooledBuffer {
            shared: Arc::new(HandleShared { pool: self.inner.clone(), id }),
        })
    }

    /// Forced teardown, invoked by the owning buffer manager.
    ///
    /// Frees every slot without outstanding handles immediately. Slots still
    /// referenced are torn down when their last handle drops; until then the
    /// collection keeps them alive so no handle ever dangles. Does not touch
    /// the configured flag.
    pub fn released(&self) {
        let mut state = self.inner.state.lock();
        log::debug!("Buffer pool released ({} in flight)", state.in_flight);
        if state.in_flight == 0 {
            let PoolState { buffers, allocator, .. } = &mut *state;
            for slot in buffers.iter_mut() {
                slot.free(allocator);
            }
            state.buffers.clear();
            state.free.clear();
            state.draining = false;
        } else {
            log::warn!("Buffer pool released with {} buffers still referenced, deferring their teardown", state.in_flight);
            state.free.clear();
            state.draining = true;
        }
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> usize { self.inner.state.lock().free.len() }
    #[cfg(test)]
    pub(crate) fn buffer_count(&self) -> usize { self.inner.state.lock().buffers.len() }
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize { self.inner.state.lock().in_flight }
    #[cfg(test)]
    pub(crate) fn free_indices(&self) -> Vec<usize> { self.inner.state.lock().free.clone() }
    #[cfg(test)]
    pub(crate) fn with_mock<R>(&self, f: impl FnOnce(&mut crate::allocator::mock::MockAllocator) -> R) -> R {
        match &mut self.inner.state.lock().allocator {
            AllocatorBackend::Mock(mock) => f(mock),
            _ => panic!("pool is not backed by the mock allocator"),
        }
    }
}

struct HandleShared {
    pool: Arc<PoolInner>,
    id: usize,
}

impl Drop for HandleShared {
    fn drop(&mut self) {
        self.pool.return_slot(self.id);
    }
}

/// Reference-counted lease on one pool slot.
///
/// `clone` acquires another reference (decoder and renderer may hold the
/// same buffer concurrently), dropping the last one frees the backing
/// storage and recycles the slot. Accessors go through the pool lock; the
/// pointer returned by `map_memory` stays valid for as long as any handle to
/// this slot is alive.
#[derive(Clone)]
pub struct PooledBuffer {
    shared: Arc<HandleShared>,
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl PooledBuffer {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Take an additional reference. Same as `clone`, named for call sites
    /// that hand the buffer to a second holder.
    pub fn acquire(&self) -> PooledBuffer {
        self.clone()
    }

    /// Drop this reference explicitly.
    pub fn release(self) { }

    fn with_slot<R>(&self, f: impl FnOnce(&mut VideoBuffer) -> R) -> Option<R> {
        let mut state = self.shared.pool.state.lock();
        state.buffers.get_mut(self.shared.id).map(f)
    }

    pub fn map_memory(&self) -> Option<NonNull<u8>> {
        self.with_slot(|slot| slot.map_memory()).flatten()
    }

    pub fn capacity(&self) -> usize {
        self.with_slot(|slot| slot.capacity()).unwrap_or(0)
    }

    pub fn width(&self) -> u32 {
        self.with_slot(|slot| slot.width()).unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.with_slot(|slot| slot.height()).unwrap_or(0)
    }

    pub fn format(&self) -> PixelFormat {
        self.with_slot(|slot| slot.format()).unwrap_or(PixelFormat::Unknown)
    }

    pub fn set_dimensions(&self, width: u32, height: u32, strides: [usize; MAX_PLANES]) {
        self.with_slot(|slot| slot.set_dimensions(width, height, strides));
    }

    pub fn set_dimensions_with_offsets(&self, width: u32, height: u32, strides: [usize; MAX_PLANES], plane_offsets: [usize; MAX_PLANES]) {
        self.with_slot(|slot| slot.set_dimensions_with_offsets(width, height, strides, plane_offsets));
    }

    pub fn strides(&self) -> [usize; MAX_PLANES] {
        self.with_slot(|slot| slot.strides()).unwrap_or([0; MAX_PLANES])
    }

    pub fn plane_offset(&self, plane: usize) -> usize {
        self.with_slot(|slot| slot.plane_offset(plane)).unwrap_or(0)
    }

    pub fn file_descriptor(&self, plane: usize) -> i32 {
        self.with_slot(|slot| slot.file_descriptor(plane)).unwrap_or(-1)
    }
}
