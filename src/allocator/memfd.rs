// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright © 2023 Adrian <adrian.eddy at gmail>

use super::{Allocation, AllocatorInterface};
use crate::types::HwFrameError;

/// Anonymous shared-memory allocator backed by `memfd_create`.
///
/// Not hardware-reserved memory, but the descriptors are mappable and
/// shareable like any dma-buf, which makes this the fallback path when the
/// ION device is absent.
#[derive(Default)]
pub struct MemfdAllocator;

impl MemfdAllocator {
    pub fn new() -> Self { Self }
}

impl AllocatorInterface for MemfdAllocator {
    fn allocate(&mut self, len: usize) -> Result<Allocation, HwFrameError> {
        let fd = unsafe { libc::memfd_create(c"hwframe".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            let source = std::io::Error::last_os_error();
            log::error!("memfd_create failed: {source}");
            return Err(HwFrameError::ResourceExhausted { len, source });
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
            let source = std::io::Error::last_os_error();
            log::error!("ftruncate to {len} bytes failed: {source}");
            unsafe { libc::close(fd) };
            return Err(HwFrameError::ResourceExhausted { len, source });
        }
        // no separate allocator-local handle here, the fd is the handle
        Ok(Allocation { handle: fd, fd, len })
    }

    fn free(&mut self, allocation: Allocation) {
        if allocation.fd >= 0 {
            unsafe { libc::close(allocation.fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free() {
        let mut allocator = MemfdAllocator::new();
        let allocation = allocator.allocate(4096).unwrap();
        assert!(allocation.fd() >= 0);
        assert_eq!(allocation.len(), 4096);
        allocator.free(allocation);
    }
}
