// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright © 2023 Adrian <adrian.eddy at gmail>

use super::{Allocation, AllocatorInterface};
use crate::types::HwFrameError;

use std::collections::HashSet;

/// Pure-bookkeeping allocator for tests. Hands out synthetic negative
/// descriptors that are never passed to the OS, and counts every call so
/// tests can assert how many real allocations a sequence would have cost.
pub struct MockAllocator {
    next_handle: i32,
    live: HashSet<i32>,
    fail_next: usize,
    pub alloc_calls: usize,
    pub free_calls: usize,
}

impl MockAllocator {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            live: HashSet::new(),
            fail_next: 0,
            alloc_calls: 0,
            free_calls: 0,
        }
    }

    /// Make the next `count` allocations fail with `ResourceExhausted`.
    pub fn fail_next(&mut self, count: usize) {
        self.fail_next = count;
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }
}

impl AllocatorInterface for MockAllocator {
    fn allocate(&mut self, len: usize) -> Result<Allocation, HwFrameError> {
        self.alloc_calls += 1;
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(HwFrameError::ResourceExhausted {
                len,
                source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            });
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.live.insert(handle);
        // negative fd so an accidental close()/mmap() can only fail with EBADF
        Ok(Allocation { handle, fd: -1000 - handle, len })
    }

    fn free(&mut self, allocation: Allocation) {
        self.free_calls += 1;
        if !self.live.remove(&allocation.handle) {
            panic!("mock allocator: double free of handle {}", allocation.handle);
        }
    }
}
