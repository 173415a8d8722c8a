// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright © 2023 Adrian <adrian.eddy at gmail>

use super::{Allocation, AllocatorInterface};
use crate::types::HwFrameError;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

// Kernel ABI of the legacy ION allocator. The request codes are the usual
// _IOWR('I', nr, struct) encoding.

#[repr(C)]
struct IonAllocationData {
    len: usize,
    align: usize,
    heap_id_mask: u32,
    flags: u32,
    handle: i32,
}

#[repr(C)]
struct IonHandleData {
    handle: i32,
}

#[repr(C)]
struct IonFdData {
    handle: i32,
    fd: i32,
}

const ION_IOC_MAGIC: u64 = b'I' as u64;

const fn iowr(nr: u64, size: usize) -> libc::c_ulong {
    const IOC_WRITE: u64 = 1;
    const IOC_READ: u64 = 2;
    (((IOC_READ | IOC_WRITE) << 30) | ((size as u64) << 16) | (ION_IOC_MAGIC << 8) | nr) as libc::c_ulong
}

const ION_IOC_ALLOC: libc::c_ulong = iowr(0, size_of::<IonAllocationData>());
const ION_IOC_FREE:  libc::c_ulong = iowr(1, size_of::<IonHandleData>());
const ION_IOC_SHARE: libc::c_ulong = iowr(4, size_of::<IonFdData>());

const ION_HEAP_TYPE_CARVEOUT: u32 = 2;
const ION_HEAP_CARVEOUT_MASK: u32 = 1 << ION_HEAP_TYPE_CARVEOUT;

/// Allocates physically-contiguous buffers from the carveout heap of
/// `/dev/ion` and exports them as dma-buf file descriptors.
///
/// The device stays open for the allocator's lifetime and is closed exactly
/// once on drop; the owning pool frees all buffers before dropping the
/// backend, so no allocation outlives the device session.
pub struct IonAllocator {
    device: OwnedFd,
}

impl IonAllocator {
    pub fn open() -> Result<Self, HwFrameError> {
        let fd = unsafe { libc::open(c"/dev/ion".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            log::error!("Failed to open /dev/ion: {err}");
            return Err(HwFrameError::DeviceUnavailable(err));
        }
        Ok(Self { device: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    fn free_handle(&self, handle: i32) {
        let mut data = IonHandleData { handle };
        if unsafe { libc::ioctl(self.device.as_raw_fd(), ION_IOC_FREE, &mut data) } < 0 {
            log::error!("ION_IOC_FREE failed: {}", std::io::Error::last_os_error());
        }
    }
}

impl AllocatorInterface for IonAllocator {
    fn allocate(&mut self, len: usize) -> Result<Allocation, HwFrameError> {
        let mut data = IonAllocationData {
            len,
            align: 0,
            heap_id_mask: ION_HEAP_CARVEOUT_MASK,
            flags: 0,
            handle: -1,
        };
        if unsafe { libc::ioctl(self.device.as_raw_fd(), ION_IOC_ALLOC, &mut data) } < 0 {
            let source = std::io::Error::last_os_error();
            log::error!("ION_IOC_ALLOC failed (len = {len}): {source}");
            return Err(HwFrameError::ResourceExhausted { len, source });
        }

        let mut share = IonFdData { handle: data.handle, fd: -1 };
        if unsafe { libc::ioctl(self.device.as_raw_fd(), ION_IOC_SHARE, &mut share) } < 0 {
            let source = std::io::Error::last_os_error();
            log::error!("ION_IOC_SHARE failed: {source}");
            // the fresh handle would leak otherwise
            self.free_handle(data.handle);
            return Err(HwFrameError::ResourceExhausted { len, source });
        }

        Ok(Allocation { handle: data.handle, fd: share.fd, len })
    }

    fn free(&mut self, allocation: Allocation) {
        if allocation.fd >= 0 {
            unsafe { libc::close(allocation.fd) };
        }
        self.free_handle(allocation.handle);
    }
}
