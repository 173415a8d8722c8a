// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright © 2023 Adrian <adrian.eddy at gmail>

#[cfg(target_os = "linux")] pub(crate) mod ion;
#[cfg(target_os = "linux")] pub(crate) mod memfd;
#[cfg(test)]                pub(crate) mod mock;

#[cfg(target_os = "linux")] pub use ion::IonAllocator;
#[cfg(target_os = "linux")] pub use memfd::MemfdAllocator;

use crate::types::HwFrameError;

/// One exported hardware memory region: the allocator-local handle plus the
/// file descriptor other subsystems (decoder, display, GPU) consume.
///
/// Created only by a backend and destroyed only by handing it back to
/// `AllocatorInterface::free`; the allocation lifetime is independent of any
/// consumer reference counting layered on top.
#[derive(Debug)]
pub struct Allocation {
    pub(crate) handle: i32,
    pub(crate) fd: i32,
    pub(crate) len: usize,
}

impl Allocation {
    pub fn fd(&self) -> i32 { self.fd }
    pub fn len(&self) -> usize { self.len }
}

#[enum_dispatch::enum_dispatch(AllocatorBackend)]
pub trait AllocatorInterface {
    /// Reserve `len` bytes of shareable memory and export it.
    ///
    /// Failures are recoverable, the caller may retry on a later frame.
    fn allocate(&mut self, len: usize) -> Result<Allocation, HwFrameError>;

    /// Release an allocation. Failures are logged, never propagated, so
    /// teardown paths stay infallible.
    fn free(&mut self, allocation: Allocation);
}

#[enum_dispatch::enum_dispatch]
pub enum AllocatorBackend {
    Unavailable(NullAllocator),
    #[cfg(target_os = "linux")]
    Ion(ion::IonAllocator),
    #[cfg(target_os = "linux")]
    Memfd(memfd::MemfdAllocator),
    #[cfg(test)]
    Mock(mock::MockAllocator),
}

/// Fails every request. Stands in when no hardware heap could be opened and
/// the caller did not supply a fallback.
pub struct NullAllocator;

impl AllocatorInterface for NullAllocator {
    fn allocate(&mut self, len: usize) -> Result<Allocation, HwFrameError> {
        Err(HwFrameError::ResourceExhausted {
            len,
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        })
    }

    fn free(&mut self, _allocation: Allocation) {
        // nothing we handed out could be valid
        log::warn!("{}", crate::types::HwFrameError::HandleInvalid);
    }
}
