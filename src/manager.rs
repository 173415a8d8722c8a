use crate::buffer_pool::VideoBufferPool;
use crate::types::PixelFormat;

use parking_lot::Mutex;

/// Registry of buffer pools, owned by the video-pipeline context.
///
/// Pools are registered explicitly at startup and torn down through
/// `release_pools`; there is no process-wide static registration.
#[derive(Default)]
pub struct VideoBufferManager {
    pools: Mutex<Vec<VideoBufferPool>>,
}

impl VideoBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pool(&self, pool: VideoBufferPool) {
        self.pools.lock().push(pool);
    }

    /// Find a pool usable for the given configuration: the first registered
    /// pool that either matches it exactly or has not been configured yet
    /// (in which case it is configured here). `None` means every registered
    /// pool is committed to a different configuration and the caller has to
    /// bring up a new one.
    pub fn get(&self, format: PixelFormat, size: usize) -> Option<VideoBufferPool> {
        let pools = self.pools.lock();
        for pool in pools.iter() {
            if !pool.is_configured() {
                pool.configure(format, size);
                return Some(pool.clone());
            }
            if pool.is_compatible(format, size) {
                return Some(pool.clone());
            }
        }
        None
    }

    /// Teardown boundary: force-release every registered pool and drop the
    /// registrations.
    pub fn release_pools(&self) {
        for pool in self.pools.lock().drain(..) {
            pool.released();
        }
    }
}
