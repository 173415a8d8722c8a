// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright © 2023 Adrian <adrian.eddy at gmail>

mod bridge;
pub use bridge::*;

use crate::types::{BufferInfo, StreamFormat};

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};

/// Operations the bridge issues against the external hardware decoder.
///
/// Completion is asynchronous: the decoder answers by posting
/// `DecoderEvent`s into the bridge's `EventQueue`, possibly from a different
/// thread than the one that made the request.
pub trait HardwareDecoder: Send + Sync {
    /// Submit one encoded unit into the input slot the decoder reported.
    fn queue_input(&self, index: usize, data: &[u8], presentation_time_us: i64, flags: u32) -> Result<(), crate::types::HwFrameError>;

    /// Tell the decoder its output slot may be reused. `render` asks the
    /// decoder to also present the frame on its surface.
    fn release_output(&self, index: usize, render: bool);

    /// Discard everything queued inside the decoder.
    fn flush(&self);

    fn stop(&self);
}

/// One decoder notification. Indices are opaque and local to the decoder
/// instance that reported them.
#[derive(Debug, Clone)]
pub enum DecoderEvent {
    Error,
    InputAvailable(usize),
    OutputAvailable(usize, BufferInfo),
    FormatChanged(StreamFormat),
}

/// Thread-safe FIFO the decoder's notification thread posts into and the
/// bridge drains on its own thread, so notification delivery never re-enters
/// bridge or pool state.
#[derive(Default)]
pub struct EventQueue {
    queue: Mutex<VecDeque<DecoderEvent>>,
    cond: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, event: DecoderEvent) {
        self.queue.lock().push_back(event);
        self.cond.notify_one();
    }

    pub fn try_next(&self) -> Option<DecoderEvent> {
        self.queue.lock().pop_front()
    }

    /// Wait up to `timeout` for the next event.
    pub fn next_timeout(&self, timeout: Duration) -> Option<DecoderEvent> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
            if self.cond.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn events_come_out_in_post_order() {
        let queue = EventQueue::new();
        queue.post(DecoderEvent::InputAvailable(1));
        queue.post(DecoderEvent::InputAvailable(2));
        assert_eq!(queue.len(), 2);

        assert!(matches!(queue.try_next(), Some(DecoderEvent::InputAvailable(1))));
        assert!(matches!(queue.try_next(), Some(DecoderEvent::InputAvailable(2))));
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn next_timeout_expires_on_an_empty_queue() {
        let queue = EventQueue::new();
        let started = Instant::now();
        assert!(queue.next_timeout(Duration::from_millis(10)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn next_timeout_wakes_on_a_cross_thread_post() {
        let queue = Arc::new(EventQueue::new());

        let poster = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poster.post(DecoderEvent::Error);
        });

        let event = queue.next_timeout(Duration::from_secs(5));
        assert!(matches!(event, Some(DecoderEvent::Error)));
        handle.join().unwrap();
    }

    #[test]
    fn clear_discards_pending_events() {
        let queue = EventQueue::new();
        queue.post(DecoderEvent::InputAvailable(0));
        queue.clear();
        assert!(queue.is_empty());
    }
}
