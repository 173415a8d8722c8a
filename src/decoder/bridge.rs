// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright © 2023 Adrian <adrian.eddy at gmail>

use super::{DecoderEvent, EventQueue, HardwareDecoder};
use crate::buffer_pool::{PooledBuffer, VideoBufferPool};
use crate::manager::VideoBufferManager;
use crate::types::{BufferInfo, HwFrameError, StreamFormat};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Closed,
    Configuring,
    Streaming,
    Flushing,
}

/// Stream parameters known before the decoder has parsed anything.
#[derive(Debug, Clone, Default)]
pub struct StreamHints {
    pub codec: String,
    pub width: u32,
    pub height: u32,
}

struct PendingInput {
    data: Vec<u8>,
    presentation_time_us: i64,
    flags: u32,
}

/// Bridges a callback-driven hardware decoder to the buffer pool model.
///
/// Decoder notifications arrive through the `EventQueue` from any thread;
/// bridge state is only ever mutated by the thread calling
/// `process_events`/`poll_frame`, so no lock spans the bridge itself.
pub struct DecoderBridge {
    decoder: Arc<dyn HardwareDecoder>,
    events: Arc<EventQueue>,
    manager: Arc<VideoBufferManager>,

    state: BridgeState,
    hints: StreamHints,
    format: Option<StreamFormat>,
    pool: Option<VideoBufferPool>,

    // Encoded units waiting for an input slot, and input slots waiting for
    // data. Strictly FIFO on both sides.
    pending_input: VecDeque<PendingInput>,
    input_indices: VecDeque<usize>,

    // Decoded frames not yet collected by the consumer.
    ready: VecDeque<DecodedFrame>,
}

impl DecoderBridge {
    pub fn new(decoder: Arc<dyn HardwareDecoder>, manager: Arc<VideoBufferManager>) -> Self {
        Self {
            decoder,
            events: Arc::new(EventQueue::new()),
            manager,
            state: BridgeState::Closed,
            hints: StreamHints::default(),
            format: None,
            pool: None,
            pending_input: VecDeque::new(),
            input_indices: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    /// The queue decoder callbacks post into.
    pub fn event_queue(&self) -> Arc<EventQueue> {
        self.events.clone()
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Stream parameters the session was opened with.
    pub fn hints(&self) -> &StreamHints {
        &self.hints
    }

    /// Start a decode session. The output pool is negotiated once the
    /// decoder reports its output format.
    pub fn open(&mut self, hints: StreamHints) {
        if self.state != BridgeState::Closed {
            self.close();
        }
        log::debug!("Opening decoder bridge for {} {}x{}", hints.codec, hints.width, hints.height);
        self.hints = hints;
        self.state = BridgeState::Configuring;
    }

    /// Append one encoded unit to the pending-input queue. It is submitted
    /// to the decoder as soon as an input slot is available for it.
    pub fn submit(&mut self, data: &[u8], presentation_time_us: i64) -> Result<(), HwFrameError> {
        if self.state == BridgeState::Closed {
            return Err(HwFrameError::BridgeClosed);
        }
        self.pending_input.push_back(PendingInput {
            data: data.to_vec(),
            presentation_time_us,
            flags: 0,
        });
        self.pair_inputs()
    }

    /// Signal the end of the stream to the decoder through an empty,
    /// flagged input unit.
    pub fn submit_end_of_stream(&mut self) -> Result<(), HwFrameError> {
        if self.state == BridgeState::Closed {
            return Err(HwFrameError::BridgeClosed);
        }
        self.pending_input.push_back(PendingInput {
            data: Vec::new(),
            presentation_time_us: 0,
            flags: crate::types::BUFFER_FLAG_END_OF_STREAM,
        });
        self.pair_inputs()
    }

    /// Drain all pending decoder notifications. Fatal decoder errors close
    /// the bridge and surface as `DecoderFatal`; recovery is a reopen.
    pub fn process_events(&mut self) -> Result<(), HwFrameError> {
        while let Some(event) = self.events.try_next() {
            self.dispatch(event)?;
        }
        Ok(())
    }

    /// Wait up to `timeout` for the next decoded frame, processing decoder
    /// notifications while waiting. `Ok(None)` on timeout.
    pub fn poll_frame(&mut self, timeout: Duration) -> Result<Option<DecodedFrame>, HwFrameError> {
        if self.state == BridgeState::Closed {
            return Err(HwFrameError::BridgeClosed);
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.process_events()?;
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match self.events.next_timeout(deadline - now) {
                Some(event) => self.dispatch(event)?,
                None => return Ok(None),
            }
        }
    }

    /// Discard everything queued on both sides of the decoder. Frames
    /// already delivered to the consumer stay valid until released.
    pub fn flush(&mut self) {
        if self.state == BridgeState::Closed {
            return;
        }
        log::debug!("Flushing decoder bridge");
        if self.state == BridgeState::Streaming {
            self.state = BridgeState::Flushing;
        }

        self.events.clear();
        self.pending_input.clear();
        self.input_indices.clear();
        for frame in self.ready.drain(..) {
            frame.release(false);
        }
        self.decoder.flush();

        if self.state == BridgeState::Flushing {
            self.state = BridgeState::Streaming;
        }
    }

    pub fn close(&mut self) {
        if self.state == BridgeState::Closed {
            return;
        }
        log::debug!("Closing decoder bridge");
        self.teardown();
    }

    fn teardown(&mut self) {
        self.events.clear();
        self.pending_input.clear();
        self.input_indices.clear();
        for frame in self.ready.drain(..) {
            frame.release(false);
        }
        self.decoder.stop();
        if let Some(pool) = self.pool.take() {
            pool.released();
        }
        self.format = None;
        self.state = BridgeState::Closed;
    }

    fn dispatch(&mut self, event: DecoderEvent) -> Result<(), HwFrameError> {
        match event {
            DecoderEvent::Error => {
                log::error!("Decoder reported a fatal error, closing the bridge");
                self.teardown();
                Err(HwFrameError::DecoderFatal)
            }
            DecoderEvent::InputAvailable(index) => {
                if self.state == BridgeState::Closed {
                    return Ok(());
                }
                self.input_indices.push_back(index);
                self.pair_inputs()
            }
            DecoderEvent::OutputAvailable(index, info) => self.handle_output(index, info),
            DecoderEvent::FormatChanged(format) => self.configure_output(format),
        }
    }

    /// Submit pending encoded units into reported input slots, oldest to
    /// oldest. An index with no pending data simply stays parked.
    fn pair_inputs(&mut self) -> Result<(), HwFrameError> {
        while !self.input_indices.is_empty() && !self.pending_input.is_empty() {
            let (Some(index), Some(input)) = (self.input_indices.pop_front(), self.pending_input.pop_front()) else { break };
            if let Err(e) = self.decoder.queue_input(index, &input.data, input.presentation_time_us, input.flags) {
                log::error!("Failed to queue input at index {index}: {e}");
                self.teardown();
                return Err(HwFrameError::DecoderFatal);
            }
        }
        Ok(())
    }

    fn configure_output(&mut self, format: StreamFormat) -> Result<(), HwFrameError> {
        if self.state == BridgeState::Closed {
            return Ok(());
        }
        let size = format.frame_size();
        if size == 0 {
            log::error!("Decoder reported an unusable output format: {format:?}");
            self.teardown();
            return Err(HwFrameError::DecoderFatal);
        }
        let Some(pool) = self.manager.get(format.color_format, size) else {
            log::error!("No buffer pool available for {:?} ({size} bytes)", format.color_format);
            self.teardown();
            return Err(HwFrameError::DecoderFatal);
        };
        log::debug!("Decoder output format: {:?} {}x{} stride {}", format.color_format, format.width, format.height, format.stride);
        self.pool = Some(pool);
        self.format = Some(format);
        if self.state == BridgeState::Configuring {
            self.state = BridgeState::Streaming;
        }
        Ok(())
    }

    fn handle_output(&mut self, index: usize, info: BufferInfo) -> Result<(), HwFrameError> {
        if self.state != BridgeState::Streaming {
            // stale or premature; give the slot straight back
            log::warn!("Output buffer {index} reported in state {:?}, recycling it", self.state);
            self.decoder.release_output(index, false);
            return Ok(());
        }
        if info.is_end_of_stream() {
            log::debug!("Decoder signalled end of stream at index {index}");
            self.decoder.release_output(index, false);
            return Ok(());
        }
        let Some(pool) = &self.pool else {
            log::warn!("Output buffer {index} reported before any pool was negotiated");
            self.decoder.release_output(index, false);
            return Ok(());
        };
        match pool.get() {
            Ok(buffer) => {
                if let Some(format) = &self.format {
                    let (strides, offsets) = format.plane_layout();
                    buffer.set_dimensions_with_offsets(format.width, format.height, strides, offsets);
                }
                self.ready.push_back(DecodedFrame {
                    index,
                    presentation_time_us: info.presentation_time_us,
                    decoder: self.decoder.clone(),
                    released: false,
                    buffer,
                });
            }
            Err(e) => {
                log::error!("No pool buffer for output index {index}: {e}");
                self.decoder.release_output(index, false);
            }
        }
        Ok(())
    }
}

impl Drop for DecoderBridge {
    fn drop(&mut self) {
        if self.state != BridgeState::Closed {
            self.teardown();
        }
    }
}

/// One decoded frame, holding a pool buffer reference and the decoder's
/// output slot. Releasing it synchronizes the two notions of "free": the
/// decoder is told its index may be reused, and the pool reference drops.
pub struct DecodedFrame {
    index: usize,
    presentation_time_us: i64,
    decoder: Arc<dyn HardwareDecoder>,
    released: bool,
    buffer: PooledBuffer,
}

impl DecodedFrame {
    pub fn buffer(&self) -> &PooledBuffer {
        &self.buffer
    }

    pub fn presentation_time_us(&self) -> i64 {
        self.presentation_time_us
    }

    /// The decoder's native output slot backing this frame. Only meaningful
    /// to the decoder instance that produced it.
    pub fn decoder_index(&self) -> usize {
        self.index
    }

    /// Hand the output slot back to the decoder, optionally rendering it to
    /// the decoder's surface on the way out.
    pub fn release(mut self, render: bool) {
        self.notify_decoder(render);
    }

    fn notify_decoder(&mut self, render: bool) {
        if !self.released {
            self.released = true;
            self.decoder.release_output(self.index, render);
        }
    }
}

impl Drop for DecodedFrame {
    fn drop(&mut self) {
        self.notify_decoder(false);
    }
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("index", &self.index)
            .field("presentation_time_us", &self.presentation_time_us)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{mock::MockAllocator, AllocatorBackend};
    use crate::types::{PixelFormat, BUFFER_FLAG_END_OF_STREAM};
    use parking_lot::Mutex;

    const FORMAT_1080P: StreamFormat = StreamFormat {
        width: 1920,
        height: 1080,
        color_format: PixelFormat::YUV420P,
        stride: 1920,
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        QueueInput { index: usize, len: usize, presentation_time_us: i64, flags: u32 },
        ReleaseOutput { index: usize, render: bool },
        Flush,
        Stop,
    }

    #[derive(Default)]
    struct MockDecoder {
        calls: Mutex<Vec<Call>>,
        fail_queue_input: Mutex<bool>,
    }

    impl MockDecoder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    impl HardwareDecoder for MockDecoder {
        fn queue_input(&self, index: usize, data: &[u8], presentation_time_us: i64, flags: u32) -> Result<(), HwFrameError> {
            if *self.fail_queue_input.lock() {
                return Err(HwFrameError::DecoderFatal);
            }
            self.calls.lock().push(Call::QueueInput { index, len: data.len(), presentation_time_us, flags });
            Ok(())
        }

        fn release_output(&self, index: usize, render: bool) {
            self.calls.lock().push(Call::ReleaseOutput { index, render });
        }

        fn flush(&self) {
            self.calls.lock().push(Call::Flush);
        }

        fn stop(&self) {
            self.calls.lock().push(Call::Stop);
        }
    }

    fn streaming_bridge() -> (DecoderBridge, Arc<MockDecoder>, VideoBufferPool) {
        let decoder = Arc::new(MockDecoder::default());
        let manager = Arc::new(VideoBufferManager::new());
        let pool = VideoBufferPool::new(AllocatorBackend::from(MockAllocator::new()));
        manager.register_pool(pool.clone());

        let mut bridge = DecoderBridge::new(decoder.clone(), manager);
        bridge.open(StreamHints { codec: "h264".into(), width: 1920, height: 1080 });
        assert_eq!(bridge.state(), BridgeState::Configuring);

        bridge.event_queue().post(DecoderEvent::FormatChanged(FORMAT_1080P));
        bridge.process_events().unwrap();
        assert_eq!(bridge.state(), BridgeState::Streaming);

        (bridge, decoder, pool)
    }

    #[test]
    fn format_change_negotiates_the_pool() {
        let (_bridge, _decoder, pool) = streaming_bridge();
        assert!(pool.is_configured());
        assert!(pool.is_compatible(PixelFormat::YUV420P, FORMAT_1080P.frame_size()));
    }

    #[test]
    fn input_pairing_is_strictly_fifo() {
        let (mut bridge, decoder, _pool) = streaming_bridge();

        bridge.submit(&[1, 2, 3], 1000).unwrap();
        bridge.submit(&[4, 5], 2000).unwrap();
        assert!(decoder.calls().is_empty(), "no input slot reported yet");

        bridge.event_queue().post(DecoderEvent::InputAvailable(5));
        bridge.event_queue().post(DecoderEvent::InputAvailable(9));
        bridge.process_events().unwrap();

        assert_eq!(decoder.calls(), vec![
            Call::QueueInput { index: 5, len: 3, presentation_time_us: 1000, flags: 0 },
            Call::QueueInput { index: 9, len: 2, presentation_time_us: 2000, flags: 0 },
        ]);
    }

    #[test]
    fn an_idle_input_index_waits_for_data() {
        let (mut bridge, decoder, _pool) = streaming_bridge();

        bridge.event_queue().post(DecoderEvent::InputAvailable(3));
        bridge.process_events().unwrap();
        assert!(decoder.calls().is_empty());

        bridge.submit(&[7; 16], 500).unwrap();
        assert_eq!(decoder.calls(), vec![
            Call::QueueInput { index: 3, len: 16, presentation_time_us: 500, flags: 0 },
        ]);
    }

    #[test]
    fn end_of_stream_submission_is_flagged() {
        let (mut bridge, decoder, _pool) = streaming_bridge();

        bridge.event_queue().post(DecoderEvent::InputAvailable(0));
        bridge.process_events().unwrap();
        bridge.submit_end_of_stream().unwrap();

        assert_eq!(decoder.calls(), vec![
            Call::QueueInput { index: 0, len: 0, presentation_time_us: 0, flags: BUFFER_FLAG_END_OF_STREAM },
        ]);
    }

    #[test]
    fn output_buffer_becomes_a_consumer_frame() {
        let (mut bridge, decoder, pool) = streaming_bridge();

        let info = BufferInfo { presentation_time_us: 40000, size: 100, ..Default::default() };
        bridge.event_queue().post(DecoderEvent::OutputAvailable(7, info));

        let frame = bridge.poll_frame(Duration::from_millis(100)).unwrap().expect("a frame is ready");
        assert_eq!(frame.presentation_time_us(), 40000);
        assert_eq!(frame.decoder_index(), 7);
        assert_eq!(frame.buffer().width(), 1920);
        assert_eq!(frame.buffer().strides(), [1920, 960, 960, 0]);
        assert_eq!(frame.buffer().plane_offset(1), 1920 * 1080);
        assert_eq!(pool.in_flight(), 1);

        frame.release(true);
        assert_eq!(decoder.calls().last(), Some(&Call::ReleaseOutput { index: 7, render: true }));
        assert_eq!(pool.in_flight(), 0, "pool slot recycled with the decoder slot");
    }

    #[test]
    fn dropping_a_frame_releases_without_rendering() {
        let (mut bridge, decoder, _pool) = streaming_bridge();

        bridge.event_queue().post(DecoderEvent::OutputAvailable(2, BufferInfo::default()));
        let frame = bridge.poll_frame(Duration::from_millis(100)).unwrap().unwrap();
        drop(frame);

        assert_eq!(decoder.calls().last(), Some(&Call::ReleaseOutput { index: 2, render: false }));
    }

    #[test]
    fn end_of_stream_output_is_recycled_not_surfaced() {
        let (mut bridge, decoder, _pool) = streaming_bridge();

        let info = BufferInfo { flags: BUFFER_FLAG_END_OF_STREAM, ..Default::default() };
        bridge.event_queue().post(DecoderEvent::OutputAvailable(4, info));

        assert!(bridge.poll_frame(Duration::from_millis(10)).unwrap().is_none());
        assert_eq!(decoder.calls(), vec![Call::ReleaseOutput { index: 4, render: false }]);
    }

    #[test]
    fn output_before_format_negotiation_is_returned() {
        let decoder = Arc::new(MockDecoder::default());
        let manager = Arc::new(VideoBufferManager::new());
        manager.register_pool(VideoBufferPool::new(AllocatorBackend::from(MockAllocator::new())));
        let mut bridge = DecoderBridge::new(decoder.clone(), manager);
        bridge.open(StreamHints::default());

        bridge.event_queue().post(DecoderEvent::OutputAvailable(1, BufferInfo::default()));
        bridge.process_events().unwrap();

        assert_eq!(decoder.calls(), vec![Call::ReleaseOutput { index: 1, render: false }]);
        assert_eq!(bridge.state(), BridgeState::Configuring);
    }

    #[test]
    fn flush_discards_pending_work_but_not_delivered_frames() {
        let (mut bridge, decoder, pool) = streaming_bridge();

        // one frame delivered to the consumer, one still undelivered
        bridge.event_queue().post(DecoderEvent::OutputAvailable(1, BufferInfo::default()));
        bridge.event_queue().post(DecoderEvent::OutputAvailable(2, BufferInfo::default()));
        let delivered = bridge.poll_frame(Duration::from_millis(100)).unwrap().unwrap();
        bridge.submit(&[1, 2, 3], 0).unwrap();

        bridge.flush();
        assert_eq!(bridge.state(), BridgeState::Streaming);
        // the undelivered frame went back to the decoder unrendered
        assert!(decoder.calls().contains(&Call::ReleaseOutput { index: 2, render: false }));
        assert!(decoder.calls().contains(&Call::Flush));

        // pending input is gone: a fresh input slot stays idle
        bridge.event_queue().post(DecoderEvent::InputAvailable(0));
        bridge.process_events().unwrap();
        assert!(!decoder.calls().iter().any(|c| matches!(c, Call::QueueInput { .. })));

        // the delivered frame survived the flush
        assert_eq!(pool.in_flight(), 1);
        delivered.release(true);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn decoder_error_closes_the_bridge() {
        let (mut bridge, decoder, pool) = streaming_bridge();

        bridge.event_queue().post(DecoderEvent::Error);
        assert!(matches!(bridge.process_events(), Err(HwFrameError::DecoderFatal)));

        assert_eq!(bridge.state(), BridgeState::Closed);
        assert!(decoder.calls().contains(&Call::Stop));
        assert_eq!(pool.buffer_count(), 0, "pool was force-released");

        assert!(matches!(bridge.submit(&[0], 0), Err(HwFrameError::BridgeClosed)));
        assert!(matches!(bridge.poll_frame(Duration::ZERO), Err(HwFrameError::BridgeClosed)));
    }

    #[test]
    fn queue_input_failure_is_fatal() {
        let (mut bridge, decoder, _pool) = streaming_bridge();
        *decoder.fail_queue_input.lock() = true;

        bridge.event_queue().post(DecoderEvent::InputAvailable(0));
        bridge.process_events().unwrap();
        assert!(matches!(bridge.submit(&[1], 0), Err(HwFrameError::DecoderFatal)));
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut bridge, decoder, _pool) = streaming_bridge();

        bridge.close();
        bridge.close();
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert_eq!(decoder.calls().iter().filter(|c| **c == Call::Stop).count(), 1);
    }

    #[test]
    fn reopen_after_error_starts_a_fresh_session() {
        let (mut bridge, _decoder, _pool) = streaming_bridge();

        bridge.event_queue().post(DecoderEvent::Error);
        let _ = bridge.process_events();
        assert_eq!(bridge.state(), BridgeState::Closed);

        bridge.open(StreamHints { codec: "hevc".into(), width: 1280, height: 720 });
        assert_eq!(bridge.state(), BridgeState::Configuring);
    }
}
