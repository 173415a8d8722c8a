// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright © 2023 Adrian <adrian.eddy at gmail>

use thiserror::Error;

/// Planar layout arrays are fixed-size; unused planes stay zero.
pub const MAX_PLANES: usize = 4;

/// Output buffer carries the last unit of the stream.
pub const BUFFER_FLAG_END_OF_STREAM: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Unknown,

    NV12, NV21,
    P010LE,
    YUV420P,
    RGBA,
}

impl PixelFormat {
    /// Bytes needed to hold one `width`×`height` frame in this format.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (width, height) = (width as usize, height as usize);
        match self {
            PixelFormat::NV12 | PixelFormat::NV21 | PixelFormat::YUV420P => width * height * 3 / 2,
            PixelFormat::P010LE => width * height * 3, // 2 bytes per sample, 4:2:0
            PixelFormat::RGBA   => width * height * 4,
            PixelFormat::Unknown => 0,
        }
    }
}

/// Output format reported by the decoder once it has parsed the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub color_format: PixelFormat,
    /// Luma stride in bytes, may be larger than `width`.
    pub stride: usize,
}

impl StreamFormat {
    /// Per-plane strides and byte offsets for a frame laid out in one
    /// contiguous buffer.
    pub fn plane_layout(&self) -> ([usize; MAX_PLANES], [usize; MAX_PLANES]) {
        let s = self.stride;
        let h = self.height as usize;
        match self.color_format {
            PixelFormat::YUV420P => (
                [s, s / 2, s / 2, 0],
                [0, s * h, s * h + (s / 2) * (h / 2), 0],
            ),
            // interleaved chroma plane
            PixelFormat::NV12 | PixelFormat::NV21 | PixelFormat::P010LE => (
                [s, s, 0, 0],
                [0, s * h, 0, 0],
            ),
            PixelFormat::RGBA => ([s, 0, 0, 0], [0; MAX_PLANES]),
            PixelFormat::Unknown => ([0; MAX_PLANES], [0; MAX_PLANES]),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.color_format.frame_size(self.width, self.height)
    }
}

/// Metadata the decoder attaches to every output buffer it reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: u32,
}

impl BufferInfo {
    pub fn is_end_of_stream(&self) -> bool {
        self.flags & BUFFER_FLAG_END_OF_STREAM != 0
    }
}

#[derive(Error, Debug)]
pub enum HwFrameError {
    #[error("Allocator device unavailable: {0}")]
    DeviceUnavailable(std::io::Error),
    #[error("Allocation of {len} bytes failed: {source}")]
    ResourceExhausted { len: usize, source: std::io::Error },
    #[error("Handle is invalid or already freed")]
    HandleInvalid,
    #[error("Decoder reported an unrecoverable error")]
    DecoderFatal,
    #[error("Buffer pool is not configured")]
    PoolNotConfigured,
    #[error("Decoder bridge is closed")]
    BridgeClosed,
}
