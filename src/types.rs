// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Pixel layouts accepted at the session input and produced by the paired
/// verification decoder. Both carry 16 bits per component, little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 4:2:2 — Cb Y0 Cr Y1 per pair of pixels.
    V216,
    /// Packed 4:4:4:4 — A Y Cb Cr per pixel. High-quality mode only.
    AYUV64,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::V216 => 4,
            PixelFormat::AYUV64 => 8,
        }
    }
    pub fn bit_depth(&self) -> u32 { 16 }
    pub fn has_alpha(&self) -> bool {
        matches!(self, PixelFormat::AYUV64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rational(pub u32, pub u32);

impl Rational {
    pub fn as_f64(&self) -> f64 { self.0 as f64 / self.1 as f64 }
    pub fn is_positive(&self) -> bool { self.0 > 0 && self.1 > 0 }
}

/// Timestamp or duration expressed against an integer timescale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: u32,
}

impl MediaTime {
    pub fn as_seconds(&self) -> f64 { self.value as f64 / self.timescale as f64 }
}

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    /// Frame duration in seconds, e.g. 1001/30000 for 29.97 fps.
    pub timescale: Rational,
    pub display_aspect_ratio: Rational,
    pub interlaced: bool,
    /// Advisory. Falls back to the software service when no hardware
    /// service is available.
    pub hardware_accelerated: bool,
    /// Expect 4:4:4:4 16-bit input and produce the 12-bit encoding class.
    pub high_quality: bool,
    /// Decode every encoded frame and attach per-channel fidelity metrics.
    /// Only valid together with `high_quality`.
    pub verify_output: bool,

    /// Bound on frames admitted by `submit` and not yet dequeued.
    pub queue_capacity: usize,
    pub flush_timeout: Duration,
    /// Passed through to the codec service.
    pub custom_options: HashMap<String, String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            timescale: Rational(1001, 30000),
            display_aspect_ratio: Rational(16, 9),
            interlaced: false,
            hardware_accelerated: false,
            high_quality: false,
            verify_output: false,
            queue_capacity: 16,
            flush_timeout: Duration::from_secs(10),
            custom_options: HashMap::new(),
        }
    }
}

impl EncoderConfig {
    pub fn pixel_format(&self) -> PixelFormat {
        if self.high_quality { PixelFormat::AYUV64 } else { PixelFormat::V216 }
    }

    /// Exact byte size of one raw input frame.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format().bytes_per_pixel()
    }

    pub(crate) fn validate(&self) -> Result<(), EncodeError> {
        if self.width == 0 || self.height == 0 {
            return Err(EncodeError::InvalidConfig("frame dimensions must be positive"));
        }
        if !self.high_quality && self.width % 2 != 0 {
            return Err(EncodeError::InvalidConfig("4:2:2 input requires an even width"));
        }
        if !self.timescale.is_positive() {
            return Err(EncodeError::InvalidConfig("timescale must be a positive rational"));
        }
        if !self.display_aspect_ratio.is_positive() {
            return Err(EncodeError::InvalidConfig("display aspect ratio must be a positive rational"));
        }
        if self.verify_output && !self.high_quality {
            return Err(EncodeError::InvalidConfig("verify_output requires high_quality"));
        }
        if self.queue_capacity == 0 {
            return Err(EncodeError::InvalidConfig("queue capacity must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Open,
    Flushing,
    Closed,
    Failed,
}

/// A compressed frame handed back to the caller, in submission order.
#[derive(Debug)]
pub struct EncodedFrame {
    pub seq: u64,
    pub data: Vec<u8>,
    pub pts: MediaTime,
    pub duration: MediaTime,
    /// Present when the session runs with `verify_output` and the paired
    /// decode succeeded for this frame.
    pub metrics: Option<crate::verify::FidelityMetrics>,
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("Codec service unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Buffer size {got} does not match expected {expected} bytes for {format:?}")]
    FormatMismatch { expected: usize, got: usize, format: PixelFormat },
    #[error("Session is not open")]
    SessionNotOpen,
    #[error("Session is closed")]
    SessionClosed,
    #[error("Session has failed")]
    SessionFailed,
    #[error("Codec service rejected the frame: {0}")]
    BackendRejected(String),
    #[error("Encoded output queue is full")]
    QueueFull,
    #[error("Flush did not drain within the configured timeout")]
    FlushTimeout,
    #[error("Completion for unexpected sequence {0}")]
    ReorderViolation(u64),
    #[error("Verification decode failed: {0}")]
    VerificationDecode(String),
}
