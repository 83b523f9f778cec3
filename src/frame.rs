// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::buffer_pool::{BufferPool, PooledBytes};
use crate::types::{EncodeError, PixelFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorChannel {
    Luma,
    Cb,
    Cr,
    Alpha,
}

/// One uncompressed frame in a packed 16-bit layout, owned by the pipeline.
///
/// Built by copying the caller's bytes at submission time; the caller's slice
/// is only borrowed for the duration of that call and may be reused or freed
/// afterwards.
pub struct PixelBuffer {
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
    data: PooledBytes,
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .finish()
    }
}

impl PixelBuffer {
    /// Adapt caller-supplied raw bytes into an owned frame. The slice must be
    /// exactly `width * height * bytes_per_pixel(format)` bytes; anything
    /// else is a [`EncodeError::FormatMismatch`] and nothing is copied.
    pub fn from_raw(pool: &BufferPool, raw: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Self, EncodeError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if raw.len() != expected {
            return Err(EncodeError::FormatMismatch { expected, got: raw.len(), format });
        }
        let stride = width as usize * format.bytes_per_pixel();
        let mut data = pool.get(width, height, stride, format);
        data.copy_from_slice(raw);
        Ok(Self { width, height, stride, format, data })
    }

    pub fn width(&self) -> u32 { self.width }
    pub fn height(&self) -> u32 { self.height }
    pub fn stride(&self) -> usize { self.stride }
    pub fn format(&self) -> PixelFormat { self.format }
    pub fn data(&self) -> &[u8] { &self.data }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] { &mut self.data }

    /// Owned copy backed by fresh pool storage.
    pub(crate) fn duplicate(&self, pool: &BufferPool) -> Self {
        let mut data = pool.get(self.width, self.height, self.stride, self.format);
        data.copy_from_slice(&self.data);
        Self { width: self.width, height: self.height, stride: self.stride, format: self.format, data }
    }

    /// Samples of one channel in raster order, for fidelity comparison.
    pub(crate) fn channel_samples(&self, channel: ColorChannel) -> Vec<u16> {
        let words: Vec<u16> = self.data
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();

        match self.format {
            // Cb Y0 Cr Y1 per group of two pixels.
            PixelFormat::V216 => match channel {
                ColorChannel::Luma => words.chunks_exact(4).flat_map(|g| [g[1], g[3]]).collect(),
                ColorChannel::Cb => words.chunks_exact(4).map(|g| g[0]).collect(),
                ColorChannel::Cr => words.chunks_exact(4).map(|g| g[2]).collect(),
                ColorChannel::Alpha => Vec::new(),
            },
            // A Y Cb Cr per pixel.
            PixelFormat::AYUV64 => {
                let idx = match channel {
                    ColorChannel::Alpha => 0,
                    ColorChannel::Luma => 1,
                    ColorChannel::Cb => 2,
                    ColorChannel::Cr => 3,
                };
                words.chunks_exact(4).map(|g| g[idx]).collect()
            }
        }
    }

    /// Channels present in this frame's layout, comparison order.
    pub(crate) fn channels(&self) -> &'static [ColorChannel] {
        if self.format.has_alpha() {
            &[ColorChannel::Luma, ColorChannel::Cb, ColorChannel::Cr, ColorChannel::Alpha]
        } else {
            &[ColorChannel::Luma, ColorChannel::Cb, ColorChannel::Cr]
        }
    }
}
