// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::backend::{DecodeService, DecodeServiceInterface};
use crate::buffer_pool::BufferPool;
use crate::frame::{ColorChannel, PixelBuffer};
use crate::types::EncodeError;

/// Reconstruction error of one channel of one frame.
#[derive(Clone, Copy, Debug)]
pub struct ChannelFidelity {
    pub channel: ColorChannel,
    /// Mean squared error over all samples of the channel.
    pub mse: f64,
    /// 10·log10(MAX²/MSE); infinite when the reconstruction is exact.
    pub psnr: f64,
}

impl ChannelFidelity {
    pub fn is_perfect(&self) -> bool { self.mse == 0.0 }
}

/// Per-channel fidelity of one encoded frame against its source.
#[derive(Clone, Debug)]
pub struct FidelityMetrics {
    pub channels: Vec<ChannelFidelity>,
}

impl FidelityMetrics {
    pub fn is_perfect(&self) -> bool {
        self.channels.iter().all(|c| c.is_perfect())
    }

    pub fn channel(&self, channel: ColorChannel) -> Option<&ChannelFidelity> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

pub(crate) fn psnr(mse: f64, max_value: f64) -> f64 {
    if mse == 0.0 {
        f64::INFINITY
    } else {
        10.0 * ((max_value * max_value) / mse).log10()
    }
}

fn mse(a: &[u16], b: &[u16]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.0;
    }
    let sum: f64 = a.iter().zip(b).map(|(&x, &y)| {
        let d = x as f64 - y as f64;
        d * d
    }).sum();
    sum / a.len() as f64
}

/// Decodes every encoded frame through the paired decode service and
/// measures it against the retained original. Runs inside the completion
/// callback, so it never blocks the submitting thread.
pub(crate) struct Verifier {
    decoder: DecodeService,
    pool: BufferPool,
}

impl Verifier {
    pub fn new(decoder: DecodeService, pool: BufferPool) -> Self {
        Self { decoder, pool }
    }

    pub fn verify(&mut self, original: &PixelBuffer, sample: &[u8]) -> Result<FidelityMetrics, EncodeError> {
        let decoded = self.decoder.decode(sample, &self.pool)
            .map_err(|e| EncodeError::VerificationDecode(e.to_string()))?;

        if decoded.width() != original.width()
            || decoded.height() != original.height()
            || decoded.format() != original.format()
        {
            return Err(EncodeError::VerificationDecode("decoded frame does not match the original layout".into()));
        }

        let max_value = ((1u32 << original.format().bit_depth()) - 1) as f64;
        let channels = original.channels().iter().map(|&channel| {
            let mse = mse(
                &original.channel_samples(channel),
                &decoded.channel_samples(channel),
            );
            ChannelFidelity { channel, mse, psnr: psnr(mse, max_value) }
        }).collect();

        Ok(FidelityMetrics { channels })
    }
}
