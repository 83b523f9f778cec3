// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::*;
use crate::buffer_pool::BufferPool;
use crate::frame::PixelBuffer;
use crate::types::{EncodeError, PixelFormat};

// Sample framing: magic, version, format, depth, flags, geometry, payload
// length, payload crc32, then the quantized 16-bit LE sample stream.
const MAGIC: &[u8; 4] = b"PRSW";
const HEADER_LEN: usize = 24;

enum Job {
    Frame { seq: u64, frame: PixelBuffer },
    Finish,
}

/// Bundled software encode service.
///
/// Quantizes each 16-bit sample to the 12-bit (high quality) or 10-bit class
/// and frames the result with a checksummed header. Frames are processed on a
/// worker thread owned by the service; the completion callback is invoked
/// from that thread.
///
/// Options:
/// - `software.completion_window` — buffer N frames and complete each window
///   in reverse order (completions arrive out of submission order).
/// - `software.corrupt_payload_every` — flip a payload byte of every Nth
///   sample after checksumming, so the paired decoder rejects it.
/// - `software.encode_delay_ms` — sleep per frame, to simulate a slow service.
pub(crate) struct SoftwareEncodeService {
    tx: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SoftwareEncodeService {
    pub fn open(params: ServiceParams, callback: CompletionCallback) -> Result<Self, EncodeError> {
        let completion_window = match select_custom_option(&params.options, &["software.completion_window", "completion_window"]) {
            Some(value) => match value.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => { log::warn!("software: ignoring invalid completion_window '{value}'"); 1 }
            },
            None => 1,
        };
        let corrupt_every = match select_custom_option(&params.options, &["software.corrupt_payload_every", "corrupt_payload_every"]) {
            Some(value) => match value.parse::<u64>() {
                Ok(n) => n,
                Err(_) => { log::warn!("software: ignoring invalid corrupt_payload_every '{value}'"); 0 }
            },
            None => 0,
        };
        let encode_delay = match select_custom_option(&params.options, &["software.encode_delay_ms", "encode_delay_ms"]) {
            Some(value) => match value.parse::<u64>() {
                Ok(n) => Duration::from_millis(n),
                Err(_) => { log::warn!("software: ignoring invalid encode_delay_ms '{value}'"); Duration::ZERO }
            },
            None => Duration::ZERO,
        };

        let depth = if params.high_quality { 12 } else { 10 };
        let (tx, rx) = mpsc::channel::<Job>();

        let worker = std::thread::Builder::new()
            .name("prores-sw-encode".into())
            .spawn(move || {
                let mut window: Vec<Completion> = Vec::with_capacity(completion_window);
                let mut encoded: u64 = 0;

                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Frame { seq, frame } => {
                            if !encode_delay.is_zero() {
                                std::thread::sleep(encode_delay);
                            }
                            let mut data = encode_sample(&params, depth, &frame);
                            encoded += 1;
                            if corrupt_every > 0 && encoded % corrupt_every == 0 {
                                let last = data.len() - 1;
                                data[last] ^= 0xff;
                            }
                            window.push(Completion { seq, data });
                            if window.len() >= completion_window {
                                for completion in window.drain(..).rev() {
                                    callback(completion);
                                }
                            }
                        }
                        Job::Finish => break,
                    }
                }
                // Partial window at end of stream still completes, newest first.
                for completion in window.drain(..).rev() {
                    callback(completion);
                }
            })
            .map_err(|e| EncodeError::BackendUnavailable(format!("failed to start encode worker: {e}")))?;

        Ok(Self { tx: Some(tx), worker: Some(worker) })
    }
}

impl EncodeServiceInterface for SoftwareEncodeService {
    fn submit(&mut self, seq: u64, frame: PixelBuffer) -> Result<(), EncodeError> {
        match &self.tx {
            Some(tx) => tx.send(Job::Frame { seq, frame })
                .map_err(|_| EncodeError::BackendRejected("encode worker stopped".into())),
            None => Err(EncodeError::BackendRejected("encode worker stopped".into())),
        }
    }

    fn finish(&mut self) -> Result<(), EncodeError> {
        match &self.tx {
            Some(tx) => tx.send(Job::Finish)
                .map_err(|_| EncodeError::BackendRejected("encode worker stopped".into())),
            None => Ok(()),
        }
    }
}

impl Drop for SoftwareEncodeService {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Decode side of the software service, used by output verification.
pub(crate) struct SoftwareDecodeService {
    params: ServiceParams,
}

impl SoftwareDecodeService {
    pub fn open(params: ServiceParams) -> Result<Self, EncodeError> {
        Ok(Self { params })
    }
}

impl DecodeServiceInterface for SoftwareDecodeService {
    fn decode(&mut self, sample: &[u8], pool: &BufferPool) -> Result<PixelBuffer, EncodeError> {
        if sample.len() < HEADER_LEN {
            return Err(EncodeError::BackendRejected("truncated sample header".into()));
        }
        if &sample[0..4] != MAGIC {
            return Err(EncodeError::BackendRejected("not a software service sample".into()));
        }
        if sample[4] != 1 {
            return Err(EncodeError::BackendRejected(format!("unknown sample version {}", sample[4])));
        }
        let format = match sample[5] {
            0 => PixelFormat::V216,
            1 => PixelFormat::AYUV64,
            tag => return Err(EncodeError::BackendRejected(format!("unknown format tag {tag}"))),
        };
        let width = u32::from_le_bytes(sample[8..12].try_into().unwrap());
        let height = u32::from_le_bytes(sample[12..16].try_into().unwrap());
        if format != self.params.format || width != self.params.width || height != self.params.height {
            return Err(EncodeError::BackendRejected("sample does not match session geometry".into()));
        }
        let payload_len = u32::from_le_bytes(sample[16..20].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(sample[20..24].try_into().unwrap());
        let payload = &sample[HEADER_LEN..];
        if payload.len() != payload_len {
            return Err(EncodeError::BackendRejected("truncated sample payload".into()));
        }
        if crc32fast::hash(payload) != crc {
            return Err(EncodeError::BackendRejected("payload checksum mismatch".into()));
        }
        PixelBuffer::from_raw(pool, payload, width, height, format)
    }
}

fn quantize(value: u16, depth: u32) -> u16 {
    value & (u16::MAX << (16 - depth))
}

fn encode_sample(params: &ServiceParams, depth: u32, frame: &PixelBuffer) -> Vec<u8> {
    let payload: Vec<u8> = frame.data()
        .chunks_exact(2)
        .flat_map(|b| quantize(u16::from_le_bytes([b[0], b[1]]), depth).to_le_bytes())
        .collect();
    let crc = crc32fast::hash(&payload);

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.push(1);
    out.push(match params.format { PixelFormat::V216 => 0, PixelFormat::AYUV64 => 1 });
    out.push(depth as u8);
    out.push(params.interlaced as u8);
    out.extend_from_slice(&params.width.to_le_bytes());
    out.extend_from_slice(&params.height.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use crate::types::Rational;

    fn params(format: PixelFormat, options: &[(&str, &str)]) -> ServiceParams {
        ServiceParams {
            width: 4,
            height: 2,
            format,
            high_quality: format == PixelFormat::AYUV64,
            interlaced: false,
            display_aspect_ratio: Rational(16, 9),
            options: options.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>(),
        }
    }

    fn frame(pool: &BufferPool, format: PixelFormat) -> PixelBuffer {
        let len = 4 * 2 * format.bytes_per_pixel();
        let raw: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(37).wrapping_add(11)).collect();
        PixelBuffer::from_raw(pool, &raw, 4, 2, format).unwrap()
    }

    fn collectors() -> (CompletionCallback, mpsc::Receiver<Completion>) {
        let (tx, rx) = mpsc::channel();
        let callback: CompletionCallback = Arc::new(move |completion| { let _ = tx.send(completion); });
        (callback, rx)
    }

    #[test]
    fn round_trip_yields_quantized_samples() {
        let pool = BufferPool::new(2);
        let (callback, rx) = collectors();
        let params = params(PixelFormat::AYUV64, &[]);
        let mut encoder = SoftwareEncodeService::open(params.clone(), callback).unwrap();

        let src = frame(&pool, PixelFormat::AYUV64);
        encoder.submit(0, src.duplicate(&pool)).unwrap();
        encoder.finish().unwrap();

        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(completion.seq, 0);

        let mut decoder = SoftwareDecodeService::open(params).unwrap();
        let decoded = decoder.decode(&completion.data, &pool).unwrap();

        let expected: Vec<u8> = src.data()
            .chunks_exact(2)
            .flat_map(|b| quantize(u16::from_le_bytes([b[0], b[1]]), 12).to_le_bytes())
            .collect();
        assert_eq!(decoded.data(), &expected[..]);
    }

    #[test]
    fn completion_window_reorders_within_each_window() {
        let pool = BufferPool::new(4);
        let (callback, rx) = collectors();
        let params = params(PixelFormat::V216, &[("software.completion_window", "3")]);
        let mut encoder = SoftwareEncodeService::open(params, callback).unwrap();

        for seq in 0..5 {
            encoder.submit(seq, frame(&pool, PixelFormat::V216)).unwrap();
        }
        encoder.finish().unwrap();

        let order: Vec<u64> = (0..5).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().seq).collect();
        // First full window reversed, then the partial end-of-stream window.
        assert_eq!(order, vec![2, 1, 0, 4, 3]);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let pool = BufferPool::new(2);
        let (callback, rx) = collectors();
        let params = params(PixelFormat::V216, &[("software.corrupt_payload_every", "1")]);
        let mut encoder = SoftwareEncodeService::open(params.clone(), callback).unwrap();

        encoder.submit(0, frame(&pool, PixelFormat::V216)).unwrap();
        encoder.finish().unwrap();

        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let mut decoder = SoftwareDecodeService::open(params).unwrap();
        let err = decoder.decode(&completion.data, &pool).unwrap_err();
        assert!(err.to_string().contains("checksum"), "{err}");
    }

    #[test]
    fn decode_rejects_foreign_and_mismatched_samples() {
        let pool = BufferPool::new(2);
        let mut decoder = SoftwareDecodeService::open(params(PixelFormat::V216, &[])).unwrap();

        assert!(decoder.decode(b"too short", &pool).is_err());
        assert!(decoder.decode(&[0u8; HEADER_LEN], &pool).is_err());

        // A well-formed sample for the wrong geometry.
        let mut other = params(PixelFormat::V216, &[]);
        other.width = 8;
        let src = PixelBuffer::from_raw(&pool, &vec![0u8; 8 * 2 * 4], 8, 2, PixelFormat::V216).unwrap();
        let sample = encode_sample(&other, 10, &src);
        let err = decoder.decode(&sample, &pool).unwrap_err();
        assert!(err.to_string().contains("geometry"), "{err}");
    }
}
