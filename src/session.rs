// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::backend::{Completion, CompletionCallback, DecodeService, EncodeService, EncodeServiceInterface, ServiceParams};
use crate::buffer_pool::BufferPool;
use crate::frame::PixelBuffer;
use crate::queue::{DrainOutcome, OutputQueue};
use crate::types::{EncodeError, EncodedFrame, EncoderConfig, MediaTime, PixelFormat, SessionState};
use crate::verify::Verifier;

// Idle buffers kept per frame shape; submit, retain and decode each recycle
// through the same pool.
const POOL_IDLE_CAPACITY: usize = 4;

struct SharedState {
    state: SessionState,
    verification_failures: Vec<(u64, EncodeError)>,
}

/// An encode session around the codec service.
///
/// Frames go in through [`submit_raw`](Self::submit_raw) or
/// [`submit_pixel_buffer`](Self::submit_pixel_buffer) and come back, in
/// submission order, through [`next_encoded_frame`](Self::next_encoded_frame)
/// once the service completes them. The service completes frames on its own
/// thread and in its own order; the session re-sequences before anything
/// becomes visible here.
///
/// With `high_quality` + `verify_output`, every completed frame is decoded
/// through a paired decode service and measured against the retained
/// original before it is enqueued.
pub struct ProresSession {
    config: EncoderConfig,
    format: PixelFormat,
    encoder: EncodeService,
    queue: OutputQueue,
    pool: BufferPool,
    shared: Arc<Mutex<SharedState>>,
    // Originals kept for verification, keyed by sequence, released as each
    // frame's verification finishes.
    retained: Arc<Mutex<HashMap<u64, PixelBuffer>>>,
    submitted: u64,
}

impl ProresSession {
    /// Validate the configuration and open the codec service — plus the
    /// paired decode service in verification mode. Validation failures never
    /// touch a service.
    pub fn open(config: EncoderConfig) -> Result<Self, EncodeError> {
        config.validate()?;
        let format = config.pixel_format();

        let params = ServiceParams {
            width: config.width,
            height: config.height,
            format,
            high_quality: config.high_quality,
            interlaced: config.interlaced,
            display_aspect_ratio: config.display_aspect_ratio,
            options: config.custom_options.clone(),
        };

        let pool = BufferPool::new(POOL_IDLE_CAPACITY);
        let queue = OutputQueue::new(config.queue_capacity);
        let shared = Arc::new(Mutex::new(SharedState {
            state: SessionState::Uninitialized,
            verification_failures: Vec::new(),
        }));
        let retained: Arc<Mutex<HashMap<u64, PixelBuffer>>> = Arc::new(Mutex::new(HashMap::new()));

        // The paired decoder opens first; if the encode service fails to open
        // afterwards, the decoder is released on the error path.
        let verifier = Arc::new(if config.high_quality && config.verify_output {
            let decoder = DecodeService::open(params.clone())?;
            Some(Mutex::new(Verifier::new(decoder, pool.clone())))
        } else {
            None
        });

        let callback = Self::completion_callback(
            &config, queue.clone(), shared.clone(), retained.clone(), verifier,
        );
        let encoder = EncodeService::open(params, config.hardware_accelerated, callback)?;

        shared.lock().state = SessionState::Open;
        log::debug!(
            "opened {}x{} {:?} encode session{}",
            config.width, config.height, format,
            if config.verify_output { " with output verification" } else { "" }
        );

        Ok(Self { config, format, encoder, queue, pool, shared, retained, submitted: 0 })
    }

    fn completion_callback(
        config: &EncoderConfig,
        queue: OutputQueue,
        shared: Arc<Mutex<SharedState>>,
        retained: Arc<Mutex<HashMap<u64, PixelBuffer>>>,
        verifier: Arc<Option<Mutex<Verifier>>>,
    ) -> CompletionCallback {
        let timescale = config.timescale;

        Arc::new(move |completion: Completion| {
            let Completion { seq, data } = completion;

            let mut metrics = None;
            if let Some(verifier) = verifier.as_ref() {
                match retained.lock().remove(&seq) {
                    Some(original) => match verifier.lock().verify(&original, &data) {
                        Ok(m) => metrics = Some(m),
                        Err(e) => {
                            // Non-fatal: the frame still ships, without metrics.
                            log::warn!("verification failed for frame {seq}: {e}");
                            shared.lock().verification_failures.push((seq, e));
                        }
                    },
                    None => log::warn!("no retained original for frame {seq}, skipping verification"),
                }
            }

            let frame = EncodedFrame {
                seq,
                data,
                pts: MediaTime { value: seq as i64 * timescale.0 as i64, timescale: timescale.1 },
                duration: MediaTime { value: timescale.0 as i64, timescale: timescale.1 },
                metrics,
            };

            if let Err(e) = queue.enqueue(seq, frame) {
                log::error!("codec service protocol violation: {e}");
                shared.lock().state = SessionState::Failed;
                retained.lock().clear();
                queue.fail();
                queue.clear();
            }
        })
    }

    /// Adapt and submit one raw frame. The slice must be exactly
    /// `width × height × bytes_per_pixel` for the session's format and is
    /// only borrowed for this call. Returns before the frame is encoded.
    pub fn submit_raw(&mut self, raw: &[u8]) -> Result<(), EncodeError> {
        self.ensure_open()?;
        let frame = PixelBuffer::from_raw(&self.pool, raw, self.config.width, self.config.height, self.format)?;
        self.submit_frame(frame)
    }

    /// Submit an already-adapted pixel buffer. The buffer stays with the
    /// caller; the session copies what it needs.
    pub fn submit_pixel_buffer(&mut self, buffer: &PixelBuffer) -> Result<(), EncodeError> {
        self.ensure_open()?;
        if buffer.width() != self.config.width
            || buffer.height() != self.config.height
            || buffer.format() != self.format
        {
            return Err(EncodeError::FormatMismatch {
                expected: self.config.frame_size(),
                got: buffer.data().len(),
                format: self.format,
            });
        }
        self.submit_frame(buffer.duplicate(&self.pool))
    }

    fn submit_frame(&mut self, frame: PixelBuffer) -> Result<(), EncodeError> {
        let seq = self.queue.admit()?;
        if self.verifying() {
            self.retained.lock().insert(seq, frame.duplicate(&self.pool));
        }
        if let Err(e) = self.encoder.submit(seq, frame) {
            self.retained.lock().remove(&seq);
            self.queue.retract(seq);
            return Err(e);
        }
        self.submitted += 1;
        Ok(())
    }

    /// The next frame in submission order, if its completion has been
    /// processed. Never blocks and never yields frames out of order.
    pub fn next_encoded_frame(&mut self) -> Option<EncodedFrame> {
        if self.shared.lock().state == SessionState::Failed {
            return None;
        }
        self.queue.dequeue_next()
    }

    /// Signal end of stream and block until every submitted frame has been
    /// completed and processed, then close the session. Exceeding the
    /// configured timeout fails the session. Flushing an already closed
    /// session is a no-op.
    pub fn flush(&mut self) -> Result<(), EncodeError> {
        {
            let mut shared = self.shared.lock();
            match shared.state {
                SessionState::Closed => return Ok(()),
                SessionState::Failed => return Err(EncodeError::SessionFailed),
                SessionState::Open => shared.state = SessionState::Flushing,
                SessionState::Uninitialized | SessionState::Flushing => return Err(EncodeError::SessionNotOpen),
            }
        }

        if let Err(e) = self.encoder.finish() {
            self.fail_session();
            return Err(e);
        }

        let deadline = Instant::now() + self.config.flush_timeout;
        match self.queue.wait_drained(self.submitted, deadline) {
            DrainOutcome::Drained => {
                self.shared.lock().state = SessionState::Closed;
                log::debug!("session closed after {} frames", self.submitted);
                Ok(())
            }
            DrainOutcome::Failed => {
                self.fail_session();
                Err(EncodeError::SessionFailed)
            }
            DrainOutcome::TimedOut => {
                log::error!("flush timed out waiting for {} submitted frames", self.submitted);
                self.fail_session();
                Err(EncodeError::FlushTimeout)
            }
        }
    }

    /// Per-frame verification failures recorded so far. Non-fatal: the
    /// affected frames were still delivered, with `metrics: None`. Draining.
    pub fn verification_failures(&mut self) -> Vec<(u64, EncodeError)> {
        std::mem::take(&mut self.shared.lock().verification_failures)
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn verifying(&self) -> bool {
        self.config.high_quality && self.config.verify_output
    }

    fn ensure_open(&self) -> Result<(), EncodeError> {
        match self.shared.lock().state {
            SessionState::Open => Ok(()),
            SessionState::Closed => Err(EncodeError::SessionClosed),
            SessionState::Failed => Err(EncodeError::SessionFailed),
            SessionState::Uninitialized | SessionState::Flushing => Err(EncodeError::SessionNotOpen),
        }
    }

    fn fail_session(&mut self) {
        self.shared.lock().state = SessionState::Failed;
        self.retained.lock().clear();
        self.queue.fail();
        self.queue.clear();
    }
}
