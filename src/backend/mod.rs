// SPDX-License-Identifier: MIT OR Apache-2.0

pub(crate) mod software;

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer_pool::BufferPool;
use crate::frame::PixelBuffer;
use crate::types::{EncodeError, PixelFormat, Rational};

/// Everything a codec service needs to know at open time.
#[derive(Clone, Debug)]
pub(crate) struct ServiceParams {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Selects the 12-bit encoding class instead of the 10-bit one.
    pub high_quality: bool,
    pub interlaced: bool,
    pub display_aspect_ratio: Rational,
    pub options: HashMap<String, String>,
}

/// A finished encode, delivered on a thread owned by the service.
pub(crate) struct Completion {
    pub seq: u64,
    pub data: Vec<u8>,
}

pub(crate) type CompletionCallback = Arc<dyn Fn(Completion) + Send + Sync + 'static>;

#[enum_dispatch::enum_dispatch(EncodeService)]
pub(crate) trait EncodeServiceInterface {
    /// Hand one frame to the service. Returns as soon as the frame is
    /// accepted; the encoded sample arrives later through the completion
    /// callback, not necessarily in submission order.
    fn submit(&mut self, seq: u64, frame: PixelBuffer) -> Result<(), EncodeError>;

    /// Signal that no more frames will be submitted. Completions for frames
    /// already accepted keep arriving after this returns.
    fn finish(&mut self) -> Result<(), EncodeError>;
}

#[enum_dispatch::enum_dispatch]
pub(crate) enum EncodeService {
    Software(software::SoftwareEncodeService),
}

impl EncodeService {
    /// Open an encode service. The hardware preference is advisory: when no
    /// hardware service is available for the format, the software service is
    /// used instead.
    pub fn open(params: ServiceParams, prefer_hardware: bool, callback: CompletionCallback) -> Result<Self, EncodeError> {
        if prefer_hardware {
            log::debug!("no hardware encode service for {:?}, falling back to software", params.format);
        }
        Ok(EncodeService::Software(software::SoftwareEncodeService::open(params, callback)?))
    }
}

#[enum_dispatch::enum_dispatch(DecodeService)]
pub(crate) trait DecodeServiceInterface {
    /// Synchronously decode one encoded sample back to pixels.
    fn decode(&mut self, sample: &[u8], pool: &BufferPool) -> Result<PixelBuffer, EncodeError>;
}

#[enum_dispatch::enum_dispatch]
pub(crate) enum DecodeService {
    Software(software::SoftwareDecodeService),
}

impl DecodeService {
    /// Open the decode service paired with an encode service of the same
    /// parameters.
    pub fn open(params: ServiceParams) -> Result<Self, EncodeError> {
        Ok(DecodeService::Software(software::SoftwareDecodeService::open(params)?))
    }
}

pub(crate) fn select_custom_option<'a>(options: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| options.get(*key).map(|value| value.as_str()))
}
