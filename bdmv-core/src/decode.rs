//! # Media Decode Interface
//!
//! Demux sessions hand complete access units to a [`MediaDecoder`]. Real
//! codecs live outside this crate; [`PassthroughDecoder`] forwards the
//! encoded units so they can be inspected or remuxed.

use crate::clpi::coding_type;
use crate::elementary::AccessUnit;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Invalid NAL unit")]
    InvalidNal,
}

/// Video codecs carried on Blu-ray
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Codec {
    Mpeg2,
    H264,
    Vc1,
    Hevc,
}

impl Codec {
    pub fn from_coding_type(ct: u8) -> Option<Self> {
        match ct {
            coding_type::MPEG1_VIDEO | coding_type::MPEG2_VIDEO => Some(Codec::Mpeg2),
            coding_type::H264 | coding_type::MVC => Some(Codec::H264),
            coding_type::VC1 => Some(Codec::Vc1),
            coding_type::HEVC => Some(Codec::Hevc),
            _ => None,
        }
    }
}

/// Layout of `VideoFrame::data`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameFormat {
    /// Annex B access unit, not decoded
    Encoded,
    Nv12,
    I420,
    Rgba8,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoFrame {
    /// Relative to the session start
    pub timestamp_us: i64,
    pub keyframe: bool,
    pub format: FrameFormat,
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub data: Bytes,
}

/// Decoder trait - implemented by every decoder backend
pub trait MediaDecoder: Send {
    /// Decode one access unit into zero or more frames
    fn decode(&mut self, unit: &AccessUnit) -> Result<Vec<VideoFrame>, DecodeError>;

    /// Drain frames still held for reordering
    fn flush(&mut self) -> Result<Vec<VideoFrame>, DecodeError>;

    /// Drop all reference state
    fn reset(&mut self);

    fn name(&self) -> &str;
}

/// Forwards access units unchanged.
#[derive(Debug, Default)]
pub struct PassthroughDecoder {
    units: u64,
}

impl PassthroughDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> u64 {
        self.units
    }
}

impl MediaDecoder for PassthroughDecoder {
    fn decode(&mut self, unit: &AccessUnit) -> Result<Vec<VideoFrame>, DecodeError> {
        if !crate::h264_utils::is_annexb(&unit.data) {
            return Err(DecodeError::InvalidNal);
        }
        self.units += 1;
        Ok(vec![VideoFrame {
            timestamp_us: unit.timestamp_us,
            keyframe: unit.keyframe,
            format: FrameFormat::Encoded,
            width: 0,
            height: 0,
            data: unit.data.clone(),
        }])
    }

    fn flush(&mut self) -> Result<Vec<VideoFrame>, DecodeError> {
        Ok(vec![])
    }

    fn reset(&mut self) {
        self.units = 0;
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Create a decoder for a clip's video coding type
pub fn create_decoder(ct: u8) -> Result<Box<dyn MediaDecoder>, DecodeError> {
    match Codec::from_coding_type(ct) {
        Some(Codec::H264) => Ok(Box::new(PassthroughDecoder::new())),
        Some(codec) => Err(DecodeError::UnsupportedCodec(format!("{:?}", codec))),
        None => Err(DecodeError::UnsupportedCodec(format!("coding type {:#04x}", ct))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(data: &[u8], keyframe: bool) -> AccessUnit {
        AccessUnit {
            pts: Some(0),
            timestamp_us: 40_000,
            keyframe,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn passthrough_forwards_units() {
        let mut dec = PassthroughDecoder::new();
        let frames = dec.decode(&unit(&[0, 0, 0, 1, 0x65, 0x88], true)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].format, FrameFormat::Encoded);
        assert_eq!(frames[0].timestamp_us, 40_000);
        assert!(frames[0].keyframe);
        assert_eq!(&frames[0].data[..], &[0, 0, 0, 1, 0x65, 0x88]);
        assert!(dec.flush().unwrap().is_empty());
        assert_eq!(dec.units(), 1);
    }

    #[test]
    fn passthrough_rejects_non_annexb() {
        let mut dec = PassthroughDecoder::new();
        assert!(matches!(dec.decode(&unit(&[1, 2, 3], false)), Err(DecodeError::InvalidNal)));
    }

    #[test]
    fn decoder_selection() {
        assert_eq!(create_decoder(coding_type::H264).unwrap().name(), "passthrough");
        assert!(matches!(
            create_decoder(coding_type::VC1),
            Err(DecodeError::UnsupportedCodec(_))
        ));
        assert_eq!(Codec::from_coding_type(coding_type::HEVC), Some(Codec::Hevc));
    }
}
