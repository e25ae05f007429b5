//! Elementary-stream assembly on top of reassembled PES units.
//!
//! - Video: one PES unit is one H.264 access unit. Delivery starts at the first IDR.
//! - LPCM: 4-byte Blu-ray audio header, big-endian samples repacked to `i32`.
//! - PGS: the PES payload is handed to [`crate::pgs::PgsSubtitleDecoder`] unchanged.

use crate::h264_utils;
use crate::ts_demux::PesUnit;
use bytes::Bytes;
use serde::Serialize;

/// Converts 90 kHz PTS values to microseconds relative to the session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    base90: u64,
}

impl Timebase {
    pub fn new(base90: u64) -> Self {
        Self { base90 }
    }

    /// From a 45 kHz clip time (seek point or presentation start).
    pub fn from_45k(pts45: u64) -> Self {
        Self { base90: pts45 * 2 }
    }

    pub fn base90(&self) -> u64 {
        self.base90
    }

    pub fn to_us(&self, pts90: u64) -> i64 {
        (pts90 as i64 - self.base90 as i64) * 1000 / 90
    }
}

// ============================================================================
// Video
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AccessUnit {
    /// 90 kHz
    pub pts: Option<u64>,
    pub timestamp_us: i64,
    pub keyframe: bool,
    #[serde(skip)]
    pub data: Bytes,
}

pub struct VideoAssembler {
    timebase: Timebase,
    seen_idr: bool,
    last_timestamp_us: i64,
    dropped: usize,
}

impl VideoAssembler {
    pub fn new(timebase: Timebase) -> Self {
        Self {
            timebase,
            seen_idr: false,
            last_timestamp_us: 0,
            dropped: 0,
        }
    }

    /// Units dropped while waiting for the first IDR.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn push(&mut self, unit: PesUnit) -> Option<AccessUnit> {
        let keyframe = h264_utils::contains_idr(&unit.payload);
        if !self.seen_idr {
            if !keyframe {
                self.dropped += 1;
                return None;
            }
            tracing::debug!(dropped = self.dropped, "first IDR reached");
            self.seen_idr = true;
        }

        let timestamp_us = unit
            .pts
            .map(|pts| self.timebase.to_us(pts))
            .unwrap_or(self.last_timestamp_us);
        self.last_timestamp_us = timestamp_us;

        Some(AccessUnit {
            pts: unit.pts,
            timestamp_us,
            keyframe,
            data: unit.payload,
        })
    }
}

// ============================================================================
// LPCM Audio
// ============================================================================

const LPCM_HEADER_SIZE: usize = 4;
const BITS_PER_SAMPLE: [u16; 4] = [0, 16, 20, 24];

/// Channel assignment nibble → channel count.
pub fn lpcm_channels(assignment: u8) -> Option<u16> {
    match assignment {
        1 => Some(1),
        3 => Some(2),
        4 | 5 => Some(3),
        6 | 7 => Some(4),
        8 => Some(5),
        9 => Some(6),
        10 => Some(7),
        11 => Some(8),
        _ => None,
    }
}

/// Sampling frequency nibble → Hz.
pub fn lpcm_sample_rate(code: u8) -> Option<u32> {
    match code {
        1 => Some(48_000),
        4 => Some(96_000),
        5 => Some(192_000),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PcmFrame {
    pub timestamp_us: i64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Interleaved, left-aligned in 32 bits
    #[serde(skip)]
    pub samples: Vec<i32>,
}

impl PcmFrame {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// Widens one big-endian 16- or 24-bit sample to a left-aligned `i32`.
#[inline]
pub fn repack_sample(bytes: &[u8]) -> i32 {
    match *bytes {
        [b0, b1] => i32::from_be_bytes([b0, b1, 0, 0]),
        [b0, b1, b2] => i32::from_be_bytes([b0, b1, b2, 0]),
        _ => 0,
    }
}

pub struct LpcmAssembler {
    timebase: Timebase,
    skipped: usize,
}

impl LpcmAssembler {
    pub fn new(timebase: Timebase) -> Self {
        Self {
            timebase,
            skipped: 0,
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn push(&mut self, unit: PesUnit) -> Option<PcmFrame> {
        let pts = unit.pts?;
        if pts < self.timebase.base90() {
            self.skipped += 1;
            return None;
        }
        if unit.is_truncated() {
            tracing::warn!(
                pid = unit.pid,
                declared = ?unit.declared_len,
                actual = unit.payload.len(),
                "PES packet mismatch"
            );
        }

        let payload = &unit.payload;
        if payload.len() < LPCM_HEADER_SIZE {
            tracing::warn!(pid = unit.pid, len = payload.len(), "LPCM unit shorter than its header");
            return None;
        }

        let (Some(channels), Some(sample_rate)) =
            (lpcm_channels(payload[2] >> 4), lpcm_sample_rate(payload[2] & 0x0f))
        else {
            tracing::warn!(pid = unit.pid, header = payload[2], "unsupported LPCM format");
            return None;
        };
        let bits_per_sample = BITS_PER_SAMPLE[(payload[3] >> 6) as usize];
        if bits_per_sample == 0 {
            tracing::warn!(pid = unit.pid, "reserved LPCM sample size");
            return None;
        }

        // odd layouts are padded with one silent channel on disc
        let coded_channels = (channels + channels % 2) as usize;
        let sample_bytes = if bits_per_sample == 16 { 2 } else { 3 };
        let frame_bytes = coded_channels * sample_bytes;

        let data = &payload[LPCM_HEADER_SIZE..];
        let mut samples = Vec::with_capacity(data.len() / frame_bytes * channels as usize);
        for frame in data.chunks_exact(frame_bytes) {
            samples.extend(
                frame
                    .chunks_exact(sample_bytes)
                    .take(channels as usize)
                    .map(repack_sample),
            );
        }

        Some(PcmFrame {
            timestamp_us: self.timebase.to_us(pts),
            sample_rate,
            channels,
            bits_per_sample,
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(pts: Option<u64>, payload: Vec<u8>) -> PesUnit {
        PesUnit {
            pid: 0x1011,
            stream_id: 0xE0,
            pts,
            declared_len: Some(payload.len()),
            random_access: false,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn video_waits_for_first_idr() {
        let mut video = VideoAssembler::new(Timebase::new(900_000));
        let delta = vec![0, 0, 0, 1, 0x09, 0xf0, 0, 0, 1, 0x41, 0x9a];
        let idr = vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x65, 0x88];

        assert!(video.push(unit(Some(900_000), delta.clone())).is_none());
        let au = video.push(unit(Some(903_003), idr)).unwrap();
        assert!(au.keyframe);
        assert_eq!(au.timestamp_us, 33_366);

        let au = video.push(unit(None, delta)).unwrap();
        assert!(!au.keyframe);
        assert_eq!(au.timestamp_us, 33_366);
        assert_eq!(video.dropped(), 1);
    }

    #[test]
    fn repacks_24_bit_samples() {
        assert_eq!(repack_sample(&[0x12, 0x34, 0x56]), 0x12345600);
        assert_eq!(repack_sample(&[0x80, 0x00, 0x00]), i32::MIN);
        assert_eq!(repack_sample(&[0xff, 0xff]), -65536);
    }

    #[test]
    fn stereo_24_bit_frame() {
        let mut audio = LpcmAssembler::new(Timebase::new(0));
        // 2 channels, 48 kHz, 24-bit
        let mut payload = vec![0x05, 0xA0, 0x31, 0xC0];
        payload.extend_from_slice(&[0x12, 0x34, 0x56, 0x00, 0x00, 0x01]);
        payload.extend_from_slice(&[0xff, 0xff, 0xff, 0x7f, 0xff, 0xff]);

        let frame = audio.push(unit(Some(90), payload)).unwrap();
        assert_eq!(frame.channels, 2);
        assert_eq!(frame.sample_rate, 48_000);
        assert_eq!(frame.bits_per_sample, 24);
        assert_eq!(frame.timestamp_us, 1000);
        assert_eq!(frame.frames(), 2);
        assert_eq!(frame.samples, vec![0x12345600, 0x00000100, -256, 0x7fffff00]);
    }

    #[test]
    fn odd_layout_drops_padding_channel() {
        let mut audio = LpcmAssembler::new(Timebase::new(0));
        // 3 channels coded as 4, 96 kHz, 16-bit
        let mut payload = vec![0x00, 0x00, 0x44, 0x40];
        payload.extend_from_slice(&[0, 1, 0, 2, 0, 3, 0xAA, 0xAA]);
        let frame = audio.push(unit(Some(0), payload)).unwrap();
        assert_eq!(frame.channels, 3);
        assert_eq!(frame.sample_rate, 96_000);
        assert_eq!(frame.samples, vec![1 << 16, 2 << 16, 3 << 16]);
    }

    #[test]
    fn units_before_session_start_are_skipped() {
        let mut audio = LpcmAssembler::new(Timebase::new(90_000));
        let payload = vec![0x00, 0x00, 0x31, 0xC0, 0, 0, 0, 0, 0, 0];
        assert!(audio.push(unit(Some(89_999), payload.clone())).is_none());
        assert_eq!(audio.skipped(), 1);
        assert!(audio.push(unit(Some(90_000), payload)).is_some());
    }

    #[test]
    fn mismatched_length_still_delivers() {
        let mut audio = LpcmAssembler::new(Timebase::new(0));
        let mut u = unit(Some(0), vec![0x00, 0x00, 0x31, 0xC0, 1, 2, 3, 4, 5, 6]);
        u.declared_len = Some(100);
        assert!(u.is_truncated());
        assert!(audio.push(u).is_some());
    }
}
