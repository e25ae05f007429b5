// TS DEMUXER - BDAV MPEG-2 Transport Stream
//
// Blu-ray clips (.m2ts) are a sequence of 192-byte source packets:
// • 4-byte TP_extra_header (arrival timestamp)
// • 188-byte transport packet, sync byte 0x47
//
// The demuxer follows the selected PIDs only, checks continuity counters,
// and reassembles PES units between payload_unit_start boundaries.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

pub const PACKET_SIZE: usize = 192;
pub const TS_SYNC_BYTE: u8 = 0x47;
const TS_OFFSET: usize = 4;
const TS_HEADER_SIZE: usize = 4;
const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

// PES stream ids without the optional header (ISO 13818-1 table 2-22)
const STREAM_ID_PROGRAM_MAP: u8 = 0xBC;
const STREAM_ID_PADDING: u8 = 0xBE;
const STREAM_ID_PRIVATE_2: u8 = 0xBF;
const STREAM_ID_ECM: u8 = 0xF0;
const STREAM_ID_EMM: u8 = 0xF1;
const STREAM_ID_DSMCC: u8 = 0xF2;
const STREAM_ID_H222_E: u8 = 0xF8;
const STREAM_ID_DIRECTORY: u8 = 0xFF;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DemuxError {
    #[error("lost sync at byte {offset}: found {found:#04x}")]
    SyncByte { offset: usize, found: u8 },
    #[error("short packet: {len} bytes")]
    ShortPacket { len: usize },
}

/// Logged when a PID's continuity counter skips or repeats. Never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("continuity error on pid {pid:#06x}: expected {expected}, found {found}")]
pub struct ContinuityError {
    pub pid: u16,
    pub expected: u8,
    pub found: u8,
}

// ============================================================================
// Types
// ============================================================================

/// One reassembled PES packet with its header stripped.
#[derive(Debug, Clone, Serialize)]
pub struct PesUnit {
    pub pid: u16,
    pub stream_id: u8,
    /// 90 kHz
    pub pts: Option<u64>,
    /// Payload size implied by PES_packet_length, `None` when unbounded
    pub declared_len: Option<usize>,
    /// Set by the adaptation field of the unit's first packet
    pub random_access: bool,
    #[serde(skip)]
    pub payload: Bytes,
}

impl PesUnit {
    /// True when the reassembled payload length disagrees with the PES header.
    pub fn is_truncated(&self) -> bool {
        matches!(self.declared_len, Some(len) if len != self.payload.len())
    }
}

// ============================================================================
// TS Packet Header
// ============================================================================

#[derive(Debug, Clone)]
pub struct TsHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub pid: u16,
    pub scrambling_control: u8,
    pub adaptation_field_exists: bool,
    pub payload_exists: bool,
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Parses the 4-byte header of a 188-byte transport packet.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < TS_HEADER_SIZE || data[0] != TS_SYNC_BYTE {
            return None;
        }

        Some(Self {
            transport_error: (data[1] & 0x80) != 0,
            payload_unit_start: (data[1] & 0x40) != 0,
            pid: ((data[1] as u16 & 0x1F) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_exists: (data[3] & 0x20) != 0,
            payload_exists: (data[3] & 0x10) != 0,
            continuity_counter: data[3] & 0x0F,
        })
    }
}

// ============================================================================
// Adaptation Field
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct AdaptationField {
    /// Length byte; the field occupies `length + 1` bytes
    pub length: u8,
    pub discontinuity: bool,
    pub random_access: bool,
    /// 27 MHz
    pub pcr: Option<u64>,
}

impl AdaptationField {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let length = *data.first()?;
        if length == 0 || data.len() < length as usize + 1 {
            return Some(Self {
                length,
                ..Default::default()
            });
        }

        let flags = data[1];
        let pcr = if flags & 0x10 != 0 && length >= 7 {
            // 33-bit base, 6 reserved, 9-bit extension
            let base = ((data[2] as u64) << 25)
                | ((data[3] as u64) << 17)
                | ((data[4] as u64) << 9)
                | ((data[5] as u64) << 1)
                | ((data[6] as u64) >> 7);
            let ext = (((data[6] as u64) & 0x01) << 8) | data[7] as u64;
            Some(base * 300 + ext)
        } else {
            None
        };

        Some(Self {
            length,
            discontinuity: flags & 0x80 != 0,
            random_access: flags & 0x40 != 0,
            pcr,
        })
    }
}

// ============================================================================
// PES Timestamps
// ============================================================================

/// Decodes the 5-byte marker-bit PTS/DTS layout into a 33-bit 90 kHz value.
pub fn decode_pes_timestamp(b: &[u8; 5]) -> u64 {
    (((b[0] as u64) & 0x0E) << 29)
        | ((b[1] as u64) << 22)
        | (((b[2] as u64) & 0xFE) << 14)
        | ((b[3] as u64) << 7)
        | ((b[4] as u64) >> 1)
}

/// Encodes a 33-bit value with the `0010` PTS-only prefix and marker bits.
pub fn encode_pes_timestamp(v: u64) -> [u8; 5] {
    let v = v & 0x1_FFFF_FFFF;
    [
        0x21 | ((v >> 29) & 0x0E) as u8,
        ((v >> 22) & 0xFF) as u8,
        (((v >> 14) & 0xFE) | 0x01) as u8,
        ((v >> 7) & 0xFF) as u8,
        (((v << 1) & 0xFE) | 0x01) as u8,
    ]
}

fn has_optional_header(stream_id: u8) -> bool {
    !matches!(
        stream_id,
        STREAM_ID_PROGRAM_MAP
            | STREAM_ID_PADDING
            | STREAM_ID_PRIVATE_2
            | STREAM_ID_ECM
            | STREAM_ID_EMM
            | STREAM_ID_DSMCC
            | STREAM_ID_H222_E
            | STREAM_ID_DIRECTORY
    )
}

fn parse_pes(pid: u16, buffer: Bytes, random_access: bool) -> Option<PesUnit> {
    if buffer.len() < 6 || buffer[..3] != PES_START_CODE {
        return None;
    }
    let stream_id = buffer[3];
    let pes_len = ((buffer[4] as usize) << 8) | buffer[5] as usize;

    let (pts, header_len) = if has_optional_header(stream_id) {
        if buffer.len() < 9 {
            return None;
        }
        let header_len = 9 + buffer[8] as usize;
        let pts = if buffer[7] & 0x80 != 0 && buffer.len() >= 14 {
            let mut raw = [0u8; 5];
            raw.copy_from_slice(&buffer[9..14]);
            Some(decode_pes_timestamp(&raw))
        } else {
            None
        };
        (pts, header_len)
    } else {
        (None, 6)
    };

    if header_len > buffer.len() {
        return None;
    }
    let declared_len = (pes_len != 0).then(|| (pes_len + 6).saturating_sub(header_len));

    Some(PesUnit {
        pid,
        stream_id,
        pts,
        declared_len,
        random_access,
        payload: buffer.slice(header_len..),
    })
}

// ============================================================================
// TS Demuxer
// ============================================================================

#[derive(Default)]
struct PidState {
    /// Last accepted continuity counter
    last_cc: Option<u8>,
    buffer: BytesMut,
    in_unit: bool,
    random_access: bool,
}

pub struct TsDemuxer {
    pids: HashMap<u16, PidState>,
    packets: usize,
    continuity_errors: usize,
}

impl TsDemuxer {
    pub fn new(pids: impl IntoIterator<Item = u16>) -> Self {
        Self {
            pids: pids.into_iter().map(|pid| (pid, PidState::default())).collect(),
            packets: 0,
            continuity_errors: 0,
        }
    }

    pub fn continuity_errors(&self) -> usize {
        self.continuity_errors
    }

    pub fn packets_seen(&self) -> usize {
        self.packets
    }

    /// Feeds one 192-byte source packet. Returns the previous unit of the
    /// packet's PID when this packet starts a new one.
    pub fn push_packet(&mut self, packet: &[u8]) -> Result<Option<PesUnit>, DemuxError> {
        if packet.len() < PACKET_SIZE {
            return Err(DemuxError::ShortPacket { len: packet.len() });
        }
        let ts = &packet[TS_OFFSET..PACKET_SIZE];
        let header = TsHeader::parse(ts).ok_or(DemuxError::SyncByte {
            offset: TS_OFFSET,
            found: ts[0],
        })?;
        self.packets += 1;

        let Some(state) = self.pids.get_mut(&header.pid) else {
            return Ok(None);
        };

        let mut payload_offset = TS_HEADER_SIZE;
        let mut adaptation = AdaptationField::default();
        if header.adaptation_field_exists {
            if let Some(af) = AdaptationField::parse(&ts[TS_HEADER_SIZE..]) {
                payload_offset += 1 + af.length as usize;
                adaptation = af;
            }
        }

        if !header.payload_exists {
            return Ok(None);
        }

        // continuity only advances on packets that carry payload
        let cc = header.continuity_counter;
        match state.last_cc {
            Some(_) if adaptation.discontinuity => {}
            Some(last) => {
                let expected = (last + 1) % 16;
                if cc != expected {
                    let err = ContinuityError {
                        pid: header.pid,
                        expected,
                        found: cc,
                    };
                    tracing::warn!(error = %err, packet = self.packets, "continuity check failed");
                    self.continuity_errors += 1;
                }
            }
            None => {}
        }
        state.last_cc = Some(cc);

        if payload_offset >= ts.len() {
            tracing::debug!(pid = header.pid, "adaptation field fills the packet");
            return Ok(None);
        }
        let payload = &ts[payload_offset..];

        let unit_start = header.payload_unit_start && payload.starts_with(&PES_START_CODE);
        if unit_start {
            let previous = Self::take_unit(header.pid, state);
            state.buffer.extend_from_slice(payload);
            state.in_unit = true;
            state.random_access = adaptation.random_access;
            return Ok(previous);
        }

        if state.in_unit {
            state.buffer.extend_from_slice(payload);
        }
        Ok(None)
    }

    fn take_unit(pid: u16, state: &mut PidState) -> Option<PesUnit> {
        if !state.in_unit {
            return None;
        }
        state.in_unit = false;
        let buffer = state.buffer.split().freeze();
        let unit = parse_pes(pid, buffer, state.random_access);
        if unit.is_none() {
            tracing::warn!(pid, "dropping malformed PES header");
        }
        unit
    }

    /// Flushes every buffered unit at end of input.
    pub fn finish(&mut self) -> Vec<PesUnit> {
        let mut pids: Vec<u16> = self.pids.keys().copied().collect();
        pids.sort_unstable();
        pids.into_iter()
            .filter_map(|pid| {
                let state = self.pids.get_mut(&pid)?;
                Self::take_unit(pid, state)
            })
            .collect()
    }

    /// Discards all partial units and continuity state.
    pub fn reset(&mut self) {
        for state in self.pids.values_mut() {
            *state = PidState::default();
        }
    }
}
