//! Clip Information (CLPI) parser
//!
//! A `.clpi` file describes one `.m2ts` clip:
//! - ClipInfo: stream type, recording rate, source packet count
//! - SequenceInfo: ATC/STC sequences with presentation start/end (45 kHz)
//! - ProgramInfo: every elementary stream in the clip with its coding attributes
//! - CPI: the EP-map, a coarse/fine index from PTS to source packet number

use crate::cursor::{read_bd_header, BdHeader, ByteCursor, FormatError, FormatResult};
use serde::Serialize;

pub const CLPI_TAG: &str = "HDMV";
const CLIP_INFO_OFFSET: usize = 40;

// ============================================================================
// Coding Types
// ============================================================================

pub mod coding_type {
    pub const MPEG1_VIDEO: u8 = 0x01;
    pub const MPEG2_VIDEO: u8 = 0x02;
    pub const MPEG1_AUDIO: u8 = 0x03;
    pub const MPEG2_AUDIO: u8 = 0x04;
    pub const H264: u8 = 0x1b;
    pub const MVC: u8 = 0x20;
    pub const HEVC: u8 = 0x24;
    pub const VC1: u8 = 0xea;
    pub const LPCM: u8 = 0x80;
    pub const AC3: u8 = 0x81;
    pub const DTS: u8 = 0x82;
    pub const TRUEHD: u8 = 0x83;
    pub const EAC3: u8 = 0x84;
    pub const DTSHD: u8 = 0x85;
    pub const DTSHD_MASTER: u8 = 0x86;
    pub const EAC3_SECONDARY: u8 = 0xa1;
    pub const DTSHD_SECONDARY: u8 = 0xa2;
    pub const PG: u8 = 0x90;
    pub const IG: u8 = 0x91;
    pub const TEXT_SUBTITLE: u8 = 0x92;

    pub fn is_video(ct: u8) -> bool {
        matches!(ct, MPEG1_VIDEO | MPEG2_VIDEO | H264 | MVC | HEVC | VC1)
    }

    pub fn is_audio(ct: u8) -> bool {
        matches!(
            ct,
            MPEG1_AUDIO
                | MPEG2_AUDIO
                | LPCM
                | AC3
                | DTS
                | TRUEHD
                | EAC3
                | DTSHD
                | DTSHD_MASTER
                | EAC3_SECONDARY
                | DTSHD_SECONDARY
        )
    }

    pub fn is_graphics(ct: u8) -> bool {
        matches!(ct, PG | IG)
    }
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ClipInfo {
    pub header: BdHeader,
    pub clip: ClipDetails,
    pub sequence: SequenceInfo,
    pub programs: ProgramInfo,
    /// Absent when the clip carries no CPI section.
    pub cpi: Option<CpiInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClipDetails {
    pub clip_stream_type: u8,
    pub application_type: u8,
    pub is_atc_delta: bool,
    pub ts_recording_rate: u32,
    pub num_source_packets: u32,
    pub ts_type_info: Option<TsTypeInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TsTypeInfo {
    pub validity: u8,
    pub format_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SequenceInfo {
    pub atc_sequences: Vec<AtcSequence>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AtcSequence {
    pub spn_atc_start: u32,
    pub offset_stc_id: u8,
    pub stc_sequences: Vec<StcSequence>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StcSequence {
    pub pcr_pid: u16,
    pub spn_stc_start: u32,
    /// 45 kHz
    pub presentation_start_time: u32,
    /// 45 kHz
    pub presentation_end_time: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgramInfo {
    pub programs: Vec<Program>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Program {
    pub spn_program_sequence_start: u32,
    pub program_map_pid: u16,
    pub num_groups: u8,
    pub streams: Vec<ProgramStream>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramStream {
    pub pid: u16,
    pub coding_type: u8,
    pub attrs: StreamAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StreamAttributes {
    Video {
        format: u8,
        rate: u8,
        aspect: u8,
        oc_flag: bool,
        hdr: Option<HdrInfo>,
    },
    Audio {
        format: u8,
        rate: u8,
        language: String,
    },
    Graphics {
        language: String,
    },
    Text {
        char_code: u8,
        language: String,
    },
    Unknown,
}

impl StreamAttributes {
    pub fn language(&self) -> Option<&str> {
        match self {
            StreamAttributes::Audio { language, .. }
            | StreamAttributes::Graphics { language }
            | StreamAttributes::Text { language, .. } => Some(language),
            _ => None,
        }
    }
}

/// Extra attributes carried by HEVC (UHD) video streams.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HdrInfo {
    pub cr_flag: bool,
    pub dynamic_range_type: u8,
    pub color_space: u8,
    pub hdr_plus_flag: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpiInfo {
    pub cpi_type: u8,
    pub entries: Vec<EpMapEntry>,
}

/// EP-map for one stream PID. Both tables are sorted ascending by PTS.
#[derive(Debug, Clone, Serialize)]
pub struct EpMapEntry {
    pub pid: u16,
    pub ep_stream_type: u8,
    pub coarse: Vec<CoarseEntry>,
    pub fine: Vec<FineEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoarseEntry {
    /// 18 bits: index of the first fine entry covered by this coarse entry
    pub ref_ep_fine_id: u32,
    /// 14 bits: PTS bits 32..19 (90 kHz), i.e. 45 kHz value >> 18
    pub pts_ep: u16,
    pub spn_ep: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FineEntry {
    pub is_angle_change_point: bool,
    /// 3 bits
    pub i_end_position_offset: u8,
    /// 11 bits: 45 kHz value >> 8, low part
    pub pts_ep: u16,
    /// 17 bits: low part of the source packet number
    pub spn_ep: u32,
}

impl ClipInfo {
    /// Presentation start of the first STC sequence, 45 kHz.
    pub fn presentation_start(&self) -> u32 {
        self.first_stc().map(|s| s.presentation_start_time).unwrap_or(0)
    }

    pub fn presentation_end(&self) -> u32 {
        self.first_stc().map(|s| s.presentation_end_time).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        self.presentation_end().saturating_sub(self.presentation_start()) as f64 / 45_000.0
    }

    fn first_stc(&self) -> Option<&StcSequence> {
        self.sequence
            .atc_sequences
            .first()
            .and_then(|atc| atc.stc_sequences.first())
    }

    pub fn ep_map(&self, pid: u16) -> Option<&EpMapEntry> {
        self.cpi.as_ref()?.entries.iter().find(|e| e.pid == pid)
    }

    pub fn stream_count(&self) -> usize {
        self.programs.programs.iter().map(|p| p.streams.len()).sum()
    }
}

// ============================================================================
// Parser
// ============================================================================

pub fn parse_clip_info(data: &[u8]) -> FormatResult<ClipInfo> {
    let mut cur = ByteCursor::new(data);
    let header = read_bd_header(&mut cur, CLPI_TAG)?;

    let sequence_start = cur.read_offset()?;
    let program_start = cur.read_offset()?;
    let cpi_start = cur.read_offset()?;
    let _clip_mark_start = cur.read_offset()?;
    let _extension_start = cur.read_offset()?;

    cur.seek(CLIP_INFO_OFFSET)?;
    let clip = parse_clip_details(&mut cur)?;

    cur.seek(sequence_start)?;
    let sequence = parse_sequence_info(&mut cur)?;

    cur.seek(program_start)?;
    let programs = parse_program_info(&mut cur)?;

    let cpi = if cpi_start == 0 {
        None
    } else {
        cur.seek(cpi_start)?;
        parse_cpi(&mut cur)?
    };

    Ok(ClipInfo {
        header,
        clip,
        sequence,
        programs,
        cpi,
    })
}

fn parse_clip_details(cur: &mut ByteCursor<'_>) -> FormatResult<ClipDetails> {
    let len = cur.read_u32()? as usize;
    cur.check_span(len)?;
    cur.skip(2)?;
    let clip_stream_type = cur.read_u8()?;
    let application_type = cur.read_u8()?;
    // 31 reserved bits, then the ATC delta flag
    let is_atc_delta = cur.read_u32()? & 0x01 != 0;
    let ts_recording_rate = cur.read_u32()?;
    let num_source_packets = cur.read_u32()?;
    cur.skip(128)?;

    let ts_len = cur.read_u16()? as usize;
    let pos = cur.position();
    cur.check_span(ts_len)?;
    let ts_type_info = if ts_len >= 5 {
        Some(TsTypeInfo {
            validity: cur.read_u8()?,
            format_id: cur.read_fixed_string(4)?,
        })
    } else {
        None
    };
    cur.seek(pos + ts_len)?;

    Ok(ClipDetails {
        clip_stream_type,
        application_type,
        is_atc_delta,
        ts_recording_rate,
        num_source_packets,
        ts_type_info,
    })
}

fn parse_sequence_info(cur: &mut ByteCursor<'_>) -> FormatResult<SequenceInfo> {
    let len = cur.read_u32()? as usize;
    cur.check_span(len)?;
    cur.skip(1)?;
    let num_atc = cur.read_u8()?;

    let mut atc_sequences = Vec::with_capacity(num_atc as usize);
    for _ in 0..num_atc {
        let spn_atc_start = cur.read_u32()?;
        let num_stc = cur.read_u8()?;
        let offset_stc_id = cur.read_u8()?;

        let mut stc_sequences = Vec::with_capacity(num_stc as usize);
        for _ in 0..num_stc {
            stc_sequences.push(StcSequence {
                pcr_pid: cur.read_u16()?,
                spn_stc_start: cur.read_u32()?,
                presentation_start_time: cur.read_u32()?,
                presentation_end_time: cur.read_u32()?,
            });
        }

        atc_sequences.push(AtcSequence {
            spn_atc_start,
            offset_stc_id,
            stc_sequences,
        });
    }

    Ok(SequenceInfo { atc_sequences })
}

fn parse_program_info(cur: &mut ByteCursor<'_>) -> FormatResult<ProgramInfo> {
    let len = cur.read_u32()? as usize;
    cur.check_span(len)?;
    cur.skip(1)?;
    let num_programs = cur.read_u8()?;

    let mut programs = Vec::with_capacity(num_programs as usize);
    for _ in 0..num_programs {
        let spn_program_sequence_start = cur.read_u32()?;
        let program_map_pid = cur.read_u16()?;
        let num_streams = cur.read_u8()?;
        let num_groups = cur.read_u8()?;

        let mut streams = Vec::with_capacity(num_streams as usize);
        for _ in 0..num_streams {
            let pid = cur.read_u16()?;
            let (coding_type, attrs) = parse_stream_attributes(cur)?;
            streams.push(ProgramStream {
                pid,
                coding_type,
                attrs,
            });
        }

        programs.push(Program {
            spn_program_sequence_start,
            program_map_pid,
            num_groups,
            streams,
        });
    }

    Ok(ProgramInfo { programs })
}

fn parse_stream_attributes(cur: &mut ByteCursor<'_>) -> FormatResult<(u8, StreamAttributes)> {
    let len = cur.read_u8()? as usize;
    let pos = cur.position();
    cur.check_span(len)?;
    if len == 0 {
        return Ok((0, StreamAttributes::Unknown));
    }

    let coding_type = cur.read_u8()?;
    let attrs = if coding_type::is_video(coding_type) {
        let b = cur.read_u8()?;
        let format = b >> 4;
        let rate = b & 0x0f;
        let b = cur.read_u8()?;
        let aspect = b >> 4;
        let oc_flag = b & 0x02 != 0;
        let hdr = if coding_type == coding_type::HEVC {
            let cr_flag = b & 0x01 != 0;
            let b = cur.read_u8()?;
            let hdr_plus_flag = cur.read_u8()? & 0x80 != 0;
            Some(HdrInfo {
                cr_flag,
                dynamic_range_type: b >> 4,
                color_space: b & 0x0f,
                hdr_plus_flag,
            })
        } else {
            None
        };
        StreamAttributes::Video {
            format,
            rate,
            aspect,
            oc_flag,
            hdr,
        }
    } else if coding_type::is_audio(coding_type) {
        let b = cur.read_u8()?;
        StreamAttributes::Audio {
            format: b >> 4,
            rate: b & 0x0f,
            language: cur.read_fixed_string(3)?,
        }
    } else if coding_type::is_graphics(coding_type) {
        StreamAttributes::Graphics {
            language: cur.read_fixed_string(3)?,
        }
    } else if coding_type == coding_type::TEXT_SUBTITLE {
        StreamAttributes::Text {
            char_code: cur.read_u8()?,
            language: cur.read_fixed_string(3)?,
        }
    } else {
        tracing::debug!(coding_type, "unrecognized stream coding type");
        StreamAttributes::Unknown
    };

    cur.seek(pos + len)?;
    Ok((coding_type, attrs))
}

fn parse_cpi(cur: &mut ByteCursor<'_>) -> FormatResult<Option<CpiInfo>> {
    let len = cur.read_u32()? as usize;
    if len == 0 {
        return Ok(None);
    }
    cur.check_span(len)?;

    // 12 reserved bits + 4-bit CPI type
    let cpi_type = (cur.read_u16()? & 0x0f) as u8;
    let ep_map_start = cur.position();
    cur.skip(1)?;
    let num_stream_pid = cur.read_u8()?;

    struct StreamHeader {
        pid: u16,
        ep_stream_type: u8,
        num_coarse: usize,
        num_fine: usize,
        start: usize,
    }

    let mut headers = Vec::with_capacity(num_stream_pid as usize);
    for _ in 0..num_stream_pid {
        let pid = cur.read_u16()?;
        // 10 reserved, 4 stream type, 16 coarse count, 18 fine count
        let packed = cur.read_u48()?;
        let start = cur.read_u32()? as usize;
        headers.push(StreamHeader {
            pid,
            ep_stream_type: ((packed >> 34) & 0x0f) as u8,
            num_coarse: ((packed >> 18) & 0xffff) as usize,
            num_fine: (packed & 0x3ffff) as usize,
            start,
        });
    }

    let mut entries = Vec::with_capacity(headers.len());
    for header in headers {
        let stream_start = ep_map_start + header.start;
        cur.seek(stream_start)?;
        let fine_start = cur.read_u32()? as usize;

        let mut coarse = Vec::with_capacity(header.num_coarse);
        for _ in 0..header.num_coarse {
            let packed = cur.read_u32()?;
            coarse.push(CoarseEntry {
                ref_ep_fine_id: packed >> 14,
                pts_ep: (packed & 0x3fff) as u16,
                spn_ep: cur.read_u32()?,
            });
        }

        cur.seek(stream_start + fine_start)?;
        let mut fine = Vec::with_capacity(header.num_fine);
        for _ in 0..header.num_fine {
            let packed = cur.read_u32()?;
            fine.push(FineEntry {
                is_angle_change_point: packed >> 31 != 0,
                i_end_position_offset: ((packed >> 28) & 0x07) as u8,
                pts_ep: ((packed >> 17) & 0x7ff) as u16,
                spn_ep: packed & 0x1ffff,
            });
        }

        if let Some(bad) = coarse.iter().position(|c| c.ref_ep_fine_id as usize > fine.len()) {
            return Err(FormatError::InvalidValue {
                offset: stream_start,
                what: format!(
                    "coarse entry {} of pid {:#06x} references fine entry beyond {}",
                    bad,
                    header.pid,
                    fine.len()
                ),
            });
        }
        if coarse.windows(2).any(|w| w[0].pts_ep > w[1].pts_ep) {
            tracing::warn!(pid = header.pid, "EP-map coarse entries not sorted by PTS");
        }

        entries.push(EpMapEntry {
            pid: header.pid,
            ep_stream_type: header.ep_stream_type,
            coarse,
            fine,
        });
    }

    Ok(Some(CpiInfo { cpi_type, entries }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};

    /// Builds a minimal but well-formed CLPI file.
    pub(crate) struct ClpiBuilder {
        pub start: u32,
        pub end: u32,
        pub streams: Vec<(u16, u8)>,
        pub ep_pid: u16,
        pub coarse: Vec<(u32, u16, u32)>,
        pub fine: Vec<(u16, u32)>,
    }

    impl Default for ClpiBuilder {
        fn default() -> Self {
            Self {
                start: 27_000_000,
                end: 27_000_000 + 45_000 * 60,
                streams: vec![(0x1011, coding_type::H264), (0x1100, coding_type::LPCM), (0x1200, coding_type::PG)],
                ep_pid: 0x1011,
                coarse: vec![],
                fine: vec![],
            }
        }
    }

    fn attrs_for(coding: u8) -> Vec<u8> {
        let mut a = vec![coding];
        if coding_type::is_video(coding) {
            a.extend_from_slice(&[0x61, 0x30]);
        } else if coding_type::is_audio(coding) {
            a.push(0x31);
            a.extend_from_slice(b"eng");
        } else if coding_type::is_graphics(coding) {
            a.extend_from_slice(b"fra");
        }
        a
    }

    impl ClpiBuilder {
        pub fn build(&self) -> Vec<u8> {
            // clip info block
            let mut clip = Vec::new();
            let mut body = Vec::new();
            body.write_u16::<BigEndian>(0).unwrap();
            body.push(1); // stream type
            body.push(1); // application type
            body.write_u32::<BigEndian>(0).unwrap();
            body.write_u32::<BigEndian>(48_000_000).unwrap();
            body.write_u32::<BigEndian>(1000).unwrap();
            body.extend_from_slice(&[0u8; 128]);
            body.write_u16::<BigEndian>(5).unwrap();
            body.push(0x80);
            body.extend_from_slice(b"HDMV");
            clip.write_u32::<BigEndian>(body.len() as u32).unwrap();
            clip.extend_from_slice(&body);

            // sequence info
            let mut seq_body = vec![0u8, 1];
            seq_body.write_u32::<BigEndian>(0).unwrap();
            seq_body.push(1);
            seq_body.push(0);
            seq_body.write_u16::<BigEndian>(0x1001).unwrap();
            seq_body.write_u32::<BigEndian>(0).unwrap();
            seq_body.write_u32::<BigEndian>(self.start).unwrap();
            seq_body.write_u32::<BigEndian>(self.end).unwrap();
            let mut seq = Vec::new();
            seq.write_u32::<BigEndian>(seq_body.len() as u32).unwrap();
            seq.extend_from_slice(&seq_body);

            // program info
            let mut prog_body = vec![0u8, 1];
            prog_body.write_u32::<BigEndian>(0).unwrap();
            prog_body.write_u16::<BigEndian>(0x0100).unwrap();
            prog_body.push(self.streams.len() as u8);
            prog_body.push(0);
            for (pid, coding) in &self.streams {
                prog_body.write_u16::<BigEndian>(*pid).unwrap();
                let attrs = attrs_for(*coding);
                prog_body.push(attrs.len() as u8);
                prog_body.extend_from_slice(&attrs);
            }
            let mut prog = Vec::new();
            prog.write_u32::<BigEndian>(prog_body.len() as u32).unwrap();
            prog.extend_from_slice(&prog_body);

            // cpi
            let mut ep_map = vec![0u8, 1];
            ep_map.write_u16::<BigEndian>(self.ep_pid).unwrap();
            let packed: u64 = (1u64 << 34) | ((self.coarse.len() as u64) << 18) | self.fine.len() as u64;
            ep_map.write_uint::<BigEndian>(packed, 6).unwrap();
            // one 12-byte stream header after the 2-byte preamble
            ep_map.write_u32::<BigEndian>(14).unwrap();
            let fine_start = 4 + self.coarse.len() * 8;
            ep_map.write_u32::<BigEndian>(fine_start as u32).unwrap();
            for (fine_ref, pts, spn) in &self.coarse {
                ep_map.write_u32::<BigEndian>((fine_ref << 14) | *pts as u32).unwrap();
                ep_map.write_u32::<BigEndian>(*spn).unwrap();
            }
            for (pts, spn) in &self.fine {
                ep_map.write_u32::<BigEndian>(((*pts as u32) << 17) | spn).unwrap();
            }
            let mut cpi = Vec::new();
            cpi.write_u32::<BigEndian>((ep_map.len() + 2) as u32).unwrap();
            cpi.write_u16::<BigEndian>(1).unwrap();
            cpi.extend_from_slice(&ep_map);

            let seq_start = 40 + clip.len();
            let prog_start = seq_start + seq.len();
            let cpi_start = prog_start + prog.len();

            let mut out = Vec::new();
            out.extend_from_slice(b"HDMV0200");
            out.write_u32::<BigEndian>(seq_start as u32).unwrap();
            out.write_u32::<BigEndian>(prog_start as u32).unwrap();
            out.write_u32::<BigEndian>(cpi_start as u32).unwrap();
            out.write_u32::<BigEndian>(0).unwrap();
            out.write_u32::<BigEndian>(0).unwrap();
            out.resize(40, 0);
            out.extend_from_slice(&clip);
            out.extend_from_slice(&seq);
            out.extend_from_slice(&prog);
            out.extend_from_slice(&cpi);
            out
        }
    }

    #[test]
    fn parses_synthetic_clip() {
        let builder = ClpiBuilder {
            coarse: vec![(0, 100, 0x0002_0000), (2, 102, 0x0004_0000)],
            fine: vec![(0, 0), (0x400, 0x100), (0, 0x10), (0x200, 0x200)],
            ..Default::default()
        };
        let clpi = parse_clip_info(&builder.build()).unwrap();

        assert_eq!(clpi.header.tag, "HDMV");
        assert_eq!(clpi.clip.num_source_packets, 1000);
        assert_eq!(clpi.clip.ts_type_info.as_ref().unwrap().format_id, "HDMV");
        assert_eq!(clpi.presentation_start(), 27_000_000);
        assert!((clpi.duration_secs() - 60.0).abs() < 1e-9);

        // declared stream count round-trips
        assert_eq!(clpi.programs.programs.len(), 1);
        assert_eq!(clpi.stream_count(), 3);
        let streams = &clpi.programs.programs[0].streams;
        assert_eq!(streams[0].coding_type, coding_type::H264);
        assert!(matches!(streams[0].attrs, StreamAttributes::Video { format: 6, rate: 1, aspect: 3, .. }));
        assert_eq!(streams[1].attrs.language(), Some("eng"));
        assert_eq!(streams[2].attrs.language(), Some("fra"));

        let ep = clpi.ep_map(0x1011).unwrap();
        assert_eq!(ep.ep_stream_type, 1);
        assert_eq!(ep.coarse.len(), 2);
        assert_eq!(ep.coarse[1], CoarseEntry { ref_ep_fine_id: 2, pts_ep: 102, spn_ep: 0x0004_0000 });
        assert_eq!(ep.fine[1].pts_ep, 0x400);
        assert_eq!(ep.fine[3].spn_ep, 0x200);
    }

    #[test]
    fn rejects_bad_tag() {
        let mut data = ClpiBuilder::default().build();
        data[0..4].copy_from_slice(b"MPLS");
        let err = parse_clip_info(&data).unwrap_err();
        assert!(matches!(err, FormatError::BadTag { offset: 0, .. }));
    }

    #[test]
    fn truncated_file_reports_offset() {
        let data = ClpiBuilder::default().build();
        let err = parse_clip_info(&data[..data.len() - 4]).unwrap_err();
        assert!(matches!(err, FormatError::LengthMismatch { .. }));
        assert!(err.offset() > 40);

        // section pointers past the end are caught while reading the header
        let err = parse_clip_info(&data[..60]).unwrap_err();
        assert_eq!(err.offset(), 8);
    }
}
