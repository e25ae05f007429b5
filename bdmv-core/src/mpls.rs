//! Movie PlayList (MPLS) parser
//!
//! A playlist sequences play items (clip + in/out time), carries the per-item
//! stream number table (STN), the sub-paths for out-of-mux streams and the
//! chapter marks.

use crate::clpi::{coding_type, HdrInfo, StreamAttributes};
use crate::cursor::{read_bd_header, BdHeader, ByteCursor, FormatResult};
use serde::Serialize;

pub const MPLS_TAG: &str = "MPLS";
const APP_INFO_OFFSET: usize = 40;

// ============================================================================
// Types
// ============================================================================

/// User-operation mask. Only the documented bits are meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UoMask(pub u64);

impl UoMask {
    pub fn is_set(&self, bit: u8) -> bool {
        bit < 64 && self.0 & (1u64 << (63 - bit)) != 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Playlist {
    pub header: BdHeader,
    pub app_info: PlaylistAppInfo,
    pub play_items: Vec<PlayItem>,
    pub sub_paths: Vec<SubPath>,
    pub marks: Vec<PlayMark>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistAppInfo {
    pub playback_type: u8,
    /// Only meaningful for random (2) and shuffle (3) playback.
    pub playback_count: u16,
    pub uo_mask: UoMask,
    pub random_access_flag: bool,
    pub audio_mix_flag: bool,
    pub lossless_bypass_flag: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipRef {
    pub clip_id: String,
    pub codec_id: String,
    pub stc_id: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayItem {
    pub clip_id: String,
    pub codec_id: String,
    pub is_multi_angle: bool,
    pub connection_condition: u8,
    pub stc_id: u8,
    /// 45 kHz
    pub in_time: u32,
    /// 45 kHz
    pub out_time: u32,
    pub uo_mask: UoMask,
    pub random_access_flag: bool,
    pub still_mode: u8,
    pub still_time: u16,
    pub is_different_audio: bool,
    pub is_seamless_angle: bool,
    /// Alternative angles, excluding angle 1 (the item's own clip).
    pub angles: Vec<ClipRef>,
    pub stn: StreamTable,
}

impl PlayItem {
    pub fn duration_secs(&self) -> f64 {
        self.out_time.saturating_sub(self.in_time) as f64 / 45_000.0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamTable {
    pub video: Vec<StreamEntry>,
    pub audio: Vec<StreamEntry>,
    /// Presentation graphics followed by picture-in-picture PG entries.
    pub pg: Vec<StreamEntry>,
    pub ig: Vec<StreamEntry>,
    pub secondary_audio: Vec<SecondaryAudioEntry>,
    pub secondary_video: Vec<SecondaryVideoEntry>,
    pub num_pip_pg: u8,
    pub dv: Vec<StreamEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StreamSource {
    PlayItem { pid: u16 },
    SubPath { sub_path_id: u8, sub_clip_id: u8, pid: u16 },
    SubPathInMux { sub_path_id: u8, pid: u16 },
    Unknown { kind: u8 },
}

impl StreamSource {
    pub fn pid(&self) -> Option<u16> {
        match self {
            StreamSource::PlayItem { pid }
            | StreamSource::SubPath { pid, .. }
            | StreamSource::SubPathInMux { pid, .. } => Some(*pid),
            StreamSource::Unknown { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEntry {
    pub source: StreamSource,
    pub coding_type: u8,
    pub attrs: StreamAttributes,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecondaryAudioEntry {
    pub stream: StreamEntry,
    pub primary_audio_refs: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecondaryVideoEntry {
    pub stream: StreamEntry,
    pub secondary_audio_refs: Vec<u8>,
    pub pip_pg_refs: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubPath {
    pub sub_path_type: u8,
    pub is_repeat: bool,
    pub items: Vec<SubPlayItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubPlayItem {
    pub clip_id: String,
    pub codec_id: String,
    pub connection_condition: u8,
    pub is_multi_clip: bool,
    pub stc_id: u8,
    pub in_time: u32,
    pub out_time: u32,
    pub sync_play_item_id: u16,
    pub sync_pts: u32,
    /// Additional clips when `is_multi_clip` is set.
    pub clips: Vec<ClipRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlayMark {
    pub mark_type: u8,
    pub play_item_ref: u16,
    /// 45 kHz, on the referenced play item's clip timeline
    pub time: u32,
    pub entry_es_pid: u16,
    pub duration: u32,
}

pub const MARK_TYPE_ENTRY: u8 = 1;
pub const MARK_TYPE_LINK: u8 = 2;

impl Playlist {
    /// Entry marks, i.e. chapters.
    pub fn chapters(&self) -> impl Iterator<Item = &PlayMark> {
        self.marks.iter().filter(|m| m.mark_type == MARK_TYPE_ENTRY)
    }

    pub fn duration_secs(&self) -> f64 {
        self.play_items.iter().map(PlayItem::duration_secs).sum()
    }
}

// ============================================================================
// Parser
// ============================================================================

pub fn parse_playlist(data: &[u8]) -> FormatResult<Playlist> {
    let mut cur = ByteCursor::new(data);
    let header = read_bd_header(&mut cur, MPLS_TAG)?;

    let list_start = cur.read_offset()?;
    let mark_start = cur.read_offset()?;
    let _extension_start = cur.read_offset()?;

    cur.seek(APP_INFO_OFFSET)?;
    let app_info = parse_app_info(&mut cur)?;

    cur.seek(list_start)?;
    let (play_items, sub_paths) = parse_play_list(&mut cur)?;

    cur.seek(mark_start)?;
    let marks = parse_marks(&mut cur)?;

    Ok(Playlist {
        header,
        app_info,
        play_items,
        sub_paths,
        marks,
    })
}

fn parse_app_info(cur: &mut ByteCursor<'_>) -> FormatResult<PlaylistAppInfo> {
    let len = cur.read_u32()? as usize;
    cur.check_span(len)?;
    cur.skip(1)?;
    let playback_type = cur.read_u8()?;
    let count = cur.read_u16()?;
    let playback_count = if playback_type == 2 || playback_type == 3 {
        count
    } else {
        0
    };
    let uo_mask = UoMask(cur.read_u64()?);
    let flags = cur.read_u8()?;
    cur.skip(1)?;

    Ok(PlaylistAppInfo {
        playback_type,
        playback_count,
        uo_mask,
        random_access_flag: flags & 0x80 != 0,
        audio_mix_flag: flags & 0x40 != 0,
        lossless_bypass_flag: flags & 0x20 != 0,
    })
}

fn parse_play_list(cur: &mut ByteCursor<'_>) -> FormatResult<(Vec<PlayItem>, Vec<SubPath>)> {
    let len = cur.read_u32()? as usize;
    cur.check_span(len)?;
    cur.skip(2)?;
    let item_count = cur.read_u16()?;
    let sub_count = cur.read_u16()?;

    let mut items = Vec::with_capacity(item_count as usize);
    for _ in 0..item_count {
        items.push(parse_play_item(cur)?);
    }

    let mut sub_paths = Vec::with_capacity(sub_count as usize);
    for _ in 0..sub_count {
        sub_paths.push(parse_sub_path(cur)?);
    }

    Ok((items, sub_paths))
}

fn parse_clip_ref(cur: &mut ByteCursor<'_>) -> FormatResult<ClipRef> {
    Ok(ClipRef {
        clip_id: cur.read_fixed_string(5)?,
        codec_id: cur.read_fixed_string(4)?,
        stc_id: cur.read_u8()?,
    })
}

fn parse_play_item(cur: &mut ByteCursor<'_>) -> FormatResult<PlayItem> {
    let len = cur.read_u16()? as usize;
    let pos = cur.position();
    cur.check_span(len)?;

    let clip_id = cur.read_fixed_string(5)?;
    let codec_id = cur.read_fixed_string(4)?;
    // 11 reserved bits, multi-angle, 4-bit connection condition
    let bits = cur.read_u16()?;
    let is_multi_angle = bits & 0x10 != 0;
    let connection_condition = (bits & 0x0f) as u8;
    let stc_id = cur.read_u8()?;
    let in_time = cur.read_u32()?;
    let out_time = cur.read_u32()?;
    let uo_mask = UoMask(cur.read_u64()?);
    let random_access_flag = cur.read_u8()? & 0x80 != 0;
    let still_mode = cur.read_u8()?;
    let still_time = cur.read_u16()?;

    let mut angles = Vec::new();
    let mut is_different_audio = false;
    let mut is_seamless_angle = false;
    if is_multi_angle {
        let angle_count = cur.read_u8()?;
        let flags = cur.read_u8()?;
        is_different_audio = flags & 0x02 != 0;
        is_seamless_angle = flags & 0x01 != 0;
        for _ in 1..angle_count {
            angles.push(parse_clip_ref(cur)?);
        }
    }

    let stn = parse_stn_table(cur)?;
    cur.seek(pos + len)?;

    Ok(PlayItem {
        clip_id,
        codec_id,
        is_multi_angle,
        connection_condition,
        stc_id,
        in_time,
        out_time,
        uo_mask,
        random_access_flag,
        still_mode,
        still_time,
        is_different_audio,
        is_seamless_angle,
        angles,
        stn,
    })
}

fn parse_stn_table(cur: &mut ByteCursor<'_>) -> FormatResult<StreamTable> {
    let len = cur.read_u16()? as usize;
    let pos = cur.position();
    cur.check_span(len)?;
    cur.skip(2)?;

    let num_video = cur.read_u8()?;
    let num_audio = cur.read_u8()?;
    let num_pg = cur.read_u8()?;
    let num_ig = cur.read_u8()?;
    let num_secondary_audio = cur.read_u8()?;
    let num_secondary_video = cur.read_u8()?;
    let num_pip_pg = cur.read_u8()?;
    let num_dv = cur.read_u8()?;
    cur.skip(4)?;

    let mut table = StreamTable {
        num_pip_pg,
        ..Default::default()
    };

    for _ in 0..num_video {
        table.video.push(parse_stream_entry(cur)?);
    }
    for _ in 0..num_audio {
        table.audio.push(parse_stream_entry(cur)?);
    }
    for _ in 0..(num_pg as usize + num_pip_pg as usize) {
        table.pg.push(parse_stream_entry(cur)?);
    }
    for _ in 0..num_ig {
        table.ig.push(parse_stream_entry(cur)?);
    }
    for _ in 0..num_secondary_audio {
        let stream = parse_stream_entry(cur)?;
        let primary_audio_refs = parse_ref_list(cur)?;
        table.secondary_audio.push(SecondaryAudioEntry {
            stream,
            primary_audio_refs,
        });
    }
    for _ in 0..num_secondary_video {
        let stream = parse_stream_entry(cur)?;
        let secondary_audio_refs = parse_ref_list(cur)?;
        let pip_pg_refs = parse_ref_list(cur)?;
        table.secondary_video.push(SecondaryVideoEntry {
            stream,
            secondary_audio_refs,
            pip_pg_refs,
        });
    }
    for _ in 0..num_dv {
        table.dv.push(parse_stream_entry(cur)?);
    }

    cur.seek(pos + len)?;
    Ok(table)
}

/// `count, reserved, ids..., [pad]` where the list is padded to an even length.
fn parse_ref_list(cur: &mut ByteCursor<'_>) -> FormatResult<Vec<u8>> {
    let count = cur.read_u8()?;
    cur.skip(1)?;
    let refs = cur.read_bytes(count as usize)?.to_vec();
    if count % 2 == 1 {
        cur.skip(1)?;
    }
    Ok(refs)
}

fn parse_stream_entry(cur: &mut ByteCursor<'_>) -> FormatResult<StreamEntry> {
    let len = cur.read_u8()? as usize;
    let pos = cur.position();
    cur.check_span(len)?;

    let kind = cur.read_u8()?;
    let source = match kind {
        1 => StreamSource::PlayItem {
            pid: cur.read_u16()?,
        },
        2 => StreamSource::SubPath {
            sub_path_id: cur.read_u8()?,
            sub_clip_id: cur.read_u8()?,
            pid: cur.read_u16()?,
        },
        3 | 4 => StreamSource::SubPathInMux {
            sub_path_id: cur.read_u8()?,
            pid: cur.read_u16()?,
        },
        _ => {
            tracing::debug!(kind, "unknown stream entry type");
            StreamSource::Unknown { kind }
        }
    };
    cur.seek(pos + len)?;

    let (coding_type, attrs) = parse_stream_attrs(cur)?;
    Ok(StreamEntry {
        source,
        coding_type,
        attrs,
    })
}

fn parse_stream_attrs(cur: &mut ByteCursor<'_>) -> FormatResult<(u8, StreamAttributes)> {
    let len = cur.read_u8()? as usize;
    let pos = cur.position();
    cur.check_span(len)?;
    if len == 0 {
        return Ok((0, StreamAttributes::Unknown));
    }

    let ct = cur.read_u8()?;
    let attrs = if coding_type::is_video(ct) {
        let b = cur.read_u8()?;
        let hdr = if ct == coding_type::HEVC {
            let ranges = cur.read_u8()?;
            let flags = cur.read_u8()?;
            Some(HdrInfo {
                dynamic_range_type: ranges >> 4,
                color_space: ranges & 0x0f,
                cr_flag: flags & 0x80 != 0,
                hdr_plus_flag: flags & 0x40 != 0,
            })
        } else {
            None
        };
        StreamAttributes::Video {
            format: b >> 4,
            rate: b & 0x0f,
            aspect: 0,
            oc_flag: false,
            hdr,
        }
    } else if coding_type::is_audio(ct) {
        let b = cur.read_u8()?;
        StreamAttributes::Audio {
            format: b >> 4,
            rate: b & 0x0f,
            language: cur.read_fixed_string(3)?,
        }
    } else if coding_type::is_graphics(ct) {
        StreamAttributes::Graphics {
            language: cur.read_fixed_string(3)?,
        }
    } else if ct == coding_type::TEXT_SUBTITLE {
        StreamAttributes::Text {
            char_code: cur.read_u8()?,
            language: cur.read_fixed_string(3)?,
        }
    } else {
        StreamAttributes::Unknown
    };

    cur.seek(pos + len)?;
    Ok((ct, attrs))
}

fn parse_sub_path(cur: &mut ByteCursor<'_>) -> FormatResult<SubPath> {
    let len = cur.read_u32()? as usize;
    let pos = cur.position();
    cur.check_span(len)?;
    cur.skip(1)?;
    let sub_path_type = cur.read_u8()?;
    let is_repeat = cur.read_u16()? & 0x01 != 0;
    cur.skip(1)?;
    let count = cur.read_u8()?;

    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(parse_sub_play_item(cur)?);
    }

    cur.seek(pos + len)?;
    Ok(SubPath {
        sub_path_type,
        is_repeat,
        items,
    })
}

fn parse_sub_play_item(cur: &mut ByteCursor<'_>) -> FormatResult<SubPlayItem> {
    let len = cur.read_u16()? as usize;
    let pos = cur.position();
    cur.check_span(len)?;

    let clip_id = cur.read_fixed_string(5)?;
    let codec_id = cur.read_fixed_string(4)?;
    // 27 reserved bits, 4-bit connection condition, multi-clip flag
    let bits = cur.read_u32()?;
    let connection_condition = ((bits >> 1) & 0x0f) as u8;
    let is_multi_clip = bits & 0x01 != 0;
    let stc_id = cur.read_u8()?;
    let in_time = cur.read_u32()?;
    let out_time = cur.read_u32()?;
    let sync_play_item_id = cur.read_u16()?;
    let sync_pts = cur.read_u32()?;

    let mut clips = Vec::new();
    if is_multi_clip {
        let count = cur.read_u8()?;
        cur.skip(1)?;
        for _ in 1..count {
            clips.push(parse_clip_ref(cur)?);
        }
    }

    cur.seek(pos + len)?;
    Ok(SubPlayItem {
        clip_id,
        codec_id,
        connection_condition,
        is_multi_clip,
        stc_id,
        in_time,
        out_time,
        sync_play_item_id,
        sync_pts,
        clips,
    })
}

fn parse_marks(cur: &mut ByteCursor<'_>) -> FormatResult<Vec<PlayMark>> {
    let len = cur.read_u32()? as usize;
    cur.check_span(len)?;
    let count = cur.read_u16()?;

    let mut marks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        cur.skip(1)?;
        marks.push(PlayMark {
            mark_type: cur.read_u8()?,
            play_item_ref: cur.read_u16()?,
            time: cur.read_u32()?,
            entry_es_pid: cur.read_u16()?,
            duration: cur.read_u32()?,
        });
    }
    Ok(marks)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cursor::FormatError;
    use byteorder::{BigEndian, WriteBytesExt};

    fn entry(pid: u16, coding: u8, attrs: &[u8]) -> Vec<u8> {
        let mut e = vec![3, 1];
        e.write_u16::<BigEndian>(pid).unwrap();
        e.push((attrs.len() + 1) as u8);
        e.push(coding);
        e.extend_from_slice(attrs);
        e
    }

    fn play_item(clip: &str, in_time: u32, out_time: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(clip.as_bytes());
        body.extend_from_slice(b"M2TS");
        body.write_u16::<BigEndian>(0x0001).unwrap();
        body.push(0);
        body.write_u32::<BigEndian>(in_time).unwrap();
        body.write_u32::<BigEndian>(out_time).unwrap();
        body.write_u64::<BigEndian>(0).unwrap();
        body.push(0);
        body.push(0);
        body.write_u16::<BigEndian>(0).unwrap();

        let mut stn = vec![0u8, 0];
        stn.extend_from_slice(&[1, 1, 1, 0, 0, 0, 0, 0]);
        stn.extend_from_slice(&[0; 4]);
        stn.extend(entry(0x1011, coding_type::H264, &[0x61]));
        stn.extend(entry(0x1100, coding_type::AC3, &[0x31, b'e', b'n', b'g']));
        stn.extend(entry(0x1200, coding_type::PG, b"deu"));
        body.write_u16::<BigEndian>(stn.len() as u16).unwrap();
        body.extend_from_slice(&stn);

        let mut out = Vec::new();
        out.write_u16::<BigEndian>(body.len() as u16).unwrap();
        out.extend_from_slice(&body);
        out
    }

    /// Two play items and a chapter on each.
    pub(crate) fn build_playlist(clips: &[&str]) -> Vec<u8> {
        let mut app = Vec::new();
        app.write_u32::<BigEndian>(14).unwrap();
        app.push(0);
        app.push(1);
        app.write_u16::<BigEndian>(0).unwrap();
        app.write_u64::<BigEndian>(0).unwrap();
        app.push(0x40);
        app.push(0);

        let mut list_body = vec![0u8, 0];
        list_body.write_u16::<BigEndian>(clips.len() as u16).unwrap();
        list_body.write_u16::<BigEndian>(0).unwrap();
        for (i, clip) in clips.iter().enumerate() {
            list_body.extend(play_item(clip, 27_000_000, 27_000_000 + 45_000 * 10 * (i as u32 + 1)));
        }
        let mut list = Vec::new();
        list.write_u32::<BigEndian>(list_body.len() as u32).unwrap();
        list.extend_from_slice(&list_body);

        let mut mark_body = Vec::new();
        mark_body.write_u16::<BigEndian>(clips.len() as u16 + 1).unwrap();
        for i in 0..clips.len() {
            mark_body.push(0);
            mark_body.push(MARK_TYPE_ENTRY);
            mark_body.write_u16::<BigEndian>(i as u16).unwrap();
            mark_body.write_u32::<BigEndian>(27_000_000 + 45_000 * 5).unwrap();
            mark_body.write_u16::<BigEndian>(0xffff).unwrap();
            mark_body.write_u32::<BigEndian>(0).unwrap();
        }
        mark_body.push(0);
        mark_body.push(MARK_TYPE_LINK);
        mark_body.write_u16::<BigEndian>(0).unwrap();
        mark_body.write_u32::<BigEndian>(27_000_000).unwrap();
        mark_body.write_u16::<BigEndian>(0xffff).unwrap();
        mark_body.write_u32::<BigEndian>(0).unwrap();
        let mut marks = Vec::new();
        marks.write_u32::<BigEndian>(mark_body.len() as u32).unwrap();
        marks.extend_from_slice(&mark_body);

        let list_start = 40 + app.len();
        let mark_start = list_start + list.len();
        let mut out = Vec::new();
        out.extend_from_slice(b"MPLS0200");
        out.write_u32::<BigEndian>(list_start as u32).unwrap();
        out.write_u32::<BigEndian>(mark_start as u32).unwrap();
        out.write_u32::<BigEndian>(0).unwrap();
        out.resize(40, 0);
        out.extend_from_slice(&app);
        out.extend_from_slice(&list);
        out.extend_from_slice(&marks);
        out
    }

    #[test]
    fn parses_items_streams_and_marks() {
        let pl = parse_playlist(&build_playlist(&["00001", "00002"])).unwrap();

        assert_eq!(pl.app_info.playback_type, 1);
        assert_eq!(pl.app_info.playback_count, 0);
        assert!(pl.app_info.audio_mix_flag);

        assert_eq!(pl.play_items.len(), 2);
        let item = &pl.play_items[1];
        assert_eq!(item.clip_id, "00002");
        assert_eq!(item.codec_id, "M2TS");
        assert_eq!(item.connection_condition, 1);
        assert!((item.duration_secs() - 20.0).abs() < 1e-9);

        assert_eq!(item.stn.video[0].source, StreamSource::PlayItem { pid: 0x1011 });
        assert_eq!(item.stn.audio[0].coding_type, coding_type::AC3);
        assert_eq!(item.stn.audio[0].attrs.language(), Some("eng"));
        assert_eq!(item.stn.pg[0].attrs.language(), Some("deu"));
        assert!(item.stn.ig.is_empty());

        assert_eq!(pl.marks.len(), 3);
        assert_eq!(pl.chapters().count(), 2);
        assert_eq!(pl.chapters().nth(1).unwrap().play_item_ref, 1);
    }

    #[test]
    fn rejects_wrong_tag() {
        let mut data = build_playlist(&["00001"]);
        data[0..4].copy_from_slice(b"INDX");
        assert!(matches!(
            parse_playlist(&data),
            Err(FormatError::BadTag { offset: 0, .. })
        ));
    }

    #[test]
    fn truncation_is_reported() {
        let data = build_playlist(&["00001"]);
        let err = parse_playlist(&data[..data.len() - 10]).unwrap_err();
        assert!(err.offset() > 40);
    }

    #[test]
    fn uo_mask_bits_count_from_msb() {
        let mask = UoMask(0x8000_0000_0000_0001);
        assert!(mask.is_set(0));
        assert!(mask.is_set(63));
        assert!(!mask.is_set(1));
    }
}
