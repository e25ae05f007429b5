//! Disc index (`index.bdmv`, tag INDX)
//!
//! Maps first play, top menu and every title number to either an HDMV movie
//! object or a BD-J application.

use crate::cursor::{read_bd_header, BdHeader, ByteCursor, FormatError, FormatResult};
use serde::Serialize;

pub const INDX_TAG: &str = "INDX";
const APP_INFO_OFFSET: usize = 40;

const OBJECT_TYPE_HDMV: u8 = 1;
const OBJECT_TYPE_BDJ: u8 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct IndexRoot {
    pub header: BdHeader,
    pub app_info: IndexAppInfo,
    pub first_play: Option<IndexObject>,
    pub top_menu: Option<IndexObject>,
    pub titles: Vec<IndexTitle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexAppInfo {
    pub initial_output_mode_preference: bool,
    pub content_exist_flag: bool,
    pub initial_dynamic_range_type: u8,
    pub video_format: u8,
    pub frame_rate: u8,
    pub user_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum IndexObject {
    Hdmv { playback_type: u8, id_ref: u16 },
    Bdj { playback_type: u8, name: String },
}

impl IndexObject {
    pub fn hdmv_ref(&self) -> Option<u16> {
        match self {
            IndexObject::Hdmv { id_ref, .. } => Some(*id_ref),
            IndexObject::Bdj { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexTitle {
    pub access_type: u8,
    pub object: IndexObject,
}

impl IndexRoot {
    /// Titles are numbered from 1.
    pub fn title(&self, number: u32) -> Option<&IndexTitle> {
        let idx = (number as usize).checked_sub(1)?;
        self.titles.get(idx)
    }
}

pub fn parse_index(data: &[u8]) -> FormatResult<IndexRoot> {
    let mut cur = ByteCursor::new(data);
    let header = read_bd_header(&mut cur, INDX_TAG)?;

    let indexes_start = cur.read_offset()?;
    let _extension_start = cur.read_offset()?;

    cur.seek(APP_INFO_OFFSET)?;
    let app_info = parse_app_info(&mut cur)?;

    cur.seek(indexes_start)?;
    let len = cur.read_u32()? as usize;
    cur.check_span(len)?;

    let first_play = parse_object(&mut cur)?;
    let top_menu = parse_object(&mut cur)?;

    let num_titles = cur.read_u16()?;
    let mut titles = Vec::with_capacity(num_titles as usize);
    for _ in 0..num_titles {
        let at = cur.position();
        let bits = cur.read_u32()?;
        let object_type = (bits >> 30) as u8;
        let access_type = ((bits >> 28) & 0x03) as u8;
        let object = parse_object_body(&mut cur, object_type)?.ok_or_else(|| {
            FormatError::InvalidValue {
                offset: at,
                what: format!("title object type {}", object_type),
            }
        })?;
        titles.push(IndexTitle {
            access_type,
            object,
        });
    }

    Ok(IndexRoot {
        header,
        app_info,
        first_play,
        top_menu,
        titles,
    })
}

fn parse_app_info(cur: &mut ByteCursor<'_>) -> FormatResult<IndexAppInfo> {
    let len = cur.read_u32()? as usize;
    let pos = cur.position();
    cur.check_span(len)?;
    if len != 34 {
        tracing::warn!(len, "unexpected index app info length");
    }

    let flags = cur.read_u8()?;
    let video = cur.read_u8()?;
    let user_data = cur.read_bytes(32)?.to_vec();
    cur.seek(pos + len)?;

    Ok(IndexAppInfo {
        initial_output_mode_preference: flags & 0x40 != 0,
        content_exist_flag: flags & 0x20 != 0,
        initial_dynamic_range_type: flags & 0x0f,
        video_format: video >> 4,
        frame_rate: video & 0x0f,
        user_data,
    })
}

/// First play and top menu: a 4-byte type word followed by an 8-byte body.
fn parse_object(cur: &mut ByteCursor<'_>) -> FormatResult<Option<IndexObject>> {
    let object_type = (cur.read_u32()? >> 30) as u8;
    parse_object_body(cur, object_type)
}

fn parse_object_body(cur: &mut ByteCursor<'_>, object_type: u8) -> FormatResult<Option<IndexObject>> {
    let start = cur.position();
    let object = match object_type {
        OBJECT_TYPE_HDMV => {
            let playback_type = (cur.read_u16()? >> 14) as u8;
            let id_ref = cur.read_u16()?;
            Some(IndexObject::Hdmv {
                playback_type,
                id_ref,
            })
        }
        OBJECT_TYPE_BDJ => {
            let playback_type = (cur.read_u16()? >> 14) as u8;
            let name = cur.read_fixed_string(5)?;
            Some(IndexObject::Bdj {
                playback_type,
                name,
            })
        }
        _ => None,
    };
    cur.seek(start + 8)?;
    Ok(object)
}
