//! Presentation Graphics Stream (PGS) subtitle decoder
//!
//! Segments arrive one per PES unit. A display set accumulates palette,
//! object, composition and window segments and is emitted, rasterized to
//! RGBA, when the END segment arrives.

pub mod rle;

use crate::cursor::{ByteCursor, FormatError};
use crate::elementary::Timebase;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

pub const SEGMENT_PALETTE: u8 = 0x14;
pub const SEGMENT_OBJECT: u8 = 0x15;
pub const SEGMENT_COMPOSITION: u8 = 0x16;
pub const SEGMENT_WINDOW: u8 = 0x17;
pub const SEGMENT_END: u8 = 0x80;

const SEGMENT_HEADER_SIZE: usize = 3;
const OBJECT_DATA_OFFSET: usize = 14;

// ============================================================================
// Errors
// ============================================================================

/// Offsets are byte positions inside the segment buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubtitleDecodeError {
    #[error("segment truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("object at byte {offset} is not a single fragment (flags {flags:#04x})")]
    ObjectNotSingleFragment { offset: usize, flags: u8 },
    #[error("object data length at byte {offset}: declared {declared}, have {actual}")]
    ObjectLengthMismatch {
        offset: usize,
        declared: usize,
        actual: usize,
    },
    #[error("end of line at byte {offset} after {pixels} pixels (width {width})")]
    LineEndMismatch {
        offset: usize,
        pixels: usize,
        width: usize,
    },
    #[error("not enough pixels decoded at byte {offset}: {actual} < {expected}")]
    NotEnoughPixels {
        offset: usize,
        expected: usize,
        actual: usize,
    },
}

impl SubtitleDecodeError {
    fn shifted(self, by: usize) -> Self {
        use SubtitleDecodeError::*;
        match self {
            Truncated { offset } => Truncated { offset: offset + by },
            ObjectNotSingleFragment { offset, flags } => ObjectNotSingleFragment {
                offset: offset + by,
                flags,
            },
            ObjectLengthMismatch {
                offset,
                declared,
                actual,
            } => ObjectLengthMismatch {
                offset: offset + by,
                declared,
                actual,
            },
            LineEndMismatch {
                offset,
                pixels,
                width,
            } => LineEndMismatch {
                offset: offset + by,
                pixels,
                width,
            },
            NotEnoughPixels {
                offset,
                expected,
                actual,
            } => NotEnoughPixels {
                offset: offset + by,
                expected,
                actual,
            },
        }
    }
}

impl From<FormatError> for SubtitleDecodeError {
    fn from(e: FormatError) -> Self {
        SubtitleDecodeError::Truncated { offset: e.offset() }
    }
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PaletteInfo {
    pub id: u8,
    pub version: u8,
    /// entry id → RGBA
    pub entries: BTreeMap<u8, [u8; 4]>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectInfo {
    pub id: u16,
    pub version: u8,
    pub width: u16,
    pub height: u16,
    /// Palette index per pixel, row-major
    #[serde(skip)]
    pub indices: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompositionState {
    Normal,
    AcquisitionPoint,
    EpochStart,
    Reserved,
}

impl From<u8> for CompositionState {
    fn from(bits: u8) -> Self {
        match bits {
            0 => CompositionState::Normal,
            1 => CompositionState::AcquisitionPoint,
            2 => CompositionState::EpochStart,
            _ => CompositionState::Reserved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositionObject {
    pub object_id: u16,
    pub window_id: u8,
    pub forced_on: bool,
    pub x: u16,
    pub y: u16,
    pub crop: Option<Rect>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompositionInfo {
    pub video_width: u16,
    pub video_height: u16,
    pub frame_rate: u8,
    pub number: u16,
    pub state: CompositionState,
    pub palette_update: bool,
    pub palette_id: u8,
    pub objects: Vec<CompositionObject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub id: u8,
    pub rect: Rect,
}

#[derive(Debug, Clone, Serialize)]
pub struct RgbaBitmap {
    pub width: u16,
    pub height: u16,
    #[serde(skip)]
    pub pixels: Vec<u8>,
}

/// One finished subtitle picture. Immutable once emitted.
#[derive(Debug, Clone, Serialize)]
pub struct DisplaySet {
    pub timestamp_us: i64,
    pub palette: PaletteInfo,
    pub object: ObjectInfo,
    pub composition: Option<CompositionInfo>,
    pub windows: Vec<Window>,
    pub bitmap: RgbaBitmap,
}

// ============================================================================
// Colour
// ============================================================================

/// BT.709 limited-range YCbCr to RGB.
pub fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = 1.164 * (y as f32 - 16.0);
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;
    let clamp = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    [
        clamp(y + 1.793 * cr),
        clamp(y - 0.213 * cb - 0.533 * cr),
        clamp(y + 2.112 * cb),
    ]
}

// ============================================================================
// Decoder
// ============================================================================

#[derive(Default)]
struct PendingDisplaySet {
    timestamp_us: Option<i64>,
    palette: Option<PaletteInfo>,
    object: Option<ObjectInfo>,
    composition: Option<CompositionInfo>,
    windows: Vec<Window>,
}

impl PendingDisplaySet {
    fn is_ready(&self) -> bool {
        self.object.is_some() && self.palette.is_some()
    }
}

pub struct PgsSubtitleDecoder {
    timebase: Timebase,
    pending: PendingDisplaySet,
    emitted: usize,
}

impl PgsSubtitleDecoder {
    pub fn new(timebase: Timebase) -> Self {
        Self {
            timebase,
            pending: PendingDisplaySet::default(),
            emitted: 0,
        }
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Discards any partially accumulated display set.
    pub fn reset(&mut self) {
        self.pending = PendingDisplaySet::default();
    }

    /// Processes one complete segment. `pts` is the 90 kHz PTS of its PES unit.
    pub fn decode_segment(
        &mut self,
        segment: &[u8],
        pts: Option<u64>,
    ) -> Result<Option<DisplaySet>, SubtitleDecodeError> {
        match self.apply(segment, pts) {
            Ok(done) => Ok(done),
            Err(e) => {
                tracing::warn!(error = %e, "dropping PGS display set");
                self.reset();
                Err(e)
            }
        }
    }

    fn apply(&mut self, segment: &[u8], pts: Option<u64>) -> Result<Option<DisplaySet>, SubtitleDecodeError> {
        let mut cur = ByteCursor::new(segment);
        let kind = cur.read_u8()?;
        let len = cur.read_u16()? as usize;
        if len > cur.remaining() {
            return Err(SubtitleDecodeError::Truncated {
                offset: segment.len(),
            });
        }
        let segment = &segment[..SEGMENT_HEADER_SIZE + len];
        let mut cur = ByteCursor::new(segment);
        cur.seek(SEGMENT_HEADER_SIZE)?;

        match kind {
            SEGMENT_PALETTE => self.pending.palette = Some(parse_palette(&mut cur, len)?),
            SEGMENT_OBJECT => self.pending.object = Some(parse_object(segment)?),
            SEGMENT_COMPOSITION => {
                self.pending.composition = Some(parse_composition(&mut cur)?);
                let base = self.timebase.base90();
                self.pending.timestamp_us = Some(self.timebase.to_us(pts.unwrap_or(base)));
            }
            SEGMENT_WINDOW => self.pending.windows = parse_windows(&mut cur)?,
            SEGMENT_END => return Ok(self.finish(pts)),
            other => tracing::debug!(segment_type = other, "ignoring PGS segment"),
        }
        Ok(None)
    }

    fn finish(&mut self, pts: Option<u64>) -> Option<DisplaySet> {
        if !self.pending.is_ready() {
            tracing::debug!(
                object = self.pending.object.is_some(),
                palette = self.pending.palette.is_some(),
                "END segment before object and palette"
            );
            return None;
        }
        let pending = std::mem::take(&mut self.pending);
        let (Some(palette), Some(object)) = (pending.palette, pending.object) else {
            return None;
        };

        let mut pixels = Vec::with_capacity(object.indices.len() * 4);
        for idx in &object.indices {
            pixels.extend_from_slice(palette.entries.get(idx).unwrap_or(&[0, 0, 0, 0]));
        }
        let timestamp_us = pending
            .timestamp_us
            .or_else(|| pts.map(|p| self.timebase.to_us(p)))
            .unwrap_or(0);

        self.emitted += 1;
        Some(DisplaySet {
            timestamp_us,
            bitmap: RgbaBitmap {
                width: object.width,
                height: object.height,
                pixels,
            },
            palette,
            object,
            composition: pending.composition,
            windows: pending.windows,
        })
    }
}

fn parse_palette(cur: &mut ByteCursor<'_>, len: usize) -> Result<PaletteInfo, SubtitleDecodeError> {
    let id = cur.read_u8()?;
    let version = cur.read_u8()?;
    let count = len.saturating_sub(2) / 5;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let entry = cur.read_u8()?;
        let y = cur.read_u8()?;
        let cr = cur.read_u8()?;
        let cb = cur.read_u8()?;
        let alpha = cur.read_u8()?;
        let [r, g, b] = ycbcr_to_rgb(y, cb, cr);
        entries.insert(entry, [r, g, b, alpha]);
    }
    Ok(PaletteInfo { id, version, entries })
}

fn parse_object(segment: &[u8]) -> Result<ObjectInfo, SubtitleDecodeError> {
    let mut cur = ByteCursor::new(segment);
    cur.seek(SEGMENT_HEADER_SIZE)?;
    let id = cur.read_u16()?;
    let version = cur.read_u8()?;

    let flags_at = cur.position();
    let flags = cur.read_u8()?;
    if flags & 0xC0 != 0xC0 {
        return Err(SubtitleDecodeError::ObjectNotSingleFragment {
            offset: flags_at,
            flags,
        });
    }

    let len_at = cur.position();
    let declared = cur.read_u24()? as usize;
    let actual = segment.len().saturating_sub(10);
    if declared != actual {
        return Err(SubtitleDecodeError::ObjectLengthMismatch {
            offset: len_at,
            declared,
            actual,
        });
    }

    let width = cur.read_u16()?;
    let height = cur.read_u16()?;
    let indices = rle::decode(&segment[OBJECT_DATA_OFFSET..], width, height)
        .map_err(|e| e.shifted(OBJECT_DATA_OFFSET))?;

    Ok(ObjectInfo {
        id,
        version,
        width,
        height,
        indices,
    })
}

fn parse_rect(cur: &mut ByteCursor<'_>) -> Result<Rect, SubtitleDecodeError> {
    Ok(Rect {
        x: cur.read_u16()?,
        y: cur.read_u16()?,
        width: cur.read_u16()?,
        height: cur.read_u16()?,
    })
}

fn parse_composition(cur: &mut ByteCursor<'_>) -> Result<CompositionInfo, SubtitleDecodeError> {
    let video_width = cur.read_u16()?;
    let video_height = cur.read_u16()?;
    let frame_rate = cur.read_u8()? >> 4;
    let number = cur.read_u16()?;
    let state = CompositionState::from(cur.read_u8()? >> 6);
    let palette_update = cur.read_u8()? & 0x80 != 0;
    let palette_id = cur.read_u8()?;
    let count = cur.read_u8()?;

    let mut objects = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let object_id = cur.read_u16()?;
        let window_id = cur.read_u8()?;
        let flags = cur.read_u8()?;
        let x = cur.read_u16()?;
        let y = cur.read_u16()?;
        let crop = if flags & 0x80 != 0 {
            Some(parse_rect(cur)?)
        } else {
            None
        };
        objects.push(CompositionObject {
            object_id,
            window_id,
            forced_on: flags & 0x40 != 0,
            x,
            y,
            crop,
        });
    }

    Ok(CompositionInfo {
        video_width,
        video_height,
        frame_rate,
        number,
        state,
        palette_update,
        palette_id,
        objects,
    })
}

fn parse_windows(cur: &mut ByteCursor<'_>) -> Result<Vec<Window>, SubtitleDecodeError> {
    let count = cur.read_u8()?;
    (0..count)
        .map(|_| {
            Ok(Window {
                id: cur.read_u8()?,
                rect: parse_rect(cur)?,
            })
        })
        .collect()
}
