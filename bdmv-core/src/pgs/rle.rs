//! PGS object run-length coding.
//!
//! ```text
//! CCCCCCCC                     one pixel of colour C (C != 0)
//! 00000000 00LLLLLL            L pixels of colour 0
//! 00000000 01LLLLLL LLLLLLLL   L pixels of colour 0
//! 00000000 10LLLLLL CCCCCCCC   L pixels of colour C
//! 00000000 11LLLLLL LLLLLLLL CCCCCCCC
//! 00000000 00000000            end of line
//! ```

use super::SubtitleDecodeError;

const MAX_RUN: usize = 0x3FFF;

/// Decodes `width × height` palette indices. Offsets in errors are relative to `data`.
pub fn decode(data: &[u8], width: u16, height: u16) -> Result<Vec<u8>, SubtitleDecodeError> {
    let width = width as usize;
    let expected = width * height as usize;
    let mut pixels = Vec::with_capacity(expected);
    let mut dropped = 0usize;
    let mut i = 0;

    let next = |i: &mut usize| -> Result<u8, SubtitleDecodeError> {
        let b = *data.get(*i).ok_or(SubtitleDecodeError::Truncated { offset: *i })?;
        *i += 1;
        Ok(b)
    };

    while i < data.len() {
        let at = i;
        let mut color = next(&mut i)?;
        let mut run = 1usize;

        if color == 0 {
            let flags = next(&mut i)?;
            run = (flags & 0x3f) as usize;
            if flags & 0x40 != 0 {
                run = (run << 8) + next(&mut i)? as usize;
            }
            color = if flags & 0x80 != 0 { next(&mut i)? } else { 0 };
        }

        if run > 0 {
            let room = expected - pixels.len();
            dropped += run.saturating_sub(room);
            pixels.extend(std::iter::repeat(color).take(run.min(room)));
        } else if width == 0 || pixels.len() % width != 0 {
            return Err(SubtitleDecodeError::LineEndMismatch {
                offset: at,
                pixels: pixels.len(),
                width,
            });
        }
    }

    if pixels.len() < expected {
        return Err(SubtitleDecodeError::NotEnoughPixels {
            offset: data.len(),
            expected,
            actual: pixels.len(),
        });
    }
    if dropped > 0 {
        tracing::warn!(expected, dropped, "PGS object runs overflow the bitmap");
    }
    Ok(pixels)
}

/// Encodes palette indices line by line, each line terminated by `00 00`.
pub fn encode(pixels: &[u8], width: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() / 2);
    if width == 0 {
        return out;
    }
    for line in pixels.chunks(width as usize) {
        let mut rest = line;
        while let Some(&color) = rest.first() {
            let count = rest.iter().take_while(|&&c| c == color).count();
            let mut left = count;
            while left > 0 {
                let n = left.min(MAX_RUN);
                write_run(&mut out, color, n);
                left -= n;
            }
            rest = &rest[count..];
        }
        out.extend_from_slice(&[0x00, 0x00]);
    }
    out
}

fn write_run(out: &mut Vec<u8>, color: u8, count: usize) {
    match (color, count) {
        (0, 1..=63) => out.extend_from_slice(&[0x00, count as u8]),
        (0, _) => out.extend_from_slice(&[0x00, 0x40 | (count >> 8) as u8, count as u8]),
        (_, 1) => out.push(color),
        (_, 2) => out.extend_from_slice(&[color, color]),
        (_, 3..=63) => out.extend_from_slice(&[0x00, 0x80 | count as u8, color]),
        (_, _) => out.extend_from_slice(&[0x00, 0xC0 | (count >> 8) as u8, count as u8, color]),
    }
}
