//! H.264 NAL unit utilities
//!
//! Blu-ray video PES payloads are Annex B byte streams: NAL units separated by
//! 3-byte (00 00 01) or 4-byte (00 00 00 01) start codes.

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// A start code found in a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartCode {
    /// Offset of the first zero byte
    pub offset: usize,
    /// 3 or 4
    pub len: usize,
}

impl StartCode {
    /// Offset of the NAL header byte.
    pub fn nal_offset(&self) -> usize {
        self.offset + self.len
    }
}

/// Finds every start code, preferring the 4-byte form when a zero precedes it.
pub fn find_start_codes(data: &[u8]) -> Vec<StartCode> {
    let mut codes = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if i > 0 && data[i - 1] == 0 && codes.last().map_or(true, |c: &StartCode| c.nal_offset() < i) {
                codes.push(StartCode { offset: i - 1, len: 4 });
            } else {
                codes.push(StartCode { offset: i, len: 3 });
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    codes
}

/// The `nal_unit_type` of every NAL unit in the stream, in order.
pub fn nal_types(data: &[u8]) -> Vec<u8> {
    find_start_codes(data)
        .into_iter()
        .filter_map(|sc| data.get(sc.nal_offset()).map(|h| h & 0x1F))
        .collect()
}

/// True when the access unit carries an IDR slice.
pub fn contains_idr(data: &[u8]) -> bool {
    nal_types(data).contains(&NAL_IDR)
}

/// Check if data starts with an Annex B start code
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0x00, 0x00, 0x00, 0x01]) || data.starts_with(&[0x00, 0x00, 0x01])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_both_start_code_forms() {
        let data = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88];
        let codes = find_start_codes(&data);
        assert_eq!(
            codes,
            vec![
                StartCode { offset: 0, len: 4 },
                StartCode { offset: 6, len: 3 },
                StartCode { offset: 11, len: 4 },
            ]
        );
        assert_eq!(nal_types(&data), vec![NAL_SPS, NAL_PPS, NAL_IDR]);
        assert!(contains_idr(&data));
    }

    #[test]
    fn delta_frame_is_not_idr() {
        let data = [0, 0, 0, 1, 0x09, 0xf0, 0, 0, 1, 0x41, 0x9a];
        assert_eq!(nal_types(&data), vec![NAL_AUD, NAL_SLICE]);
        assert!(!contains_idr(&data));
    }

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb(&[0x00, 0x00, 0x00, 0x05, 0x67]));
    }
}
