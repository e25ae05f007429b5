//! Per-session PID selection derived from a clip's program map.

use crate::clpi::{coding_type, ClipInfo, ProgramStream};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamMap {
    pub video: Vec<ProgramStream>,
    pub audio: Vec<ProgramStream>,
    pub subtitle: Vec<ProgramStream>,
}

/// Caller-chosen indices into each category of a [`StreamMap`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSelection {
    pub video: usize,
    pub audio: usize,
    /// `None` disables subtitles.
    pub subtitle: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SelectedPids {
    pub video: Option<u16>,
    pub audio: Option<u16>,
    pub subtitle: Option<u16>,
}

impl SelectedPids {
    pub fn contains(&self, pid: u16) -> bool {
        self.video == Some(pid) || self.audio == Some(pid) || self.subtitle == Some(pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        [self.video, self.audio, self.subtitle].into_iter().flatten()
    }
}

impl StreamMap {
    /// Groups the streams of the clip's first program by coding type.
    pub fn from_clip(clip: &ClipInfo) -> Self {
        let mut map = StreamMap::default();
        let Some(program) = clip.programs.programs.first() else {
            return map;
        };
        for stream in &program.streams {
            if coding_type::is_video(stream.coding_type) {
                map.video.push(stream.clone());
            } else if coding_type::is_audio(stream.coding_type) {
                map.audio.push(stream.clone());
            } else if stream.coding_type == coding_type::PG {
                map.subtitle.push(stream.clone());
            }
        }
        map
    }

    pub fn select(&self, selection: StreamSelection) -> SelectedPids {
        SelectedPids {
            video: self.video.get(selection.video).map(|s| s.pid),
            audio: self.audio.get(selection.audio).map(|s| s.pid),
            subtitle: selection
                .subtitle
                .and_then(|i| self.subtitle.get(i))
                .map(|s| s.pid),
        }
    }

    pub fn coding_type_of(&self, pid: u16) -> Option<u8> {
        self.video
            .iter()
            .chain(&self.audio)
            .chain(&self.subtitle)
            .find(|s| s.pid == pid)
            .map(|s| s.coding_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clpi::{parse_clip_info, tests::ClpiBuilder};

    fn clip() -> ClipInfo {
        let builder = ClpiBuilder {
            streams: vec![
                (0x1011, coding_type::H264),
                (0x1100, coding_type::LPCM),
                (0x1101, coding_type::AC3),
                (0x1200, coding_type::PG),
                (0x1400, coding_type::IG),
            ],
            ..Default::default()
        };
        parse_clip_info(&builder.build()).unwrap()
    }

    #[test]
    fn groups_by_coding_type() {
        let map = StreamMap::from_clip(&clip());
        assert_eq!(map.video.len(), 1);
        assert_eq!(map.audio.len(), 2);
        // IG is not a subtitle stream
        assert_eq!(map.subtitle.len(), 1);
        assert_eq!(map.coding_type_of(0x1101), Some(coding_type::AC3));
    }

    #[test]
    fn out_of_range_index_yields_none() {
        let map = StreamMap::from_clip(&clip());
        let pids = map.select(StreamSelection { video: 0, audio: 1, subtitle: Some(4) });
        assert_eq!(pids.video, Some(0x1011));
        assert_eq!(pids.audio, Some(0x1101));
        assert_eq!(pids.subtitle, None);
        assert!(pids.contains(0x1101));
        assert!(!pids.contains(0x1100));
        assert_eq!(pids.iter().count(), 2);
    }
}
