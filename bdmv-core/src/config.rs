//! Player configuration
//!
//! Stored as JSON. Missing fields take their defaults, a missing file is
//! the default configuration.

use crate::stream_map::StreamSelection;
use crate::ts_demux::PACKET_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Packets in one gigabyte, the default read chunk.
pub const GIGABYTE_PACKETS: usize = (1 << 30) / PACKET_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Playback region, stored in PSR20.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Region {
    A,
    #[default]
    B,
    C,
}

impl Region {
    pub fn code(self) -> u32 {
        match self {
            Region::A => 1,
            Region::B => 2,
            Region::C => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Transport packets per buffered read
    pub chunk_packets: usize,
    /// Bound of the session message channel
    pub channel_capacity: usize,
    /// Commands per VM run before control returns to the caller
    pub vm_step_limit: usize,
    pub video_stream: usize,
    pub audio_stream: usize,
    pub subtitle_stream: usize,
    pub subtitles: bool,
    pub region: Region,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            chunk_packets: GIGABYTE_PACKETS,
            channel_capacity: 1,
            vm_step_limit: 100_000,
            video_stream: 0,
            audio_stream: 0,
            subtitle_stream: 0,
            subtitles: true,
            region: Region::B,
        }
    }
}

impl PlayerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn selection(&self) -> StreamSelection {
        StreamSelection {
            video: self.video_stream,
            audio: self.audio_stream,
            subtitle: self.subtitles.then_some(self.subtitle_stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PlayerConfig::default();
        assert_eq!(config.chunk_packets, 5_592_405);
        assert_eq!(config.channel_capacity, 1);
        assert_eq!(config.region.code(), 2);
        assert_eq!(config.selection().subtitle, Some(0));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bdmv.json");
        std::fs::write(&path, r#"{ "region": "A", "subtitles": false, "audio_stream": 1 }"#).unwrap();

        let config = PlayerConfig::load(&path).unwrap();
        assert_eq!(config.region, Region::A);
        assert_eq!(config.vm_step_limit, 100_000);
        let sel = config.selection();
        assert_eq!(sel.audio, 1);
        assert_eq!(sel.subtitle, None);
    }

    #[test]
    fn missing_file_is_default_and_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert_eq!(PlayerConfig::load(&path).unwrap(), PlayerConfig::default());

        let config = PlayerConfig {
            chunk_packets: 64,
            region: Region::C,
            ..PlayerConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PlayerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(PlayerConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
