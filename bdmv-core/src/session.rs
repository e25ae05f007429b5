//! Demux sessions
//!
//! A session owns everything needed to turn one clip into messages: the
//! demuxer, the elementary assemblers, the subtitle decoder and the media
//! decoder. It runs on its own tokio task and posts [`SessionMessage`]s on
//! a bounded channel, so a slow consumer holds it back one unit at a time.
//! Nothing inside a session outlives it.

use crate::byte_store::{disc_path, ByteStore, StoreError};
use crate::clpi::{coding_type, parse_clip_info, ClipInfo};
use crate::config::PlayerConfig;
use crate::cursor::FormatError;
use crate::decode::{DecodeError, MediaDecoder, VideoFrame};
use crate::elementary::{LpcmAssembler, PcmFrame, Timebase, VideoAssembler};
use crate::pgs::{DisplaySet, PgsSubtitleDecoder};
use crate::seek::{SeekIndex, SeekPoint};
use crate::stream_map::{SelectedPids, StreamMap, StreamSelection};
use crate::ts_demux::{DemuxError, PesUnit, TsDemuxer, PACKET_SIZE, TS_SYNC_BYTE};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

const SYNC_OFFSET: usize = 4;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("clip info: {0}")]
    Format(#[from] FormatError),
    #[error("decoder: {0}")]
    Decode(#[from] DecodeError),
    #[error("demux: {0}")]
    Demux(#[from] DemuxError),
    #[error("session task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Five-digit clip name, e.g. `00001`
    pub clip_id: String,
    /// Relative to the clip's presentation start
    pub start_secs: f64,
    pub selection: StreamSelection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FinishReason {
    EndOfClip,
    /// A packet without the 0x47 sync byte
    SyncLost,
    DecoderFailed,
    /// Clip info or stream could not be loaded
    Failed,
    /// Stopped by its owner. Never posted.
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum DecodingMessage {
    ClipInfo(Arc<ClipInfo>),
    /// Seconds from the clip's presentation start to the first delivered unit
    StartTime(f64),
    Video(VideoFrame),
    Audio(PcmFrame),
    Subtitle(Arc<DisplaySet>),
    Finished(FinishReason),
}

#[derive(Debug, Clone)]
pub struct SessionMessage {
    /// Generation of the session that posted this
    pub session: u64,
    pub message: DecodingMessage,
}

/// Handle to a running session.
pub struct DemuxSession {
    id: u64,
    cancel: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: Option<JoinHandle<Result<FinishReason, SessionError>>>,
}

impl DemuxSession {
    pub fn spawn(
        store: Arc<dyn ByteStore>,
        request: SessionRequest,
        decoder: Box<dyn MediaDecoder>,
        config: &PlayerConfig,
        sender: mpsc::Sender<SessionMessage>,
        id: u64,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let task = SessionTask {
            store,
            request,
            decoder,
            chunk_packets: config.chunk_packets.max(1),
            outbox: Outbox {
                id,
                sender,
                cancel: cancel.clone(),
                wake: wake.clone(),
            },
        };
        tracing::info!(session = id, clip = %task.request.clip_id, start = task.request.start_secs, "session started");
        let handle = tokio::spawn(task.run());
        Self {
            id,
            cancel,
            wake,
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancels the session and waits for its task to exit. Once this
    /// returns the session posts nothing more.
    pub async fn stop(mut self) -> Result<FinishReason, SessionError> {
        self.cancel.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        let reason = self.wait().await;
        tracing::debug!(session = self.id, ?reason, "session stopped");
        reason
    }

    /// Waits for the session to run to completion.
    pub async fn join(mut self) -> Result<FinishReason, SessionError> {
        self.wait().await
    }

    async fn wait(&mut self) -> Result<FinishReason, SessionError> {
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| SessionError::Task(e.to_string()))?,
            None => Ok(FinishReason::Cancelled),
        }
    }
}

impl Drop for DemuxSession {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.store(true, Ordering::SeqCst);
            self.wake.notify_one();
        }
    }
}

// ============================================================================
// Session task
// ============================================================================

struct SessionTask {
    store: Arc<dyn ByteStore>,
    request: SessionRequest,
    decoder: Box<dyn MediaDecoder>,
    chunk_packets: usize,
    outbox: Outbox,
}

/// Sending half of a session. Kept apart from the decoder so that a
/// pending send borrows nothing that has to be `Sync`.
struct Outbox {
    id: u64,
    sender: mpsc::Sender<SessionMessage>,
    cancel: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

/// Per-clip demux state.
struct Pipeline {
    pids: SelectedPids,
    demuxer: TsDemuxer,
    video: VideoAssembler,
    audio: LpcmAssembler,
    subtitles: PgsSubtitleDecoder,
}

enum Flow {
    Continue,
    Stop(FinishReason),
}

impl SessionTask {
    async fn run(mut self) -> Result<FinishReason, SessionError> {
        let result = self.demux().await;
        let reason = match &result {
            Ok(reason) => *reason,
            Err(SessionError::Decode(_)) => FinishReason::DecoderFailed,
            Err(e) => {
                tracing::error!(session = self.outbox.id, error = %e, "session failed");
                FinishReason::Failed
            }
        };
        if reason != FinishReason::Cancelled {
            self.outbox.post(DecodingMessage::Finished(reason)).await;
        }
        tracing::debug!(session = self.outbox.id, ?reason, "session finished");
        result
    }

    async fn demux(&mut self) -> Result<FinishReason, SessionError> {
        let clip_id = self.request.clip_id.clone();
        let clpi = self.store.read_all(&disc_path::clip_info(&clip_id)).await?;
        let clip = Arc::new(parse_clip_info(&clpi)?);
        if !self.outbox.post(DecodingMessage::ClipInfo(clip.clone())).await {
            return Ok(FinishReason::Cancelled);
        }

        let map = StreamMap::from_clip(&clip);
        let mut pids = map.select(self.request.selection);
        if let Some(pid) = pids.audio {
            if map.coding_type_of(pid) != Some(coding_type::LPCM) {
                tracing::warn!(pid, "only LPCM audio is reassembled, audio disabled");
                pids.audio = None;
            }
        }

        let start = self.start_point(&clip, pids);
        let start_secs = start.pts.saturating_sub(clip.presentation_start() as u64) as f64 / 45_000.0;
        if !self.outbox.post(DecodingMessage::StartTime(start_secs)).await {
            return Ok(FinishReason::Cancelled);
        }
        tracing::debug!(session = self.outbox.id, packet = start.packet, pts = start.pts, ?pids, "demux start");

        let timebase = Timebase::from_45k(start.pts);
        let mut pipeline = Pipeline {
            pids,
            demuxer: TsDemuxer::new(pids.iter()),
            video: VideoAssembler::new(timebase),
            audio: LpcmAssembler::new(timebase),
            subtitles: PgsSubtitleDecoder::new(timebase),
        };

        let path = disc_path::stream(&clip_id);
        let size = self.store.len(&path).await?;
        let chunk_bytes = (self.chunk_packets * PACKET_SIZE) as u64;
        let start_byte = start.packet as u64 * PACKET_SIZE as u64;
        let mut offset = start_byte - start_byte % chunk_bytes;
        let mut skip = (start_byte - offset) as usize;

        while offset < size {
            let chunk = self
                .store
                .read_range(&path, offset, chunk_bytes as usize)
                .await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;

            for packet in chunk[skip.min(chunk.len())..].chunks(PACKET_SIZE) {
                if self.outbox.cancelled() {
                    return Ok(FinishReason::Cancelled);
                }
                if packet.len() < PACKET_SIZE {
                    tracing::warn!(len = packet.len(), "trailing partial packet ignored");
                    break;
                }
                if packet[SYNC_OFFSET] != TS_SYNC_BYTE {
                    tracing::warn!(
                        session = self.outbox.id,
                        packet = pipeline.demuxer.packets_seen(),
                        found = packet[SYNC_OFFSET],
                        "sync byte lost"
                    );
                    return Ok(FinishReason::SyncLost);
                }
                if let Some(unit) = pipeline.demuxer.push_packet(packet)? {
                    if let Flow::Stop(reason) = self.route(&mut pipeline, unit).await? {
                        return Ok(reason);
                    }
                }
            }
            skip = 0;
        }

        for unit in pipeline.demuxer.finish() {
            if let Flow::Stop(reason) = self.route(&mut pipeline, unit).await? {
                return Ok(reason);
            }
        }
        let frames = self.decoder.flush()?;
        if let Flow::Stop(reason) = self.outbox.post_frames(frames).await {
            return Ok(reason);
        }

        tracing::info!(
            session = self.outbox.id,
            packets = pipeline.demuxer.packets_seen(),
            continuity_errors = pipeline.demuxer.continuity_errors(),
            subtitles = pipeline.subtitles.emitted(),
            "end of clip"
        );
        Ok(FinishReason::EndOfClip)
    }

    fn start_point(&self, clip: &ClipInfo, pids: SelectedPids) -> SeekPoint {
        let index = SeekIndex::new(clip);
        let pid = pids
            .video
            .or_else(|| clip.cpi.as_ref().and_then(|c| c.entries.first()).map(|e| e.pid))
            .unwrap_or_default();
        index.lookup_seconds(pid, self.request.start_secs)
    }

    async fn route(&mut self, pipeline: &mut Pipeline, unit: PesUnit) -> Result<Flow, SessionError> {
        let pid = unit.pid;
        if Some(pid) == pipeline.pids.video {
            let Some(au) = pipeline.video.push(unit) else {
                return Ok(Flow::Continue);
            };
            if au.keyframe {
                let frames = self.decoder.flush()?;
                if let Flow::Stop(reason) = self.outbox.post_frames(frames).await {
                    return Ok(Flow::Stop(reason));
                }
            }
            let frames = self.decoder.decode(&au)?;
            return Ok(self.outbox.post_frames(frames).await);
        }

        if Some(pid) == pipeline.pids.audio {
            if let Some(frame) = pipeline.audio.push(unit) {
                return Ok(self.outbox.post_or_cancel(DecodingMessage::Audio(frame)).await);
            }
            return Ok(Flow::Continue);
        }

        if Some(pid) == pipeline.pids.subtitle {
            match pipeline.subtitles.decode_segment(&unit.payload, unit.pts) {
                Ok(Some(set)) => {
                    return Ok(self.outbox.post_or_cancel(DecodingMessage::Subtitle(Arc::new(set))).await)
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(pid, error = %e, "subtitle segment skipped"),
            }
        }
        Ok(Flow::Continue)
    }
}

impl Outbox {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Posts one message. False when the session was cancelled or nobody listens.
    async fn post(&self, message: DecodingMessage) -> bool {
        if self.cancelled() {
            return false;
        }
        let msg = SessionMessage {
            session: self.id,
            message,
        };
        tokio::select! {
            sent = self.sender.send(msg) => sent.is_ok(),
            _ = self.wake.notified() => false,
        }
    }

    async fn post_frames(&self, frames: Vec<VideoFrame>) -> Flow {
        for frame in frames {
            if let Flow::Stop(reason) = self.post_or_cancel(DecodingMessage::Video(frame)).await {
                return Flow::Stop(reason);
            }
        }
        Flow::Continue
    }

    async fn post_or_cancel(&self, message: DecodingMessage) -> Flow {
        if self.post(message).await {
            Flow::Continue
        } else {
            Flow::Stop(FinishReason::Cancelled)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::byte_store::MemoryStore;
    use crate::clpi::tests::ClpiBuilder;
    use crate::decode::PassthroughDecoder;
    use crate::pgs::tests::{composition, end, object, palette, window};
    use crate::ts_demux::tests::{packetize, pes};

    pub(crate) const VIDEO_PID: u16 = 0x1011;
    pub(crate) const AUDIO_PID: u16 = 0x1100;
    pub(crate) const PG_PID: u16 = 0x1200;
    /// 90 kHz presentation start of the default test clip
    pub(crate) const BASE90: u64 = 54_000_000;

    pub(crate) const IDR: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x65, 0x88];
    pub(crate) const DELTA: &[u8] = &[0, 0, 0, 1, 0x09, 0xf0, 0, 0, 1, 0x41, 0x9a];

    /// Continuity counters per PID while synthesising a stream.
    #[derive(Default)]
    pub(crate) struct StreamBuilder {
        packets: Vec<u8>,
        video_cc: u8,
        audio_cc: u8,
        pg_cc: u8,
    }

    impl StreamBuilder {
        pub(crate) fn video(&mut self, pts: u64, au: &[u8]) -> &mut Self {
            for p in packetize(VIDEO_PID, &mut self.video_cc, &pes(0xE0, Some(pts), au, false)) {
                self.packets.extend_from_slice(&p);
            }
            self
        }

        pub(crate) fn audio(&mut self, pts: u64, payload: &[u8]) -> &mut Self {
            for p in packetize(AUDIO_PID, &mut self.audio_cc, &pes(0xBD, Some(pts), payload, true)) {
                self.packets.extend_from_slice(&p);
            }
            self
        }

        pub(crate) fn subtitle(&mut self, pts: Option<u64>, segment: &[u8]) -> &mut Self {
            for p in packetize(PG_PID, &mut self.pg_cc, &pes(0xBD, pts, segment, true)) {
                self.packets.extend_from_slice(&p);
            }
            self
        }

        pub(crate) fn build(&self) -> Vec<u8> {
            self.packets.clone()
        }
    }

    /// A short clip: three video units, one LPCM frame, one display set.
    pub(crate) fn sample_stream() -> Vec<u8> {
        let lpcm = [0x00, 0x00, 0x31, 0xC0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        StreamBuilder::default()
            .video(BASE90, DELTA)
            .audio(BASE90, &lpcm)
            .video(BASE90 + 3003, IDR)
            .subtitle(Some(BASE90 + 90_000), &composition())
            .subtitle(None, &window())
            .subtitle(None, &palette())
            .subtitle(None, &object(4, 2, &[1, 1, 2, 2, 2, 2, 1, 1]))
            .subtitle(None, &end())
            .video(BASE90 + 6006, DELTA)
            .build()
    }

    pub(crate) fn disc(clpi: Vec<u8>, stream: Vec<u8>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert(disc_path::clip_info("00001"), clpi);
        store.insert(disc_path::stream("00001"), stream);
        store
    }

    fn request(start_secs: f64) -> SessionRequest {
        SessionRequest {
            clip_id: "00001".into(),
            start_secs,
            selection: StreamSelection {
                video: 0,
                audio: 0,
                subtitle: Some(0),
            },
        }
    }

    fn config(chunk_packets: usize) -> PlayerConfig {
        PlayerConfig {
            chunk_packets,
            ..PlayerConfig::default()
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<SessionMessage>) -> Vec<DecodingMessage> {
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            let done = matches!(msg.message, DecodingMessage::Finished(_));
            out.push(msg.message);
            if done {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn delivers_clip_then_units_then_finished() {
        let store = disc(ClpiBuilder::default().build(), sample_stream());
        let (tx, mut rx) = mpsc::channel(1);
        let session = DemuxSession::spawn(
            store,
            request(0.0),
            Box::new(PassthroughDecoder::new()),
            &config(3),
            tx,
            7,
        );

        let messages = drain(&mut rx).await;
        assert!(matches!(messages[0], DecodingMessage::ClipInfo(_)));
        assert!(matches!(messages[1], DecodingMessage::StartTime(t) if t == 0.0));
        assert!(matches!(messages.last(), Some(DecodingMessage::Finished(FinishReason::EndOfClip))));

        let video: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                DecodingMessage::Video(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(video.len(), 2);
        assert!(video[0].keyframe);
        assert_eq!(video[0].timestamp_us, 33_366);
        assert_eq!(video[1].timestamp_us, 66_733);

        let audio: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                DecodingMessage::Audio(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].frames(), 2);

        let subs: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                DecodingMessage::Subtitle(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].timestamp_us, 1_000_000);
        assert_eq!((subs[0].bitmap.width, subs[0].bitmap.height), (4, 2));

        assert_eq!(session.join().await.unwrap(), FinishReason::EndOfClip);
    }

    #[tokio::test]
    async fn every_message_carries_the_session_id() {
        let store = disc(ClpiBuilder::default().build(), sample_stream());
        let (tx, mut rx) = mpsc::channel(4);
        let session = DemuxSession::spawn(store, request(0.0), Box::new(PassthroughDecoder::new()), &config(1), tx, 42);
        while let Some(msg) = rx.recv().await {
            assert_eq!(msg.session, 42);
        }
        assert_eq!(session.join().await.unwrap(), FinishReason::EndOfClip);
    }

    #[tokio::test]
    async fn lost_sync_byte_ends_the_session() {
        let mut stream = sample_stream();
        stream[PACKET_SIZE * 2 + SYNC_OFFSET] = 0x00;
        let store = disc(ClpiBuilder::default().build(), stream);
        let (tx, mut rx) = mpsc::channel(1);
        let session = DemuxSession::spawn(store, request(0.0), Box::new(PassthroughDecoder::new()), &config(64), tx, 1);

        let messages = drain(&mut rx).await;
        assert!(matches!(messages.last(), Some(DecodingMessage::Finished(FinishReason::SyncLost))));
        assert_eq!(session.join().await.unwrap(), FinishReason::SyncLost);
    }

    #[tokio::test]
    async fn missing_clip_info_fails() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::channel(1);
        let session = DemuxSession::spawn(store, request(0.0), Box::new(PassthroughDecoder::new()), &config(64), tx, 1);

        let messages = drain(&mut rx).await;
        assert!(matches!(messages[..], [DecodingMessage::Finished(FinishReason::Failed)]));
        assert!(matches!(
            session.join().await,
            Err(SessionError::Store(StoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn stop_leaves_no_further_messages() {
        let mut builder = StreamBuilder::default();
        builder.video(BASE90, IDR);
        for i in 1..500u64 {
            builder.video(BASE90 + i * 3003, DELTA);
        }
        let store = disc(ClpiBuilder::default().build(), builder.build());
        let (tx, mut rx) = mpsc::channel(1);
        let session = DemuxSession::spawn(store, request(0.0), Box::new(PassthroughDecoder::new()), &config(16), tx, 3);

        assert!(matches!(rx.recv().await.unwrap().message, DecodingMessage::ClipInfo(_)));
        assert_eq!(session.stop().await.unwrap(), FinishReason::Cancelled);

        // at most what was already buffered, and never a Finished
        let mut late = 0;
        while let Some(msg) = rx.recv().await {
            assert!(!matches!(msg.message, DecodingMessage::Finished(_)));
            late += 1;
        }
        assert!(late <= 1);
    }

    #[tokio::test]
    async fn starts_at_the_seek_point() {
        let mut builder = StreamBuilder::default();
        for i in 0..8u64 {
            let au = if i % 4 == 0 { IDR } else { DELTA };
            builder.video(BASE90 + i * 3003, au);
        }
        // coarse 104 << 18 = 27_262_976, fine entry at packet 4
        let clpi = ClpiBuilder {
            coarse: vec![(0, 104, 0)],
            fine: vec![(0, 4)],
            ..ClpiBuilder::default()
        }
        .build();
        let store = disc(clpi, builder.build());
        let (tx, mut rx) = mpsc::channel(1);
        let session = DemuxSession::spawn(store, request(10.0), Box::new(PassthroughDecoder::new()), &config(3), tx, 1);

        let messages = drain(&mut rx).await;
        let DecodingMessage::StartTime(start) = messages[1] else {
            panic!("expected StartTime, got {:?}", messages[1]);
        };
        assert!((start - 262_976.0 / 45_000.0).abs() < 1e-9);
        let video = messages
            .iter()
            .filter(|m| matches!(m, DecodingMessage::Video(_)))
            .count();
        assert_eq!(video, 4);
        session.join().await.unwrap();
    }

    /// Decoder holding state behind a `Cell`: `Send`, never `Sync`.
    struct CountingDecoder {
        units: std::cell::Cell<usize>,
    }

    impl MediaDecoder for CountingDecoder {
        fn decode(&mut self, unit: &crate::elementary::AccessUnit) -> Result<Vec<VideoFrame>, DecodeError> {
            self.units.set(self.units.get() + 1);
            PassthroughDecoder::new().decode(unit)
        }

        fn flush(&mut self) -> Result<Vec<VideoFrame>, DecodeError> {
            Ok(Vec::new())
        }

        fn reset(&mut self) {
            self.units.set(0);
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn runs_with_a_decoder_that_is_not_sync() {
        let store = disc(ClpiBuilder::default().build(), sample_stream());
        let (tx, mut rx) = mpsc::channel(1);
        let decoder = CountingDecoder {
            units: std::cell::Cell::new(0),
        };
        let session = DemuxSession::spawn(store, request(0.0), Box::new(decoder), &config(3), tx, 2);

        let messages = drain(&mut rx).await;
        let video = messages
            .iter()
            .filter(|m| matches!(m, DecodingMessage::Video(_)))
            .count();
        assert_eq!(video, 2);
        assert_eq!(session.join().await.unwrap(), FinishReason::EndOfClip);
    }
}
