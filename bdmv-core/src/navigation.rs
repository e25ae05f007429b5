//! Navigation controller
//!
//! Owns the HDMV VM and at most one demux session. Every playback change
//! (title jump, playlist play, seek, stop) first stops the running session
//! and waits for it, then bumps the generation. Messages still queued from
//! an older generation fail [`NavigationController::is_current`].

use crate::byte_store::{disc_path, ByteStore, StoreError};
use crate::config::PlayerConfig;
use crate::cursor::FormatError;
use crate::decode::{create_decoder, DecodeError, MediaDecoder};
use crate::hdmv::{HdmvVm, PlayRequest, VmOutcome};
use crate::index::{parse_index, IndexRoot};
use crate::mobj::parse_movie_object;
use crate::mpls::{parse_playlist, PlayItem, Playlist};
use crate::registers::RegisterFile;
use crate::session::{DemuxSession, SessionError, SessionMessage, SessionRequest};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationError {
    #[error("invalid register address {0:#010x}")]
    InvalidRegister(u32),
    #[error("store to immediate operand")]
    StoreToImmediate,
    #[error("store to PSR {0:#010x} from a movie object")]
    StoreToPsr(u32),
    #[error("title {title} is a BD-J title ({name})")]
    UnsupportedTitle { title: u32, name: String },
    #[error("title {0} does not exist")]
    TitleOutOfRange(u32),
    #[error("movie object {0} does not exist")]
    ObjectOutOfRange(u32),
    #[error("playlist {0:05} not found")]
    PlaylistNotFound(u32),
    #[error("playlist {playlist:05} has no play item {item}")]
    PlayItemOutOfRange { playlist: u32, item: u32 },
    #[error("playlist {playlist:05} has no mark {mark}")]
    MarkOutOfRange { playlist: u32, mark: u32 },
    #[error("movie object file has no objects")]
    NoMovieObjects,
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Navigation(#[from] NavigationError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("format: {0}")]
    Format(#[from] FormatError),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("decoder: {0}")]
    Decode(#[from] DecodeError),
    #[error("nothing is playing")]
    NothingPlaying,
}

pub type DecoderFactory =
    Box<dyn Fn(u8) -> Result<Box<dyn MediaDecoder>, DecodeError> + Send + Sync>;

/// What the active or last session is playing.
#[derive(Debug, Clone)]
pub struct Playback {
    pub playlist_number: u32,
    pub playlist: Arc<Playlist>,
    pub play_item: usize,
    pub start_secs: f64,
}

impl Playback {
    pub fn item(&self) -> Option<&PlayItem> {
        self.playlist.play_items.get(self.play_item)
    }
}

pub struct NavigationController {
    store: Arc<dyn ByteStore>,
    config: PlayerConfig,
    sender: mpsc::Sender<SessionMessage>,
    decoders: DecoderFactory,
    vm: HdmvVm,
    session: Option<DemuxSession>,
    generation: u64,
    current: Option<Playback>,
}

impl NavigationController {
    /// Loads `index.bdmv` and `MovieObject.bdmv` and builds the VM.
    pub async fn open(
        store: Arc<dyn ByteStore>,
        config: PlayerConfig,
        sender: mpsc::Sender<SessionMessage>,
    ) -> Result<Self, PlayerError> {
        let index = parse_index(&store.read_all(disc_path::INDEX).await?)?;
        let movie = parse_movie_object(&store.read_all(disc_path::MOVIE_OBJECT).await?)?;
        tracing::info!(
            titles = index.titles.len(),
            objects = movie.objects.len(),
            commands = movie.command_count(),
            "disc opened"
        );
        let vm = HdmvVm::new(movie, Some(index), RegisterFile::new(config.region));
        Ok(Self {
            store,
            config,
            sender,
            decoders: Box::new(create_decoder),
            vm,
            session: None,
            generation: 0,
            current: None,
        })
    }

    pub fn set_decoder_factory(&mut self, factory: DecoderFactory) {
        self.decoders = factory;
    }

    pub fn vm(&self) -> &HdmvVm {
        &self.vm
    }

    pub fn index(&self) -> Option<&IndexRoot> {
        self.vm.index()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current(&self) -> Option<&Playback> {
        self.current.as_ref()
    }

    pub fn current_playlist(&self) -> Option<&Playlist> {
        self.current.as_ref().map(|p| p.playlist.as_ref())
    }

    pub fn current_clip(&self) -> Option<&str> {
        self.current
            .as_ref()
            .and_then(|p| p.item())
            .map(|item| item.clip_id.as_str())
    }

    /// True for messages from the active session only.
    pub fn is_current(&self, msg: &SessionMessage) -> bool {
        self.session.is_some() && msg.session == self.generation
    }

    /// Runs the first-play object up to the first playback hand-off.
    pub fn start(&mut self) -> Result<Option<PlayRequest>, PlayerError> {
        self.vm.start_first_play()?;
        self.navigate()
    }

    /// Runs the VM for one step budget.
    pub fn navigate(&mut self) -> Result<Option<PlayRequest>, PlayerError> {
        match self.vm.run(self.config.vm_step_limit)? {
            VmOutcome::Play(request) => Ok(Some(request)),
            VmOutcome::Halted => {
                tracing::debug!(object = self.vm.object_index(), "movie object finished");
                Ok(None)
            }
            VmOutcome::Yielded => {
                tracing::warn!(
                    limit = self.config.vm_step_limit,
                    object = self.vm.object_index(),
                    cmd = self.vm.command_index(),
                    "navigation yielded without playing"
                );
                Ok(None)
            }
        }
    }

    pub fn jump_title(&mut self, title: u32) -> Result<Option<PlayRequest>, PlayerError> {
        self.vm.jump_title(title)?;
        self.navigate()
    }

    async fn load_playlist(&self, number: u32) -> Result<Playlist, PlayerError> {
        let data = match self.store.read_all(&disc_path::playlist(number)).await {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => return Err(NavigationError::PlaylistNotFound(number).into()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_playlist(&data)?)
    }

    /// Starts playback of a VM hand-off. `start_secs` is added to the
    /// position the request itself implies.
    pub async fn play(&mut self, request: PlayRequest, start_secs: f64) -> Result<u64, PlayerError> {
        let playlist = self.load_playlist(request.playlist).await?;
        let (play_item, offset) = resolve_item(&playlist, &request)?;
        self.current = Some(Playback {
            playlist_number: request.playlist,
            playlist: Arc::new(playlist),
            play_item,
            start_secs: offset + start_secs,
        });
        self.restart().await
    }

    /// Restarts the current play item at `secs`.
    pub async fn seek(&mut self, secs: f64) -> Result<u64, PlayerError> {
        let current = self.current.as_mut().ok_or(PlayerError::NothingPlaying)?;
        current.start_secs = secs.max(0.0);
        self.restart().await
    }

    /// Stops the active session without starting another. A session that
    /// already ended in error is logged and replaced like any other.
    pub async fn stop(&mut self) -> Result<(), PlayerError> {
        if let Some(session) = self.session.take() {
            let id = session.id();
            match session.stop().await {
                Ok(reason) => tracing::debug!(session = id, ?reason, "session replaced"),
                Err(e) => tracing::warn!(session = id, error = %e, "previous session ended with an error"),
            }
            self.generation += 1;
        }
        Ok(())
    }

    async fn restart(&mut self) -> Result<u64, PlayerError> {
        self.stop().await?;
        let current = self.current.as_ref().ok_or(PlayerError::NothingPlaying)?;
        let item = current.item().ok_or(NavigationError::PlayItemOutOfRange {
            playlist: current.playlist_number,
            item: current.play_item as u32,
        })?;

        let coding = item
            .stn
            .video
            .first()
            .map(|v| v.coding_type)
            .unwrap_or(crate::clpi::coding_type::H264);
        let request = SessionRequest {
            clip_id: item.clip_id.clone(),
            start_secs: current.start_secs,
            selection: self.config.selection(),
        };
        let (playlist, play_item) = (current.playlist_number, current.play_item);
        let decoder = (self.decoders)(coding)?;

        self.generation += 1;
        tracing::info!(
            generation = self.generation,
            playlist,
            item = play_item,
            clip = %request.clip_id,
            start = request.start_secs,
            "playing"
        );
        self.session = Some(DemuxSession::spawn(
            self.store.clone(),
            request,
            decoder,
            &self.config,
            self.sender.clone(),
            self.generation,
        ));
        Ok(self.generation)
    }
}

/// Picks the play item of a request and the offset into it in seconds.
fn resolve_item(playlist: &Playlist, request: &PlayRequest) -> Result<(usize, f64), NavigationError> {
    if let Some(item) = request.play_item {
        if item as usize >= playlist.play_items.len() {
            return Err(NavigationError::PlayItemOutOfRange {
                playlist: request.playlist,
                item,
            });
        }
        return Ok((item as usize, 0.0));
    }

    if let Some(mark) = request.mark {
        let out_of_range = NavigationError::MarkOutOfRange {
            playlist: request.playlist,
            mark,
        };
        let m = playlist.marks.get(mark as usize).ok_or(out_of_range.clone())?;
        let item_idx = m.play_item_ref as usize;
        let item = playlist.play_items.get(item_idx).ok_or(out_of_range)?;
        let offset = m.time.saturating_sub(item.in_time) as f64 / 45_000.0;
        return Ok((item_idx, offset));
    }

    if playlist.play_items.is_empty() {
        return Err(NavigationError::PlayItemOutOfRange {
            playlist: request.playlist,
            item: 0,
        });
    }
    Ok((0, 0.0))
}
