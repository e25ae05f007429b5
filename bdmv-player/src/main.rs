//! # BDMV Player
//!
//! Headless front end for a Blu-ray disc directory.
//!
//! ```bash
//! bdmv info <disc>
//! bdmv play <disc> [--title N] [--playlist N] [--start SECS] \
//!                  [--export-subtitles DIR] [--config FILE]
//! ```

use anyhow::{anyhow, Context, Result};
use bdmv_core::byte_store::{disc_path, ByteStore, FsByteStore};
use bdmv_core::config::PlayerConfig;
use bdmv_core::hdmv::PlayRequest;
use bdmv_core::index::parse_index;
use bdmv_core::mobj::parse_movie_object;
use bdmv_core::mpls::parse_playlist;
use bdmv_core::navigation::NavigationController;
use bdmv_core::pgs::DisplaySet;
use bdmv_core::session::{DecodingMessage, FinishReason};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bdmv=info,bdmv_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("info") => {
            let disc = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow!("Missing disc directory")
            })?;
            run_info(Path::new(disc)).await
        }
        Some("play") => run_play(parse_play_args(&args[2..])?).await,
        Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            Err(anyhow!("Unknown command"))
        }
    }
}

fn print_usage() {
    eprintln!(
        "\nbdmv v{}\n\nUsage:\n  bdmv info <disc>\n  bdmv play <disc> [--title N] [--playlist N] [--start SECS] [--export-subtitles DIR] [--config FILE]\n",
        bdmv_core::VERSION
    );
}

// ============================================================================
// info
// ============================================================================

async fn run_info(disc: &Path) -> Result<()> {
    let store = FsByteStore::new(disc);
    let index = parse_index(&store.read_all(disc_path::INDEX).await?)
        .context("Failed to parse index.bdmv")?;
    let movie = parse_movie_object(&store.read_all(disc_path::MOVIE_OBJECT).await?)
        .context("Failed to parse MovieObject.bdmv")?;

    let mut playlists = Vec::new();
    for number in playlist_numbers(disc)? {
        let data = store.read_all(&disc_path::playlist(number)).await?;
        match parse_playlist(&data) {
            Ok(pl) => playlists.push(json!({
                "number": number,
                "duration_secs": pl.duration_secs(),
                "clips": pl.play_items.iter().map(|i| i.clip_id.as_str()).collect::<Vec<_>>(),
                "chapters": pl.chapters().count(),
                "playlist": pl,
            })),
            Err(e) => tracing::warn!(playlist = number, error = %e, "skipping unreadable playlist"),
        }
    }

    let objects: Vec<_> = movie
        .objects
        .iter()
        .enumerate()
        .map(|(i, o)| json!({ "object": i, "commands": o.commands.len() }))
        .collect();

    let report = json!({
        "index": index,
        "movie_objects": objects,
        "playlists": playlists,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn playlist_numbers(disc: &Path) -> Result<Vec<u32>> {
    let dir = disc.join("BDMV").join("PLAYLIST");
    let mut numbers: Vec<u32> = std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            let is_mpls = path
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| e.eq_ignore_ascii_case("mpls"));
            if !is_mpls {
                return None;
            }
            path.file_stem()?.to_str()?.parse().ok()
        })
        .collect();
    numbers.sort_unstable();
    Ok(numbers)
}

// ============================================================================
// play
// ============================================================================

struct PlayOptions {
    disc: PathBuf,
    title: Option<u32>,
    playlist: Option<u32>,
    start: f64,
    export_subtitles: Option<PathBuf>,
    config: Option<PathBuf>,
}

fn parse_play_args(args: &[String]) -> Result<PlayOptions> {
    let mut disc = None;
    let mut title = None;
    let mut playlist = None;
    let mut start = 0.0;
    let mut export_subtitles = None;
    let mut config = None;

    let value = |i: usize, flag: &str| {
        args.get(i + 1)
            .ok_or_else(|| anyhow!("Missing value for {}", flag))
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--title" | "-t" => {
                let v = value(i, "--title")?;
                title = Some(v.parse().map_err(|e| anyhow!("Invalid title {}: {}", v, e))?);
                i += 2;
            }
            "--playlist" | "-p" => {
                let v = value(i, "--playlist")?;
                playlist = Some(v.parse().map_err(|e| anyhow!("Invalid playlist {}: {}", v, e))?);
                i += 2;
            }
            "--start" | "-s" => {
                let v = value(i, "--start")?;
                start = v.parse().map_err(|e| anyhow!("Invalid start time {}: {}", v, e))?;
                i += 2;
            }
            "--export-subtitles" => {
                export_subtitles = Some(PathBuf::from(value(i, "--export-subtitles")?));
                i += 2;
            }
            "--config" | "-c" => {
                config = Some(PathBuf::from(value(i, "--config")?));
                i += 2;
            }
            other if disc.is_none() && !other.starts_with('-') => {
                disc = Some(PathBuf::from(other));
                i += 1;
            }
            other => {
                tracing::warn!(arg = other, "ignoring argument");
                i += 1;
            }
        }
    }

    let disc = disc.ok_or_else(|| {
        print_usage();
        anyhow!("Missing disc directory")
    })?;
    Ok(PlayOptions {
        disc,
        title,
        playlist,
        start,
        export_subtitles,
        config,
    })
}

#[derive(Debug, Default, Serialize)]
struct PlayStats {
    playlist: u32,
    clip: String,
    start_secs: f64,
    video_frames: u64,
    keyframes: u64,
    audio_frames: u64,
    display_sets: u64,
    exported: u64,
    finish: Option<FinishReason>,
}

async fn run_play(options: PlayOptions) -> Result<()> {
    let config = match &options.config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    if let Some(dir) = &options.export_subtitles {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let (tx, mut rx) = mpsc::channel(config.channel_capacity.max(1));
    let store: Arc<dyn ByteStore> = Arc::new(FsByteStore::new(&options.disc));
    let mut nav = NavigationController::open(store, config, tx).await?;

    let request = match (options.playlist, options.title) {
        (Some(playlist), _) => Some(PlayRequest::playlist(playlist)),
        (None, Some(title)) => nav.jump_title(title)?,
        (None, None) => nav.start()?,
    };
    let request = request.ok_or_else(|| anyhow!("Navigation ended without selecting a playlist"))?;
    nav.play(request, options.start).await?;

    let mut stats = PlayStats {
        playlist: request.playlist,
        clip: nav.current_clip().unwrap_or_default().to_string(),
        ..PlayStats::default()
    };

    while let Some(msg) = rx.recv().await {
        if !nav.is_current(&msg) {
            continue;
        }
        match msg.message {
            DecodingMessage::ClipInfo(clip) => {
                tracing::info!(
                    streams = clip.stream_count(),
                    duration = clip.duration_secs(),
                    "clip info"
                );
            }
            DecodingMessage::StartTime(secs) => stats.start_secs = secs,
            DecodingMessage::Video(frame) => {
                stats.video_frames += 1;
                stats.keyframes += frame.keyframe as u64;
            }
            DecodingMessage::Audio(frame) => stats.audio_frames += frame.frames() as u64,
            DecodingMessage::Subtitle(set) => {
                if let Some(dir) = &options.export_subtitles {
                    export_display_set(dir, stats.display_sets, &set)?;
                    stats.exported += 1;
                }
                stats.display_sets += 1;
            }
            DecodingMessage::Finished(reason) => {
                stats.finish = Some(reason);
                break;
            }
        }
    }
    nav.stop().await?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn export_display_set(dir: &Path, n: u64, set: &DisplaySet) -> Result<()> {
    let bitmap = &set.bitmap;
    let image = image::RgbaImage::from_raw(
        bitmap.width as u32,
        bitmap.height as u32,
        bitmap.pixels.clone(),
    )
    .ok_or_else(|| anyhow!("Display set {} has a malformed bitmap", n))?;
    let path = dir.join(format!("{:05}_{}ms.png", n, set.timestamp_us / 1000));
    image
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::debug!(path = %path.display(), "subtitle exported");
    Ok(())
}
