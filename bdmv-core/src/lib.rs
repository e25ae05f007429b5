//! # BDMV Core
//!
//! Blu-ray BDMV playback engine: disc metadata parsers, EP-map seeking,
//! transport stream demux, PGS subtitles and HDMV navigation.

// ============================================================================
// Disc Metadata
// ============================================================================
pub mod cursor;
pub mod clpi;
pub mod mpls;
pub mod index;
pub mod mobj;
pub mod stream_map;
pub mod seek;

// ============================================================================
// Transport Stream
// ============================================================================
pub mod ts_demux;
pub mod h264_utils;
pub mod elementary;
pub mod pgs;
pub mod decode;

// ============================================================================
// Navigation
// ============================================================================
pub mod registers;
pub mod hdmv;
pub mod navigation;

// ============================================================================
// Sessions / IO
// ============================================================================
pub mod byte_store;
pub mod config;
pub mod session;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
