//! BluOS player integration
//!
//! Players expose a long-poll `/Status` endpoint that returns an XML document
//! describing what is currently playing. This module owns the player identity,
//! the decoded track snapshot and the machinery that keeps one poll loop
//! running per known player.

pub mod discovery;
pub mod etag_cache;
pub mod fetcher;
pub mod parser;
pub mod status_stream;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;

pub use etag_cache::EtagCache;
pub use fetcher::{FetchRetry, LongPoll, StatusFetcher};
pub use parser::parse_status;
pub use status_stream::{spawn_player_status_stream, PlayerStatus, PollSettings};

/// Default HTTP port of the BluOS control API
pub const DEFAULT_PLAYER_PORT: u16 = 11000;

/// Playback states in which a track counts as being listened to
const ACTIVE_STATES: &[&str] = &["play", "stream"];

/// A BluOS player, identified by its network address and API port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Player {
    pub host: String,
    pub port: u16,
}

impl Player {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn status_url(&self) -> String {
        format!("http://{}/Status", self)
    }
}

/// `host:port`, with IPv6 hosts in brackets so the result is a valid URL
/// authority
impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Snapshot of the track a player reported in one status response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayingTrack {
    pub artist: String,
    pub album: String,
    pub title: String,
    /// Elapsed playback time in seconds
    pub secs: f64,
    /// Track length in seconds, `None` for streams and other unknown lengths
    pub total_length: Option<f64>,
    pub state: String,
    /// Name of the sync group this player is part of
    pub group_name: Option<String>,
}

impl PlayingTrack {
    pub fn is_playing(&self) -> bool {
        ACTIVE_STATES.contains(&self.state.as_str())
    }

    /// Exact match on title, album and artist. No normalization is applied,
    /// so a one-character metadata difference counts as a different track.
    pub fn is_same_track(&self, other: &PlayingTrack) -> bool {
        self.title == other.title && self.album == other.album && self.artist == other.artist
    }

    /// Whether `secs` has reached `threshold` of the track length, assuming
    /// `fallback_length` seconds when the length is unknown.
    pub fn has_played_over_threshold(&self, threshold: f64, fallback_length: f64) -> bool {
        let length = self.total_length.unwrap_or(fallback_length);
        self.secs >= length * threshold
    }
}

/// Result of parsing one status document
#[derive(Debug, Clone, PartialEq)]
pub struct StatusQueryResponse {
    pub etag: Option<String>,
    pub playing_track: Option<PlayingTrack>,
}
