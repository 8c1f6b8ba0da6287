//! BluOS Scrobbler
//!
//! Scrobbles tracks played on BluOS players to Last.fm.
//!
//! This library provides:
//! - Long-poll status tracking for every player on the network
//! - LSDP player discovery
//! - Sync-group aware scrobble gating
//! - A Last.fm client with request signing and session login

pub mod app;
pub mod bluos;
pub mod config;
pub mod lastfm;
pub mod scrobbler;
pub mod session;
