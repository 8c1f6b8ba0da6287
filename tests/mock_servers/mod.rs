//! Mock servers for integration testing
//!
//! These mock servers simulate the BluOS player API and the Last.fm web
//! service, allowing full integration testing without real hardware or
//! network access.

#![allow(dead_code)]

pub mod bluos;
pub mod lastfm;

pub use bluos::{MockBluosPlayer, MockTrack, StatusQuery};
pub use lastfm::MockLastFm;

use std::future::Future;
use std::time::Duration;

/// Poll `check` until it returns true or `timeout_ms` elapses
pub async fn eventually<F, Fut>(timeout_ms: u64, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
