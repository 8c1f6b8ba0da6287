//! Long-poll requests against a single player's `/Status` endpoint
//!
//! The player holds the request open until its state changes or the
//! requested wait elapses. The client timeout sits a small margin above that
//! wait so a held connection is not mistaken for a stalled one.

use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

use super::Player;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport failure, including the request timeout.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Player answered with a non-success status.
    #[error("HTTP error {0}")]
    HttpStatus(u16),
}

/// Long-poll parameters sent to the player
#[derive(Debug, Clone)]
pub struct LongPoll {
    /// Wait hint passed as the `timeout` query parameter
    pub timeout: Duration,
    /// Added on top of `timeout` for the HTTP client timeout
    pub request_margin: Duration,
}

impl Default for LongPoll {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(100),
            request_margin: Duration::from_secs(2),
        }
    }
}

impl LongPoll {
    pub fn request_timeout(&self) -> Duration {
        self.timeout + self.request_margin
    }
}

/// Retry policy for status requests.
///
/// There is no attempt limit: an unreachable player just stops producing
/// events until it comes back.
#[derive(Debug, Clone)]
pub struct FetchRetry {
    pub delay: Duration,
}

impl Default for FetchRetry {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
        }
    }
}

pub struct StatusFetcher {
    http: Client,
    long_poll: LongPoll,
    retry: FetchRetry,
}

impl StatusFetcher {
    pub fn new(long_poll: LongPoll, retry: FetchRetry) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(long_poll.request_timeout())
            .build()?;
        Ok(Self {
            http,
            long_poll,
            retry,
        })
    }

    /// Issue one status request, conditional on `etag` when given.
    pub async fn fetch_once(&self, player: &Player, etag: Option<&str>) -> Result<String, FetchError> {
        debug!("Calling BluOS status API for {} with etag {:?}", player, etag);

        let mut request = self
            .http
            .get(player.status_url())
            .query(&[("timeout", self.long_poll.timeout.as_secs().to_string())]);
        if let Some(etag) = etag {
            request = request.query(&[("etag", etag)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        Ok(response.text().await?)
    }

    /// Fetch the status document, retrying with a fixed delay until it
    /// succeeds. Cancel by dropping the future.
    pub async fn fetch(&self, player: &Player, etag: Option<&str>) -> String {
        loop {
            match self.fetch_once(player, etag).await {
                Ok(body) => return body,
                Err(e) => {
                    warn!(
                        "BluOS status request to {} failed ({}), retrying in {:?}",
                        player, e, self.retry.delay
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        }
    }
}
