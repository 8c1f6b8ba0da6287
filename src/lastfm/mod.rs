//! Last.fm Web Services client
//!
//! Write methods are signed: `api_sig` is the md5 of every parameter's key and
//! value concatenated in key order (`format` and `callback` excluded),
//! followed by the shared secret.

pub mod response;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use std::time::Duration;

pub use response::{MaybeUnknown, NowPlayingResponse, ScrobblesResponse, TrackAcknowledgement};

pub const DEFAULT_BASE_URL: &str = "https://ws.audioscrobbler.com/2.0";
const APPROVAL_URL: &str = "http://www.last.fm/api/auth/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum LastFmError {
    /// Request never got a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status without a Last.fm error body.
    #[error("HTTP error {0}")]
    HttpStatus(u16),

    /// Last.fm rejected the call.
    #[error("Last.fm error {code}: {message}")]
    Api { code: i64, message: String },

    /// Body was not JSON, or lacked a required field.
    #[error("unexpected Last.fm response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct LastFmCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Track fields sent with now-playing and scrobble calls
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSubmission {
    pub artist: String,
    pub track: String,
    pub album: Option<String>,
    /// Track length in whole seconds
    pub duration: Option<u64>,
    /// Unix time the track started playing
    pub timestamp: Option<i64>,
}

/// The two write operations the scrobbler needs
#[async_trait]
pub trait ScrobbleService: Send + Sync + 'static {
    async fn update_now_playing(
        &self,
        session_key: &str,
        track: &TrackSubmission,
    ) -> Result<MaybeUnknown<NowPlayingResponse>, LastFmError>;

    async fn scrobble(
        &self,
        session_key: &str,
        track: &TrackSubmission,
    ) -> Result<MaybeUnknown<ScrobblesResponse>, LastFmError>;
}

pub struct LastFmClient {
    http: Client,
    credentials: LastFmCredentials,
    base_url: String,
}

impl LastFmClient {
    pub fn new(credentials: LastFmCredentials) -> Result<Self, LastFmError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            credentials,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn sign(&self, params: &[(&str, String)]) -> String {
        let mut sorted: Vec<&(&str, String)> = params
            .iter()
            .filter(|(k, _)| *k != "format" && *k != "callback")
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        let mut payload = String::new();
        for (key, value) in sorted {
            payload.push_str(key);
            payload.push_str(value);
        }
        payload.push_str(&self.credentials.api_secret);
        format!("{:x}", md5::compute(payload.as_bytes()))
    }

    /// POST a signed write call
    async fn post_signed(&self, method: &str, mut params: Vec<(&str, String)>) -> Result<Value, LastFmError> {
        params.push(("method", method.to_string()));
        params.push(("api_key", self.credentials.api_key.clone()));
        let signature = self.sign(&params);
        params.push(("api_sig", signature));
        params.push(("format", "json".to_string()));

        let response = self
            .http
            .post(&self.base_url)
            .header(header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await?;
        read_json(response).await
    }

    async fn get(&self, params: &[(&str, String)]) -> Result<Value, LastFmError> {
        let response = self
            .http
            .get(&self.base_url)
            .header(header::ACCEPT, "application/json")
            .query(params)
            .send()
            .await?;
        read_json(response).await
    }

    /// Request an unauthorized token for the desktop auth flow
    pub async fn get_token(&self) -> Result<String, LastFmError> {
        let value = self
            .get(&[
                ("method", "auth.gettoken".to_string()),
                ("api_key", self.credentials.api_key.clone()),
                ("format", "json".to_string()),
            ])
            .await?;
        value
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LastFmError::Decode("missing token".to_string()))
    }

    /// Page where the user grants this client access for `token`
    pub fn approval_url(&self, token: &str) -> String {
        match url::Url::parse_with_params(
            APPROVAL_URL,
            &[("api_key", self.credentials.api_key.as_str()), ("token", token)],
        ) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}?api_key={}&token={}", APPROVAL_URL, self.credentials.api_key, token),
        }
    }

    /// Exchange an approved token for a session key
    pub async fn get_session(&self, token: &str) -> Result<String, LastFmError> {
        let value = self
            .post_signed("auth.getSession", vec![("token", token.to_string())])
            .await?;
        value
            .pointer("/session/key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LastFmError::Decode("missing session key".to_string()))
    }

    fn track_params(track: &TrackSubmission, session_key: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![("artist", track.artist.clone())];
        if let Some(album) = &track.album {
            params.push(("album", album.clone()));
        }
        params.push(("track", track.track.clone()));
        if let Some(duration) = track.duration {
            params.push(("duration", duration.to_string()));
        }
        if let Some(timestamp) = track.timestamp {
            params.push(("timestamp", timestamp.to_string()));
        }
        params.push(("sk", session_key.to_string()));
        params
    }
}

#[async_trait]
impl ScrobbleService for LastFmClient {
    async fn update_now_playing(
        &self,
        session_key: &str,
        track: &TrackSubmission,
    ) -> Result<MaybeUnknown<NowPlayingResponse>, LastFmError> {
        let value = self
            .post_signed("track.updateNowPlaying", Self::track_params(track, session_key))
            .await?;
        Ok(MaybeUnknown::from_value(value))
    }

    async fn scrobble(
        &self,
        session_key: &str,
        track: &TrackSubmission,
    ) -> Result<MaybeUnknown<ScrobblesResponse>, LastFmError> {
        let value = self
            .post_signed("track.scrobble", Self::track_params(track, session_key))
            .await?;
        Ok(MaybeUnknown::from_value(value))
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, LastFmError> {
    let status = response.status();
    let body = response.text().await?;
    let value = serde_json::from_str::<Value>(&body).ok();

    if let Some(error) = value.as_ref().and_then(api_error) {
        return Err(error);
    }
    if !status.is_success() {
        return Err(LastFmError::HttpStatus(status.as_u16()));
    }
    value.ok_or_else(|| LastFmError::Decode(body.chars().take(200).collect()))
}

fn api_error(value: &Value) -> Option<LastFmError> {
    let error = value.get("error")?;
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("unknown error")
        .to_string();
    Some(LastFmError::Api {
        code: error.as_i64().unwrap_or_default(),
        message,
    })
}
