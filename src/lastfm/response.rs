//! Last.fm acknowledgement shapes
//!
//! Last.fm wraps every string in `{"corrected": "0", "#text": "..."}` and
//! returns a single scrobble as an object but several as an array. The raw
//! shapes are decoded here and flattened into plain structs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed response, or the raw JSON when it did not match the expected
/// shape
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MaybeUnknown<T> {
    Known(T),
    Unknown(Value),
}

impl<T: DeserializeOwned> MaybeUnknown<T> {
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(known) => MaybeUnknown::Known(known),
            Err(e) => {
                tracing::debug!("Unrecognized Last.fm response shape: {}", e);
                MaybeUnknown::Unknown(value)
            }
        }
    }
}

impl<T> MaybeUnknown<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            MaybeUnknown::Known(value) => Some(value),
            MaybeUnknown::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawCorrected")]
pub struct CorrectedValue {
    pub value: String,
    pub corrected: bool,
}

#[derive(Deserialize)]
struct RawCorrected {
    #[serde(default)]
    corrected: Value,
    #[serde(rename = "#text", default)]
    text: String,
}

impl From<RawCorrected> for CorrectedValue {
    fn from(raw: RawCorrected) -> Self {
        let corrected = match raw.corrected {
            Value::String(s) => s == "1",
            Value::Number(n) => n.as_u64() == Some(1),
            Value::Bool(b) => b,
            _ => false,
        };
        Self {
            value: raw.text,
            corrected,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawIgnoredMessage")]
pub struct IgnoredMessage {
    pub code: String,
    pub message: String,
}

#[derive(Deserialize)]
struct RawIgnoredMessage {
    #[serde(default)]
    code: Option<NumberOrString>,
    #[serde(rename = "#text", default)]
    text: String,
}

impl From<RawIgnoredMessage> for IgnoredMessage {
    fn from(raw: RawIgnoredMessage) -> Self {
        Self {
            code: raw.code.map(|c| c.to_string()).unwrap_or_default(),
            message: raw.text,
        }
    }
}

impl IgnoredMessage {
    /// Code `0` means the submission was accepted as-is
    pub fn is_ignored(&self) -> bool {
        !self.code.is_empty() && self.code != "0"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackAcknowledgement {
    pub artist: CorrectedValue,
    pub track: CorrectedValue,
    #[serde(default)]
    pub album: CorrectedValue,
    #[serde(rename = "albumArtist", default)]
    pub album_artist: CorrectedValue,
    #[serde(rename = "ignoredMessage", default)]
    pub ignored_message: IgnoredMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NowPlayingResponse {
    #[serde(rename = "nowplaying")]
    pub now_playing: TrackAcknowledgement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawScrobblesResponse")]
pub struct ScrobblesResponse {
    pub accepted: u32,
    pub ignored: u32,
    pub scrobbles: Vec<TrackAcknowledgement>,
}

#[derive(Deserialize)]
struct RawScrobblesResponse {
    scrobbles: RawScrobbles,
}

#[derive(Deserialize)]
struct RawScrobbles {
    scrobble: OneOrMany<TrackAcknowledgement>,
    #[serde(rename = "@attr")]
    attr: Option<RawScrobbleCounts>,
}

#[derive(Deserialize)]
struct RawScrobbleCounts {
    #[serde(default)]
    accepted: Option<NumberOrString>,
    #[serde(default)]
    ignored: Option<NumberOrString>,
}

impl From<RawScrobblesResponse> for ScrobblesResponse {
    fn from(raw: RawScrobblesResponse) -> Self {
        let scrobbles = match raw.scrobbles.scrobble {
            OneOrMany::One(one) => vec![one],
            OneOrMany::Many(many) => many,
        };
        let (accepted, ignored) = match raw.scrobbles.attr {
            Some(counts) => (count(counts.accepted), count(counts.ignored)),
            None => {
                let ignored = scrobbles
                    .iter()
                    .filter(|s| s.ignored_message.is_ignored())
                    .count() as u32;
                (scrobbles.len() as u32 - ignored, ignored)
            }
        };
        Self {
            accepted,
            ignored,
            scrobbles,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// Last.fm sends numeric fields as either JSON numbers or strings
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

fn count(value: Option<NumberOrString>) -> u32 {
    match value {
        Some(NumberOrString::Number(n)) => n as u32,
        Some(NumberOrString::String(s)) => s.parse().unwrap_or(0),
        None => 0,
    }
}

impl std::fmt::Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Number(n) => write!(f, "{}", n),
            NumberOrString::String(s) => f.write_str(s),
        }
    }
}
