//! BluOS `/Status` document parsing
//!
//! Only a handful of leaf elements matter for scrobbling. Everything else in
//! the document (actions, images, stream format, ...) is skipped by serde.

use quick_xml::de::from_str as xml_from_str;
use serde::Deserialize;

use super::{PlayingTrack, StatusQueryResponse};

#[derive(Debug, thiserror::Error)]
#[error("malformed BluOS status document: {0}")]
pub struct StatusParseError(#[from] quick_xml::DeError);

#[derive(Debug, Deserialize)]
struct StatusDocument {
    #[serde(rename = "@etag")]
    etag: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    name: Option<String>,
    title1: Option<String>,
    title2: Option<String>,
    title3: Option<String>,
    secs: Option<String>,
    totlen: Option<String>,
    state: Option<String>,
    #[serde(rename = "groupName")]
    group_name: Option<String>,
}

/// Parse a status document into its etag and, when all required fields are
/// present, a track snapshot.
///
/// A document without a playable track is not an error: the result simply
/// carries no snapshot. Only XML that cannot be read at all fails.
pub fn parse_status(xml: &str) -> Result<StatusQueryResponse, StatusParseError> {
    let doc: StatusDocument = xml_from_str(xml.trim())?;
    let etag = non_empty(doc.etag.clone());
    let playing_track = playing_track(doc);
    Ok(StatusQueryResponse {
        etag,
        playing_track,
    })
}

fn playing_track(doc: StatusDocument) -> Option<PlayingTrack> {
    let artist = non_empty(doc.artist)?;
    let album = non_empty(doc.album)?;
    let state = non_empty(doc.state)?;
    let secs = non_empty(doc.secs)?.parse::<f64>().ok()?;
    let title = resolve_title(
        &artist,
        &album,
        non_empty(doc.name),
        non_empty(doc.title1),
        non_empty(doc.title2),
        non_empty(doc.title3),
    )?;
    // Streams report totlen as 0 or omit it
    let total_length = non_empty(doc.totlen)
        .and_then(|t| t.parse::<f64>().ok())
        .filter(|t| *t > 0.0);

    Some(PlayingTrack {
        artist,
        album,
        title,
        secs,
        total_length,
        state,
        group_name: non_empty(doc.group_name),
    })
}

/// Pick the track title out of the fields BluOS fills differently per source.
///
/// - Local files carry a dedicated `name`.
/// - Streaming services lay out `title1`/`title2`/`title3` as
///   track/artist/album, which shows up as `title2 == artist` with the album
///   in `title3` (or, for some services, in `title1`).
/// - Network radio lays them out as station/track/"artist • album", so the
///   track is `title2`.
///
/// This is best effort. Upstream services fill these fields as free text.
fn resolve_title(
    artist: &str,
    album: &str,
    name: Option<String>,
    title1: Option<String>,
    title2: Option<String>,
    title3: Option<String>,
) -> Option<String> {
    if name.is_some() {
        return name;
    }
    let title1 = title1?;
    let title2 = title2?;
    let album_matches = title3.as_deref() == Some(album) || title1 == album;
    if title2 == artist && album_matches {
        Some(title1)
    } else {
        Some(title2)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
