//! Mock BluOS player for testing
//!
//! Serves `/Status` the way a player does: a request carrying the current
//! etag is held until the status changes or the `timeout` query parameter
//! runs out. Every request is recorded.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use bluos_scrobbler::bluos::Player;

/// Track the mock player reports
#[derive(Debug, Clone)]
pub struct MockTrack {
    pub artist: String,
    pub album: String,
    pub title: String,
    pub secs: f64,
    pub totlen: Option<f64>,
    pub state: String,
    pub group_name: Option<String>,
}

impl MockTrack {
    pub fn new(artist: &str, album: &str, title: &str) -> Self {
        Self {
            artist: artist.to_string(),
            album: album.to_string(),
            title: title.to_string(),
            secs: 0.0,
            totlen: Some(200.0),
            state: "play".to_string(),
            group_name: None,
        }
    }

    pub fn at(mut self, secs: f64) -> Self {
        self.secs = secs;
        self
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.group_name = Some(group.to_string());
        self
    }
}

/// One recorded `/Status` request
#[derive(Debug, Clone, PartialEq)]
pub struct StatusQuery {
    pub etag: Option<String>,
    pub timeout: Option<String>,
}

struct MockBluosState {
    track: Option<MockTrack>,
    version: u64,
    failing: bool,
    queries: Vec<StatusQuery>,
}

impl MockBluosState {
    fn etag(&self) -> String {
        format!("etag-{}", self.version)
    }

    fn render(&self) -> String {
        match &self.track {
            Some(track) => {
                let mut xml = format!(
                    "<status etag=\"{}\"><artist>{}</artist><album>{}</album>\
                     <title1>{}</title1><title2>{}</title2><title3>{}</title3>\
                     <secs>{}</secs><state>{}</state>",
                    self.etag(),
                    track.artist,
                    track.album,
                    track.title,
                    track.artist,
                    track.album,
                    track.secs,
                    track.state
                );
                if let Some(totlen) = track.totlen {
                    xml.push_str(&format!("<totlen>{}</totlen>", totlen));
                }
                if let Some(group) = &track.group_name {
                    xml.push_str(&format!("<groupName>{}</groupName>", group));
                }
                xml.push_str("</status>");
                xml
            }
            None => format!("<status etag=\"{}\"><state>stop</state></status>", self.etag()),
        }
    }
}

struct Shared {
    state: RwLock<MockBluosState>,
    changes: watch::Sender<u64>,
}

/// Mock BluOS player
pub struct MockBluosPlayer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl MockBluosPlayer {
    /// Start a mock player on a random port, initially stopped
    pub async fn start() -> Self {
        let (changes, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: RwLock::new(MockBluosState {
                track: None,
                version: 1,
                failing: false,
                queries: Vec::new(),
            }),
            changes,
        });

        let app = Router::new()
            .route("/Status", get(handle_status))
            .with_state(shared.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            shared,
            handle,
        }
    }

    pub fn player(&self) -> Player {
        Player::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// Report `track`, bumping the etag
    pub async fn play(&self, track: MockTrack) {
        self.update(|state| state.track = Some(track)).await;
    }

    /// Report a stopped player, bumping the etag
    pub async fn stop_playback(&self) {
        self.update(|state| state.track = None).await;
    }

    /// Answer every request with HTTP 500 while set
    pub async fn set_failing(&self, failing: bool) {
        self.update(|state| state.failing = failing).await;
    }

    pub async fn current_etag(&self) -> String {
        self.shared.state.read().await.etag()
    }

    pub async fn queries(&self) -> Vec<StatusQuery> {
        self.shared.state.read().await.queries.clone()
    }

    async fn update(&self, f: impl FnOnce(&mut MockBluosState)) {
        let version = {
            let mut state = self.shared.state.write().await;
            f(&mut state);
            state.version += 1;
            state.version
        };
        self.shared.changes.send_replace(version);
    }

    /// Stop the mock server
    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_status(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let etag = params.get("etag").cloned();
    let timeout = params.get("timeout").cloned();
    shared.state.write().await.queries.push(StatusQuery {
        etag: etag.clone(),
        timeout: timeout.clone(),
    });

    if let Some(etag) = etag {
        let wait = timeout
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(0);
        let mut changes = shared.changes.subscribe();
        let deadline = tokio::time::sleep(Duration::from_secs(wait));
        tokio::pin!(deadline);
        loop {
            let current = shared.state.read().await.etag();
            if current != etag {
                break;
            }
            tokio::select! {
                _ = &mut deadline => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    let state = shared.state.read().await;
    if state.failing {
        return (StatusCode::INTERNAL_SERVER_ERROR, "unavailable").into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        state.render(),
    )
        .into_response()
}
