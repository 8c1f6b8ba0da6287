//! Mock Last.fm web service for testing
//!
//! Handles the auth and track methods on a single endpoint, records every
//! call's parameters and can fail a scripted number of calls per method.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

pub const TOKEN: &str = "TOKEN123";
pub const SESSION_KEY: &str = "SESSIONKEY";

/// Parameters of one recorded call
pub type Call = HashMap<String, String>;

#[derive(Default)]
struct MockLastFmState {
    calls: Vec<Call>,
    /// Remaining calls to fail, per method
    failures: HashMap<String, u32>,
}

/// Mock Last.fm server
pub struct MockLastFm {
    addr: SocketAddr,
    state: Arc<RwLock<MockLastFmState>>,
    handle: JoinHandle<()>,
}

impl MockLastFm {
    /// Start a mock Last.fm server on a random port
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(MockLastFmState::default()));

        let app = Router::new()
            .route("/", get(handle_get).post(handle_post))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Fail the next `count` calls of `method` with an API error
    pub async fn fail_next(&self, method: &str, count: u32) {
        self.state
            .write()
            .await
            .failures
            .insert(method.to_string(), count);
    }

    pub async fn calls(&self, method: &str) -> Vec<Call> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.get("method").map(String::as_str) == Some(method))
            .cloned()
            .collect()
    }

    /// Stop the mock server
    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_get(
    State(state): State<Arc<RwLock<MockLastFmState>>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    respond(&state, params).await
}

async fn handle_post(
    State(state): State<Arc<RwLock<MockLastFmState>>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    respond(&state, params).await
}

async fn respond(state: &RwLock<MockLastFmState>, params: Call) -> Response {
    let method = params.get("method").cloned().unwrap_or_default();
    let fail = {
        let mut state = state.write().await;
        state.calls.push(params.clone());
        match state.failures.get_mut(&method) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    };

    if fail {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": 16, "message": "Service temporarily unavailable" })),
        )
            .into_response();
    }

    match method.as_str() {
        "auth.gettoken" => Json(json!({ "token": TOKEN })).into_response(),
        "auth.getSession" => {
            if params.get("token").map(String::as_str) != Some(TOKEN) {
                return Json(json!({ "error": 4, "message": "Invalid authentication token" }))
                    .into_response();
            }
            Json(json!({ "session": { "name": "listener", "key": SESSION_KEY, "subscriber": 0 } }))
                .into_response()
        }
        "track.updateNowPlaying" => Json(json!({ "nowplaying": acknowledgement(&params) })).into_response(),
        "track.scrobble" => Json(json!({
            "scrobbles": {
                "scrobble": acknowledgement(&params),
                "@attr": { "accepted": 1, "ignored": 0 }
            }
        }))
        .into_response(),
        _ => Json(json!({ "error": 3, "message": "Invalid Method - No method with that name in this package" }))
            .into_response(),
    }
}

fn acknowledgement(params: &Call) -> Value {
    let field = |name: &str| params.get(name).cloned().unwrap_or_default();
    json!({
        "artist": { "corrected": "0", "#text": field("artist") },
        "track": { "corrected": "0", "#text": field("track") },
        "album": { "corrected": "0", "#text": field("album") },
        "albumArtist": { "corrected": "0", "#text": "" },
        "ignoredMessage": { "code": "0", "#text": "" },
        "timestamp": field("timestamp")
    })
}
