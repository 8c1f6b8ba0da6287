//! Runtime wiring for the binary: roster source, Last.fm client, scrobbler
//! and result logging.

use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bluos::discovery::LsdpDiscovery;
use crate::bluos::Player;
use crate::config::Config;
use crate::lastfm::{LastFmClient, MaybeUnknown, ScrobbleService};
use crate::scrobbler::{
    ResultFeeds, Scrobbler, ScrobblerHandle, SubmitResult, SubmitScrobbleResult,
    UpdateNowPlayingResult,
};
use crate::session::load_session_key;

/// Run the scrobbler until `shutdown` resolves.
pub async fn run(config: &Config, shutdown: impl Future<Output = ()>) -> Result<()> {
    let session_path = config.session.file_path();
    let session_key = load_session_key(&session_path)?.ok_or_else(|| {
        anyhow!(
            "No Last.fm session found in {}. Run `bluos-scrobbler login` first.",
            session_path.display()
        )
    })?;

    let client = LastFmClient::new(config.lastfm.credentials())
        .context("building Last.fm client")?
        .with_base_url(config.lastfm.base_url.clone());

    let app = App::start(config, Arc::new(client), session_key)?;
    shutdown.await;
    app.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Where the player roster comes from
enum RosterSource {
    /// Players fixed by configuration
    Static(watch::Sender<Vec<Player>>),
    /// Players found with LSDP
    Discovery {
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    },
}

impl RosterSource {
    fn start(config: &Config) -> (Self, watch::Receiver<Vec<Player>>) {
        let players = config.static_players();
        if !players.is_empty() {
            tracing::info!("Using configured players: {:?}", players);
            let (tx, rx) = watch::channel(players);
            return (RosterSource::Static(tx), rx);
        }

        tracing::info!("No players configured, discovering them with LSDP");
        let (tx, rx) = watch::channel(Vec::new());
        let shutdown = CancellationToken::new();
        let discovery = LsdpDiscovery::new(config.discovery_query_interval());
        let task = tokio::spawn(discovery.run(tx, shutdown.clone()));
        (RosterSource::Discovery { shutdown, task }, rx)
    }

    async fn stop(self) {
        match self {
            RosterSource::Static(_) => {}
            RosterSource::Discovery { shutdown, task } => {
                shutdown.cancel();
                if let Err(e) = task.await {
                    tracing::warn!("Discovery task ended abnormally: {}", e);
                }
            }
        }
    }
}

/// A running scrobbler together with its roster source and result logger
pub struct App {
    roster: RosterSource,
    scrobbler: ScrobblerHandle,
    logger: JoinHandle<()>,
}

impl App {
    pub fn start(config: &Config, service: Arc<dyn ScrobbleService>, session_key: String) -> Result<Self> {
        let (roster, players) = RosterSource::start(config);
        let (scrobbler, feeds) = Scrobbler::start(players, service, session_key, config.scrobbler_options())
            .context("starting scrobbler")?;
        let logger = tokio::spawn(log_results(feeds));
        Ok(Self {
            roster,
            scrobbler,
            logger,
        })
    }

    pub async fn stop(self) {
        self.roster.stop().await;
        self.scrobbler.stop().await;
        // Feeds close once the scrobbler is gone, which ends the logger
        if let Err(e) = self.logger.await {
            tracing::warn!("Result logger ended abnormally: {}", e);
        }
    }
}

enum Outcome {
    NowPlaying(UpdateNowPlayingResult),
    Scrobble(SubmitScrobbleResult),
}

async fn log_results(feeds: ResultFeeds) {
    let now_playing = UnboundedReceiverStream::new(feeds.now_playing).map(Outcome::NowPlaying);
    let scrobbles = UnboundedReceiverStream::new(feeds.scrobbles).map(Outcome::Scrobble);
    let mut outcomes = now_playing.merge(scrobbles);

    while let Some(outcome) = outcomes.next().await {
        match outcome {
            Outcome::NowPlaying(result) => log_now_playing(&result),
            Outcome::Scrobble(result) => log_scrobble(&result),
        }
    }
}

fn log_now_playing(result: &UpdateNowPlayingResult) {
    match result {
        SubmitResult::Success { response, .. } => {
            tracing::debug!("Now playing response: {}", to_json(response));
        }
        SubmitResult::Error { message, error, .. } => {
            tracing::error!("{}: {}", message, error);
        }
    }
}

fn log_scrobble(result: &SubmitScrobbleResult) {
    match result {
        SubmitResult::Success { context, response } => {
            if let MaybeUnknown::Known(scrobbles) = response {
                for ignored in scrobbles
                    .scrobbles
                    .iter()
                    .filter(|s| s.ignored_message.is_ignored())
                {
                    tracing::warn!(
                        "Last.fm ignored scrobble for {} (code {}): {}",
                        context.unit_label(),
                        ignored.ignored_message.code,
                        ignored.ignored_message.message
                    );
                }
            }
            tracing::debug!("Scrobble response: {}", to_json(response));
        }
        SubmitResult::Error { message, error, .. } => {
            tracing::error!("{}: {}", message, error);
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("<unserializable: {}>", e))
}
