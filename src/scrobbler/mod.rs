//! Scrobbler core
//!
//! Wires the player status stream through logical unit resolution and track
//! session gating into the submission pipeline:
//!
//! ```text
//! roster ─▶ status stream ─▶ resolver ─▶ session tracker ─▶ pipeline ─▶ feeds
//! ```

pub mod logical_unit;
pub mod pipeline;
pub mod session_tracker;

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bluos::fetcher::FetchError;
use crate::bluos::{spawn_player_status_stream, EtagCache, Player, PlayerStatus, PollSettings};
use crate::lastfm::ScrobbleService;

pub use logical_unit::{LogicalUnitId, LogicalUnitResolver, LogicalUnitState, Transition};
pub use pipeline::{
    ResultFeeds, SubmissionPipeline, SubmitResult, SubmitRetry, SubmitScrobbleResult,
    UpdateNowPlayingResult,
};
pub use session_tracker::{ScrobbleThreshold, SessionEvents, TrackSessionTracker, TrackWithContext};

#[derive(Debug, Clone, Default)]
pub struct ScrobblerOptions {
    pub poll: PollSettings,
    pub threshold: ScrobbleThreshold,
    pub submit_retry: SubmitRetry,
}

/// Owns every task the scrobbler spawned
pub struct ScrobblerHandle {
    shutdown: CancellationToken,
    cache: EtagCache,
    tasks: Vec<JoinHandle<()>>,
}

impl ScrobblerHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The etag cache shared by all poll loops. Evicting an entry makes
    /// that player's next poll unconditional.
    pub fn etag_cache(&self) -> &EtagCache {
        &self.cache
    }

    /// Cancel all tasks and wait for them to finish. In-flight status
    /// requests are dropped and pending scrobble retries are abandoned.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::warn!("Scrobbler task ended abnormally: {}", e);
            }
        }
    }
}

pub struct Scrobbler;

impl Scrobbler {
    /// Start polling the players on `roster` and submitting what they play.
    ///
    /// Returns the stop handle and the now-playing and scrobble result
    /// feeds. The feeds close once the scrobbler has stopped.
    pub fn start(
        roster: watch::Receiver<Vec<Player>>,
        service: Arc<dyn ScrobbleService>,
        session_key: String,
        options: ScrobblerOptions,
    ) -> Result<(ScrobblerHandle, ResultFeeds), FetchError> {
        let shutdown = CancellationToken::new();
        let cache = EtagCache::new();

        let (statuses, stream_task) = spawn_player_status_stream(
            &options.poll,
            cache.clone(),
            roster.clone(),
            shutdown.child_token(),
        )?;
        let (pipeline, feeds) = SubmissionPipeline::new(
            service,
            session_key,
            options.submit_retry,
            shutdown.child_token(),
        );
        let reconciler = Reconciler {
            resolver: LogicalUnitResolver::new(),
            tracker: TrackSessionTracker::new(options.threshold),
            pipeline,
        };
        let reconcile_task =
            tokio::spawn(reconciler.run(statuses, roster, shutdown.child_token()));

        let handle = ScrobblerHandle {
            shutdown,
            cache,
            tasks: vec![stream_task, reconcile_task],
        };
        Ok((handle, feeds))
    }
}

/// Folds status events into unit state and forwards gated events
struct Reconciler {
    resolver: LogicalUnitResolver,
    tracker: TrackSessionTracker,
    pipeline: SubmissionPipeline,
}

impl Reconciler {
    async fn run(
        mut self,
        mut statuses: mpsc::UnboundedReceiver<PlayerStatus>,
        mut roster: watch::Receiver<Vec<Player>>,
        shutdown: CancellationToken,
    ) {
        let mut roster_open = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                status = statuses.recv() => match status {
                    Some(status) => self.handle(status),
                    None => break,
                },
                changed = roster.changed(), if roster_open => {
                    if changed.is_err() {
                        roster_open = false;
                        continue;
                    }
                    let players: HashSet<Player> = roster.borrow_and_update().iter().cloned().collect();
                    self.forget_departed(&players);
                }
            }
        }
        self.pipeline.join().await;
    }

    fn handle(&mut self, status: PlayerStatus) {
        let Some(track) = status.playing_track else {
            return;
        };
        let Some(resolved) = self.resolver.resolve(&status.player, track) else {
            return;
        };

        if let Some(vacated) = &resolved.vacated {
            self.pipeline.retire(vacated);
        }

        let state = &resolved.state;
        match resolved.transition {
            Transition::NewTrack => info!(
                "{} playing {} - {} on {}",
                state.id, state.track.artist, state.track.title, status.player
            ),
            Transition::Progress => debug!(
                "{} at {}s of {} - {}",
                state.id, state.track.secs, state.track.artist, state.track.title
            ),
        }

        let events = self.tracker.observe(TrackWithContext::from_state(state));
        self.pipeline.submit(events);
    }

    /// Drop unit state for players that left the roster
    fn forget_departed(&mut self, players: &HashSet<Player>) {
        let departed: Vec<Player> = self
            .resolver
            .players()
            .filter(|p| !players.contains(*p))
            .cloned()
            .collect();
        for player in departed {
            if let Some(unit) = self.resolver.remove_player(&player) {
                debug!("{} has no players left, dropping its state", unit);
                self.tracker.forget(&unit);
                self.pipeline.retire(&unit);
            }
        }
    }
}
