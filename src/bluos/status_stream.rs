//! Status events from every player on the roster, merged into one channel
//!
//! A supervisor task follows the roster and keeps exactly one poll task per
//! player. Each poll task owns its player's etag cache entry: it writes the
//! entry after every round and evicts it when it exits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetcher::{FetchError, FetchRetry, LongPoll, StatusFetcher};
use super::parser::parse_status;
use super::{EtagCache, Player, PlayingTrack};

/// One round of a player's poll loop
#[derive(Debug, Clone)]
pub struct PlayerStatus {
    pub player: Player,
    /// `None` when the player reported nothing scrobble-worthy
    pub playing_track: Option<PlayingTrack>,
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub long_poll: LongPoll,
    pub retry: FetchRetry,
    /// Pause before re-polling after a round that left no etag to wait on.
    /// Without it a stopped player would answer every unconditional request
    /// immediately.
    pub idle_delay: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            long_poll: LongPoll::default(),
            retry: FetchRetry::default(),
            idle_delay: Duration::from_secs(5),
        }
    }
}

struct Poller {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Poller {
    async fn stop(self, player: &Player) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Status loop for {} ended abnormally: {}", player, e);
        }
    }
}

/// Start polling every player on `roster` and return the merged event
/// channel together with the supervisor task.
///
/// Cancelling `shutdown` stops the supervisor and all poll tasks, dropping
/// any in-flight requests.
pub fn spawn_player_status_stream(
    settings: &PollSettings,
    cache: EtagCache,
    roster: watch::Receiver<Vec<Player>>,
    shutdown: CancellationToken,
) -> Result<(mpsc::UnboundedReceiver<PlayerStatus>, JoinHandle<()>), FetchError> {
    let fetcher = Arc::new(StatusFetcher::new(
        settings.long_poll.clone(),
        settings.retry.clone(),
    )?);
    let (tx, rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor {
        fetcher,
        cache,
        idle_delay: settings.idle_delay,
        tx,
        shutdown,
        pollers: HashMap::new(),
    };
    let handle = tokio::spawn(supervisor.run(roster));
    Ok((rx, handle))
}

struct Supervisor {
    fetcher: Arc<StatusFetcher>,
    cache: EtagCache,
    idle_delay: Duration,
    tx: mpsc::UnboundedSender<PlayerStatus>,
    shutdown: CancellationToken,
    pollers: HashMap<Player, Poller>,
}

impl Supervisor {
    async fn run(mut self, mut roster: watch::Receiver<Vec<Player>>) {
        loop {
            let players: HashSet<Player> = roster.borrow_and_update().iter().cloned().collect();
            self.reconcile(players).await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = roster.changed() => {
                    if changed.is_err() {
                        // Roster source is gone; keep polling the last known set.
                        self.shutdown.cancelled().await;
                        break;
                    }
                }
            }
        }

        for (player, poller) in self.pollers.drain() {
            poller.stop(&player).await;
        }
        debug!("Player status supervisor stopped");
    }

    /// Bring the poll tasks in line with `players`. Loops of departed players
    /// have exited, and evicted their etag, by the time this returns.
    async fn reconcile(&mut self, players: HashSet<Player>) {
        let departed: Vec<Player> = self
            .pollers
            .keys()
            .filter(|p| !players.contains(*p))
            .cloned()
            .collect();
        for player in departed {
            if let Some(poller) = self.pollers.remove(&player) {
                info!("Player {} left the roster, stopping its status loop", player);
                poller.stop(&player).await;
            }
        }

        for player in players {
            if self.pollers.contains_key(&player) {
                continue;
            }
            info!("Player {} joined the roster, starting its status loop", player);
            let cancel = self.shutdown.child_token();
            let task = tokio::spawn(poll_player(
                player.clone(),
                self.fetcher.clone(),
                self.cache.clone(),
                self.idle_delay,
                self.tx.clone(),
                cancel.clone(),
            ));
            self.pollers.insert(player, Poller { cancel, task });
        }
    }
}

async fn poll_player(
    player: Player,
    fetcher: Arc<StatusFetcher>,
    cache: EtagCache,
    idle_delay: Duration,
    tx: mpsc::UnboundedSender<PlayerStatus>,
    cancel: CancellationToken,
) {
    loop {
        let etag = cache.get(&player);
        let body = tokio::select! {
            _ = cancel.cancelled() => break,
            // Entry evicted or replaced from outside: re-issue with the new state
            _ = cache.changed(&player, etag.as_deref()) => continue,
            body = fetcher.fetch(&player, etag.as_deref()) => body,
        };

        let (etag, playing_track) = match parse_status(&body) {
            Ok(status) => (status.etag, status.playing_track),
            Err(e) => {
                debug!("Ignoring status from {}: {}", player, e);
                (None, None)
            }
        };

        let next_etag = etag.filter(|_| playing_track.is_some());
        match &next_etag {
            Some(etag) => cache.set(&player, etag.clone()),
            None => cache.evict(&player),
        }

        let status = PlayerStatus {
            player: player.clone(),
            playing_track,
        };
        if tx.send(status).is_err() {
            break;
        }

        if next_etag.is_none() && !idle_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle_delay) => {}
            }
        }
    }

    cache.evict(&player);
    debug!("Status loop for {} stopped", player);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(cache: EtagCache) -> Supervisor {
        let fetcher = StatusFetcher::new(LongPoll::default(), FetchRetry::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        Supervisor {
            fetcher: Arc::new(fetcher),
            cache,
            idle_delay: Duration::from_secs(5),
            tx,
            shutdown: CancellationToken::new(),
            pollers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn departed_loop_exits_before_reconcile_returns() {
        let cache = EtagCache::new();
        let mut supervisor = supervisor(cache.clone());
        let player = Player::new("127.0.0.1", 1);

        supervisor.reconcile(HashSet::from([player.clone()])).await;
        assert_eq!(supervisor.pollers.len(), 1);
        supervisor.reconcile(HashSet::new()).await;
        assert!(supervisor.pollers.is_empty());

        // Whatever a rejoining loop writes is not clobbered by the old one
        cache.set(&player, "fresh".to_string());
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.get(&player).as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn rejoining_player_gets_a_new_loop() {
        let mut supervisor = supervisor(EtagCache::new());
        let player = Player::new("127.0.0.1", 1);

        supervisor.reconcile(HashSet::from([player.clone()])).await;
        let first = supervisor.pollers[&player].cancel.clone();
        supervisor.reconcile(HashSet::new()).await;
        assert!(first.is_cancelled());

        supervisor.reconcile(HashSet::from([player.clone()])).await;
        let poller = &supervisor.pollers[&player];
        assert!(!poller.cancel.is_cancelled());
        assert!(!poller.task.is_finished());

        supervisor.shutdown.cancel();
        supervisor.run(watch::channel(vec![player]).1).await;
    }
}
