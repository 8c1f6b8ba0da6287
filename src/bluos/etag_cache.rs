//! Last-seen status etag per player
//!
//! Each poll loop is the only writer for its own player's entry. The whole
//! map is published through a `watch` channel so a loop can notice when its
//! entry is evicted or replaced from outside while a request is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use super::Player;

type EtagMap = HashMap<Player, String>;

#[derive(Clone)]
pub struct EtagCache {
    tx: Arc<watch::Sender<EtagMap>>,
}

impl Default for EtagCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EtagCache {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(EtagMap::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self, player: &Player) -> Option<String> {
        self.tx.borrow().get(player).cloned()
    }

    pub fn set(&self, player: &Player, etag: String) {
        self.tx.send_if_modified(|map| {
            if map.get(player) == Some(&etag) {
                return false;
            }
            map.insert(player.clone(), etag);
            true
        });
    }

    pub fn evict(&self, player: &Player) {
        self.tx.send_if_modified(|map| map.remove(player).is_some());
    }

    /// Live view of the whole cache
    pub fn subscribe(&self) -> watch::Receiver<EtagMap> {
        self.tx.subscribe()
    }

    /// Resolve once `player`'s entry no longer equals `seen`.
    pub async fn changed(&self, player: &Player, seen: Option<&str>) {
        let mut rx = self.tx.subscribe();
        loop {
            if rx.borrow_and_update().get(player).map(String::as_str) != seen {
                return;
            }
            // The sender lives as long as `self`, so this only fails if the
            // cache is being torn down.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
