//! Logical playback units
//!
//! Players in a sync group report the same track at the same time. Keying
//! scrobble state by group name instead of by player makes the group count as
//! one listener. A player may move between units from one snapshot to the
//! next, so the unit is re-derived on every snapshot.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::bluos::{Player, PlayingTrack};

/// `group:<name>` for grouped players, `player:<host>:<port>` otherwise
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalUnitId(String);

impl LogicalUnitId {
    pub fn for_snapshot(player: &Player, track: &PlayingTrack) -> Self {
        match &track.group_name {
            Some(name) => Self(format!("group:{}", name)),
            None => Self(format!("player:{}:{}", player.host, player.port)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalUnitState {
    pub id: LogicalUnitId,
    pub track: PlayingTrack,
    pub members: BTreeSet<Player>,
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A fresh state record was created for the unit
    NewTrack,
    /// Same track on the same unit; only progress fields changed
    Progress,
}

#[derive(Debug, Clone)]
pub struct ResolvedUnit {
    pub transition: Transition,
    pub state: LogicalUnitState,
    /// Unit the player moved out of, when it was the last member
    pub vacated: Option<LogicalUnitId>,
}

/// Table of unit states plus the unit each player was last seen in
#[derive(Debug, Default)]
pub struct LogicalUnitResolver {
    units: HashMap<LogicalUnitId, LogicalUnitState>,
    player_units: HashMap<Player, LogicalUnitId>,
}

impl LogicalUnitResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one snapshot into the table.
    ///
    /// Returns `None` for snapshots that are not actively playing; those
    /// leave the table untouched.
    pub fn resolve(&mut self, player: &Player, track: PlayingTrack) -> Option<ResolvedUnit> {
        if !track.is_playing() {
            return None;
        }

        let id = LogicalUnitId::for_snapshot(player, &track);
        let previous = self.player_units.insert(player.clone(), id.clone());
        let (moved, vacated) = match previous {
            Some(previous) if previous != id => {
                let vacated = self.leave(&previous, player).then_some(previous);
                (true, vacated)
            }
            _ => (false, None),
        };

        let transition = match self.units.get_mut(&id) {
            Some(state) if !moved && state.track.is_same_track(&track) => {
                state.track = track;
                state.members.insert(player.clone());
                Transition::Progress
            }
            existing => {
                let mut members = existing.map(|s| s.members.clone()).unwrap_or_default();
                members.insert(player.clone());
                let state = LogicalUnitState {
                    id: id.clone(),
                    group_name: track.group_name.clone(),
                    track,
                    members,
                };
                self.units.insert(id.clone(), state);
                Transition::NewTrack
            }
        };

        let state = self.units.get(&id)?.clone();
        Some(ResolvedUnit {
            transition,
            state,
            vacated,
        })
    }

    /// Forget a player that is no longer polled. Returns its unit when the
    /// player was the last member.
    pub fn remove_player(&mut self, player: &Player) -> Option<LogicalUnitId> {
        let id = self.player_units.remove(player)?;
        self.leave(&id, player).then_some(id)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.player_units.keys()
    }

    pub fn unit(&self, id: &LogicalUnitId) -> Option<&LogicalUnitState> {
        self.units.get(id)
    }

    pub fn unit_of(&self, player: &Player) -> Option<&LogicalUnitId> {
        self.player_units.get(player)
    }

    /// Remove `player` from `id`, dropping the unit once it is empty.
    /// Returns whether the unit was dropped.
    fn leave(&mut self, id: &LogicalUnitId, player: &Player) -> bool {
        let now_empty = match self.units.get_mut(id) {
            Some(state) => {
                state.members.remove(player);
                state.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.units.remove(id);
        }
        now_empty
    }
}
