//! Per-unit gating of the two submission triggers
//!
//! Each trigger is distinct-until-changed per logical unit: now-playing fires
//! for an active track that differs from the unit's last announced track, and
//! scrobble fires for a track past the threshold that differs from the unit's
//! last scrobbled track. The two are tracked separately, so a grouped player
//! that still reports the previous track cannot re-arm a scrobble.

use std::collections::HashMap;

use super::logical_unit::{LogicalUnitId, LogicalUnitState};
use crate::bluos::PlayingTrack;

/// When a track counts as listened to
#[derive(Debug, Clone)]
pub struct ScrobbleThreshold {
    /// Fraction of the track length that must have elapsed
    pub ratio: f64,
    /// Length assumed for tracks that report none, in seconds
    pub fallback_track_length: f64,
}

impl Default for ScrobbleThreshold {
    fn default() -> Self {
        Self {
            ratio: 0.5,
            fallback_track_length: 90.0,
        }
    }
}

impl ScrobbleThreshold {
    pub fn is_reached(&self, track: &PlayingTrack) -> bool {
        track.has_played_over_threshold(self.ratio, self.fallback_track_length)
    }
}

/// A snapshot together with the unit it was resolved to
#[derive(Debug, Clone, PartialEq)]
pub struct TrackWithContext {
    pub track: PlayingTrack,
    pub logical_unit_id: LogicalUnitId,
    pub group_name: Option<String>,
}

impl TrackWithContext {
    pub fn from_state(state: &LogicalUnitState) -> Self {
        Self {
            track: state.track.clone(),
            logical_unit_id: state.id.clone(),
            group_name: state.group_name.clone(),
        }
    }

    /// `group "Name"` or `logical unit <id>`, for log lines and error messages
    pub fn unit_label(&self) -> String {
        match &self.group_name {
            Some(name) => format!("group \"{}\"", name),
            None => format!("logical unit {}", self.logical_unit_id),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct SessionEvents {
    pub now_playing: Option<TrackWithContext>,
    pub scrobble: Option<TrackWithContext>,
}

/// Last track identities a unit submitted
#[derive(Debug, Default)]
struct UnitHistory {
    announced: Option<PlayingTrack>,
    scrobbled: Option<PlayingTrack>,
}

fn is_repeat(last: &Option<PlayingTrack>, track: &PlayingTrack) -> bool {
    last.as_ref().is_some_and(|last| last.is_same_track(track))
}

#[derive(Debug, Default)]
pub struct TrackSessionTracker {
    threshold: ScrobbleThreshold,
    units: HashMap<LogicalUnitId, UnitHistory>,
}

impl TrackSessionTracker {
    pub fn new(threshold: ScrobbleThreshold) -> Self {
        Self {
            threshold,
            units: HashMap::new(),
        }
    }

    pub fn observe(&mut self, context: TrackWithContext) -> SessionEvents {
        if !context.track.is_playing() {
            return SessionEvents::default();
        }

        let history = self.units.entry(context.logical_unit_id.clone()).or_default();

        let now_playing = if is_repeat(&history.announced, &context.track) {
            None
        } else {
            history.announced = Some(context.track.clone());
            Some(context.clone())
        };

        let scrobble = if self.threshold.is_reached(&context.track)
            && !is_repeat(&history.scrobbled, &context.track)
        {
            history.scrobbled = Some(context.track.clone());
            Some(context)
        } else {
            None
        };

        SessionEvents {
            now_playing,
            scrobble,
        }
    }

    /// Drop what is remembered about `unit`
    pub fn forget(&mut self, unit: &LogicalUnitId) {
        self.units.remove(unit);
    }

    pub fn tracked_units(&self) -> usize {
        self.units.len()
    }
}
