// Presence Aggregation
//
// Viewer count and a short rolling feed of recent slot activity. Everything
// here is advisory and derived from validated updates; it never touches the
// slot store.

use crate::codec::{UpdateEvent, UpdateKind};
use crate::model::{ServerTimestamp, SlotTime};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_ACTIVITY_CAPACITY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Booked,
    Released,
    ProviderUpdate,
}

/// One line of the recent-activity feed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub kind: ActivityKind,
    pub time: Option<SlotTime>,
    pub server_timestamp: ServerTimestamp,
    pub received_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn describe(&self) -> String {
        match (self.kind, self.time) {
            (ActivityKind::Booked, Some(time)) => format!("Slot {} was just booked", time),
            (ActivityKind::Released, Some(time)) => format!("Slot {} is now available", time),
            _ => "Provider availability updated".to_string(),
        }
    }
}

/// Presence state published to observers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub viewers: u32,
    pub others_viewing: u32,
    /// Newest first
    pub recent: Vec<ActivityEntry>,
    pub state_version: u64,
}

/// Presence aggregator
#[derive(Debug)]
pub struct PresenceAggregator {
    capacity: usize,
    /// Newest at the front
    recent: VecDeque<ActivityEntry>,
    viewers: u32,
    /// Bumped on every visible change
    state_version: u64,
}

impl PresenceAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recent: VecDeque::with_capacity(capacity),
            viewers: 0,
            state_version: 0,
        }
    }

    /// Fold an update into the feed. Returns true when anything visible changed.
    pub fn record(&mut self, event: &UpdateEvent) -> bool {
        let (kind, time) = match &event.kind {
            UpdateKind::SlotBooked { time } => (ActivityKind::Booked, Some(*time)),
            UpdateKind::SlotReleased { time } => (ActivityKind::Released, Some(*time)),
            UpdateKind::ProviderUpdate { .. } => (ActivityKind::ProviderUpdate, None),
            UpdateKind::SystemUpdate { viewers_count, .. } => {
                return match viewers_count {
                    Some(count) if *count != self.viewers => {
                        self.viewers = *count;
                        self.state_version += 1;
                        true
                    }
                    _ => false,
                };
            }
        };

        if self.capacity == 0 {
            return false;
        }
        self.recent.push_front(ActivityEntry {
            kind,
            time,
            server_timestamp: event.server_timestamp,
            received_at: Utc::now(),
        });
        self.recent.truncate(self.capacity);
        self.state_version += 1;
        true
    }

    pub fn viewers(&self) -> u32 {
        self.viewers
    }

    /// Viewers other than this client
    pub fn others_viewing(&self) -> u32 {
        self.viewers.saturating_sub(1)
    }

    pub fn recent(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.recent.iter()
    }

    pub fn state_version(&self) -> u64 {
        self.state_version
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            viewers: self.viewers,
            others_viewing: self.others_viewing(),
            recent: self.recent.iter().cloned().collect(),
            state_version: self.state_version,
        }
    }

    /// Forget everything, e.g. after switching subscription
    pub fn clear(&mut self) {
        self.recent.clear();
        self.viewers = 0;
        self.state_version += 1;
    }
}

impl Default for PresenceAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_CAPACITY)
    }
}
