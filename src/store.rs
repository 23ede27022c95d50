// Slot State Store
//
// Client-side source of truth for slot availability of the active
// subscription. Only the session pipeline writes to it; everyone else reads
// immutable `SlotView` snapshots.

use crate::codec::{UpdateEvent, UpdateKind};
use crate::connection::ConnectionState;
use crate::error::ConsistencyError;
use crate::model::{ServerTimestamp, SlotRef, SlotTime, SubscriptionKey, TimeSlot};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Result of feeding one event to the store
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Incremental change applied
    Applied,
    /// Slot map replaced by a snapshot
    Replaced,
    /// Event at or before the last-applied timestamp; nothing changed
    Stale,
    /// Event belongs to a stream other than the active subscription
    ForeignStream,
    /// No subscription is active
    NoSubscription,
    /// Event carries nothing the store tracks
    Ignored,
    /// Counts would have left their valid range; a resync has been requested
    Fault(ConsistencyError),
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Applied | Self::Replaced | Self::Fault(_))
    }
}

/// Read-only view of the slot map handed to renderers and the coordinator
#[derive(Debug, Clone, Default)]
pub struct SlotView {
    pub key: Option<SubscriptionKey>,
    pub slots: Arc<BTreeMap<SlotTime, TimeSlot>>,
    /// Data may not match the server; new claims are refused
    pub stale: bool,
    /// Slot provisionally held by this client's own claim
    pub claimed: Option<SlotTime>,
    pub last_update: Option<DateTime<Utc>>,
}

impl SlotView {
    pub fn get(&self, time: SlotTime) -> Option<&TimeSlot> {
        self.slots.get(&time)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeSlot> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Available for this user: server has capacity and it is not our own pending lock
    pub fn is_available(&self, time: SlotTime) -> bool {
        self.claimed != Some(time) && self.get(time).is_some_and(TimeSlot::available)
    }

    pub fn available_times(&self) -> Vec<SlotTime> {
        self.slots
            .values()
            .filter(|slot| self.is_available(slot.time()))
            .map(TimeSlot::time)
            .collect()
    }
}

/// Authoritative local cache for one subscription
#[derive(Debug, Default)]
pub struct SlotStateStore {
    key: Option<SubscriptionKey>,
    slots: Arc<BTreeMap<SlotTime, TimeSlot>>,
    /// Last applied server timestamp per slot
    applied_at: HashMap<SlotTime, ServerTimestamp>,
    /// Timestamp of the snapshot currently in place
    snapshot_at: Option<ServerTimestamp>,
    /// Highest timestamp applied on the stream
    high_water: Option<ServerTimestamp>,
    awaiting_snapshot: bool,
    live: bool,
    resync_requested: bool,
    last_update: Option<DateTime<Utc>>,
    faults: u64,
}

impl SlotStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self) -> Option<&SubscriptionKey> {
        self.key.as_ref()
    }

    /// Switch to another subscription, discarding everything held for the old one
    pub fn set_subscription(&mut self, key: SubscriptionKey) {
        if self.key.as_ref() == Some(&key) {
            return;
        }
        info!(subscription = %key, "Slot store switched subscription");
        self.key = Some(key);
        self.reset();
    }

    pub fn clear_subscription(&mut self) {
        self.key = None;
        self.reset();
        self.awaiting_snapshot = false;
    }

    fn reset(&mut self) {
        self.slots = Arc::new(BTreeMap::new());
        self.applied_at.clear();
        self.snapshot_at = None;
        self.high_water = None;
        self.awaiting_snapshot = true;
        self.resync_requested = false;
        self.last_update = None;
    }

    /// Track the connection so data is flagged stale whenever the feed is not live.
    /// Leaving the live state means a fresh snapshot is required before the data
    /// can be trusted again.
    pub fn set_connection_state(&mut self, state: ConnectionState) {
        let live = state == ConnectionState::Subscribed;
        if self.live && !live {
            debug!(state = %state, "Slot data marked stale");
            self.awaiting_snapshot = self.key.is_some();
        }
        self.live = live;
    }

    pub fn is_stale(&self) -> bool {
        !self.live || self.awaiting_snapshot
    }

    pub fn is_awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    pub fn fault_count(&self) -> u64 {
        self.faults
    }

    pub fn get(&self, time: SlotTime) -> Option<&TimeSlot> {
        self.slots.get(&time)
    }

    /// Hand out a pending resync request exactly once
    pub fn take_resync_request(&mut self) -> bool {
        std::mem::take(&mut self.resync_requested)
    }

    /// Immutable view for rendering. `claimed` is shown as provisionally
    /// unavailable when it belongs to the active stream.
    pub fn snapshot(&self, claimed: Option<&SlotRef>) -> SlotView {
        let claimed = match (&self.key, claimed) {
            (Some(key), Some(slot)) if slot.stream() == key.stream() => Some(slot.time),
            _ => None,
        };
        SlotView {
            key: self.key.clone(),
            slots: Arc::clone(&self.slots),
            stale: self.is_stale(),
            claimed,
            last_update: self.last_update,
        }
    }

    pub fn apply_event(&mut self, event: &UpdateEvent) -> ApplyOutcome {
        let Some(key) = &self.key else {
            return ApplyOutcome::NoSubscription;
        };
        if event.stream.provider_id != key.provider_id || event.stream.date != key.date {
            debug!(stream = %event.stream, "Discarding event for inactive stream");
            return ApplyOutcome::ForeignStream;
        }

        let ts = event.server_timestamp;
        match &event.kind {
            UpdateKind::ProviderUpdate { slots } => self.replace(slots, ts),
            UpdateKind::SlotBooked { time } => self.adjust(*time, ts, true),
            UpdateKind::SlotReleased { time } => self.adjust(*time, ts, false),
            UpdateKind::SystemUpdate { .. } => ApplyOutcome::Ignored,
        }
    }

    fn replace(&mut self, slots: &[TimeSlot], ts: ServerTimestamp) -> ApplyOutcome {
        // While a snapshot is owed any snapshot is accepted, so a server whose
        // clock restarted cannot wedge the store.
        if !self.awaiting_snapshot && self.high_water.is_some_and(|hw| ts < hw) {
            debug!(ts, "Discarding snapshot older than applied events");
            return ApplyOutcome::Stale;
        }

        self.slots = Arc::new(slots.iter().map(|s| (s.time(), s.clone())).collect());
        self.applied_at = slots.iter().map(|s| (s.time(), ts)).collect();
        self.snapshot_at = Some(ts);
        self.high_water = Some(ts);
        self.awaiting_snapshot = false;
        self.resync_requested = false;
        self.last_update = Some(Utc::now());
        info!(slots = slots.len(), ts, "Slot snapshot applied");
        ApplyOutcome::Replaced
    }

    fn adjust(&mut self, time: SlotTime, ts: ServerTimestamp, booked: bool) -> ApplyOutcome {
        let last = self.applied_at.get(&time).copied().or(self.snapshot_at);
        if last.is_some_and(|last| ts <= last) {
            debug!(%time, ts, "Discarding stale or duplicate slot event");
            return ApplyOutcome::Stale;
        }

        let slots = Arc::make_mut(&mut self.slots);
        let result = match slots.get_mut(&time) {
            Some(slot) if booked => slot.try_book(),
            Some(slot) => slot.try_release(),
            None => Err(ConsistencyError::UnknownSlot {
                time: time.to_string(),
            }),
        };

        self.applied_at.insert(time, ts);
        self.high_water = Some(self.high_water.map_or(ts, |hw| hw.max(ts)));
        self.last_update = Some(Utc::now());

        match result {
            Ok(()) => ApplyOutcome::Applied,
            Err(e) => {
                self.faults += 1;
                error!(error = %e, ts, "Slot consistency fault; requesting resync");
                self.resync_requested = true;
                self.awaiting_snapshot = true;
                ApplyOutcome::Fault(e)
            }
        }
    }
}
