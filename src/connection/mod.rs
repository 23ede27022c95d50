// Connection Manager
//
// Owns the lifecycle of the single logical channel to the availability
// service: connection state, the desired subscription, the reconnect attempt
// counter and the backoff/idle deadlines. It performs no I/O itself; the
// session driver feeds it connection events and sends the frames it returns.

pub mod backoff;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use transport::{Channel, Connector, Inbound, WsChannel, WsConnector};

use crate::model::SubscriptionKey;
use crate::protocol::ClientFrame;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Connection state as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Channel open, snapshot for the desired subscription not yet received
    Connected,
    /// Live: snapshot received, deltas flowing
    Subscribed,
    /// Channel lost, waiting for the next backoff retry
    Reconnecting,
    /// Retry budget exhausted; needs an explicit refresh
    Offline,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Subscribed => "subscribed",
            Self::Reconnecting => "reconnecting",
            Self::Offline => "offline",
        }
    }

    pub fn has_channel(&self) -> bool {
        matches!(self, Self::Connected | Self::Subscribed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session connection state machine
#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    policy: ReconnectPolicy,
    idle_timeout: Duration,
    /// Consecutive retries scheduled since the last snapshot
    attempts: u32,
    desired: Option<SubscriptionKey>,
    /// Subscription sent on the current channel
    active: Option<SubscriptionKey>,
    retry_at: Option<Instant>,
    last_seen: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy, idle_timeout: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            idle_timeout,
            attempts: 0,
            desired: None,
            active: None,
            retry_at: None,
            last_seen: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn desired(&self) -> Option<&SubscriptionKey> {
        self.desired.as_ref()
    }

    pub fn active(&self) -> Option<&SubscriptionKey> {
        self.active.as_ref()
    }

    /// When the pending backoff timer fires
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// When the channel is considered dead if nothing arrives before then
    pub fn idle_deadline(&self) -> Option<Instant> {
        if !self.state.has_channel() {
            return None;
        }
        self.last_seen.map(|seen| seen + self.idle_timeout)
    }

    /// Enter `connecting`. Returns false when a channel is already open or opening.
    pub fn start_connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Reconnecting | ConnectionState::Offline => {
                self.state = ConnectionState::Connecting;
                self.retry_at = None;
                true
            }
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Subscribed => false,
        }
    }

    /// Channel opened. Returns the subscribe frame, which always asks for a
    /// full snapshot. The retry budget is only restored once that snapshot
    /// arrives.
    pub fn on_connected(&mut self, now: Instant) -> Vec<ClientFrame> {
        if self.attempts > 0 {
            info!(attempts = self.attempts, "Reconnected");
        } else {
            info!("Connected");
        }
        self.state = ConnectionState::Connected;
        self.retry_at = None;
        self.last_seen = Some(now);
        self.active = self.desired.clone();

        self.active
            .iter()
            .map(|key| ClientFrame::Subscribe {
                key: key.clone(),
                snapshot: true,
            })
            .collect()
    }

    pub fn on_connect_failed(&mut self, now: Instant) -> ConnectionState {
        self.schedule_retry(now)
    }

    /// Open channel dropped, errored or went idle
    pub fn on_channel_lost(&mut self, now: Instant) -> ConnectionState {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Subscribed
        ) {
            return self.state;
        }
        self.active = None;
        self.last_seen = None;
        self.schedule_retry(now)
    }

    fn schedule_retry(&mut self, now: Instant) -> ConnectionState {
        self.active = None;
        self.last_seen = None;
        if self.policy.exhausted(self.attempts) {
            warn!(attempts = self.attempts, "Reconnect budget exhausted; going offline");
            self.state = ConnectionState::Offline;
            self.retry_at = None;
            return self.state;
        }
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        self.retry_at = Some(now + delay);
        self.state = ConnectionState::Reconnecting;
        info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.state
    }

    /// Snapshot for the active subscription arrived. Returns true on the
    /// transition to `subscribed`.
    pub fn on_snapshot(&mut self) -> bool {
        if !self.state.has_channel() || self.active.is_none() {
            return false;
        }
        self.attempts = 0;
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Subscribed;
            return true;
        }
        false
    }

    /// Any inbound traffic, data or protocol-level, proves liveness
    pub fn on_inbound(&mut self, now: Instant) {
        if self.state.has_channel() {
            self.last_seen = Some(now);
        }
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        self.idle_deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Change the desired subscription. With an open channel this yields an
    /// unsubscribe/subscribe pair; otherwise the key is applied on next connect.
    pub fn set_subscription(&mut self, key: SubscriptionKey) -> Vec<ClientFrame> {
        if self.desired.as_ref() == Some(&key) {
            return Vec::new();
        }
        self.desired = Some(key.clone());
        if !self.state.has_channel() {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(2);
        if let Some(old) = self.active.take() {
            frames.push(ClientFrame::Unsubscribe { key: old });
        }
        frames.push(ClientFrame::Subscribe {
            key: key.clone(),
            snapshot: true,
        });
        self.active = Some(key);
        self.state = ConnectionState::Connected;
        frames
    }

    /// Snapshot request for the active subscription, if there is a channel
    pub fn resync_frame(&self) -> Option<ClientFrame> {
        if !self.state.has_channel() {
            return None;
        }
        self.active
            .clone()
            .map(|key| ClientFrame::RequestSnapshot { key })
    }

    /// Forget the retry budget so an explicit refresh can start over
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Tear down; cancels backoff and idle timers
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
        self.retry_at = None;
        self.last_seen = None;
        self.active = None;
    }
}
