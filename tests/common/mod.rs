// In-memory transport for driving a session without a network.
//
// `FakeConnector` hands the test a `ServerSide` for every successful connect;
// the test plays the availability service through it.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use slotsync::protocol::{provider_update_frame, RawSlot};
use slotsync::{
    Channel, Connector, Inbound, SlotTime, SubscriptionKey, SyncConfig, TransportError,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub struct FakeConnector {
    failures_left: AtomicU32,
    /// Connects after this many successes never complete
    hang_after: Option<u32>,
    opened: AtomicU32,
    attempts: Mutex<Vec<Instant>>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        Self::failing(0)
    }

    /// The first `failures` connects are refused
    pub fn failing(failures: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        Self::build(failures, None)
    }

    /// The first `successes` connects open; every later one hangs
    pub fn hanging_after(successes: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        Self::build(0, Some(successes))
    }

    fn build(
        failures: u32,
        hang_after: Option<u32>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            hang_after,
            opened: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
            servers,
        });
        (connector, rx)
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Channel>, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());

        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let opened = self.opened.fetch_add(1, Ordering::SeqCst);
        if self.hang_after.is_some_and(|limit| opened >= limit) {
            std::future::pending::<()>().await;
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerSide {
            to_client,
            from_client,
        });
        Ok(Box::new(FakeChannel { inbound, outbound }))
    }
}

pub struct FakeChannel {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Channel for FakeChannel {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(text)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        Ok(self.inbound.recv().await.unwrap_or(Inbound::Closed))
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Server end of one fake channel
pub struct ServerSide {
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerSide {
    pub fn send_json(&self, value: Value) {
        let _ = self.to_client.send(Inbound::Text(value.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(Inbound::Text(text.to_string()));
    }

    /// Next client frame exactly as sent
    pub async fn next_raw(&mut self) -> String {
        self.from_client
            .recv()
            .await
            .expect("client channel closed")
    }

    /// Next client frame, skipping keepalive pings
    pub async fn next_frame(&mut self) -> Value {
        loop {
            let text = self.next_raw().await;
            let value: Value = serde_json::from_str(&text).expect("client sent invalid JSON");
            if value["type"] != "ping" {
                return value;
            }
        }
    }

    /// Next client frame, or None if nothing arrives within `wait`
    pub async fn try_next_frame(&mut self, wait: Duration) -> Option<Value> {
        tokio::time::timeout(wait, self.next_frame()).await.ok()
    }

    pub fn close(self) {
        let _ = self.to_client.send(Inbound::Closed);
    }
}

pub fn key() -> SubscriptionKey {
    SubscriptionKey::new("dr-pedro", "cleaning", date())
}

pub fn date() -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()
}

pub fn at(h: u32, m: u32) -> SlotTime {
    SlotTime::new(h, m).unwrap()
}

/// Deterministic timings: no jitter and heartbeats far beyond any test
pub fn test_config(client_id: &str) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.client_id = Some(client_id.to_string());
    config.reconnect.jitter = 0.0;
    config.heartbeat.idle_timeout_ms = 24 * 3_600_000;
    config.heartbeat.ping_interval_ms = 12 * 3_600_000;
    config
}

pub fn snapshot(ts: u64, slots: &[(&str, u32, u32)]) -> Value {
    let slots = slots
        .iter()
        .map(|(time, capacity, booked)| RawSlot {
            time: time.parse().unwrap(),
            capacity: *capacity,
            current_bookings: *booked,
        })
        .collect();
    serde_json::to_value(provider_update_frame("dr-pedro", date(), ts, slots)).unwrap()
}

pub fn slot_event(kind: &str, ts: u64, time: &str) -> Value {
    json!({
        "type": kind,
        "providerId": "dr-pedro",
        "date": "2026-10-20",
        "time": time,
        "timestamp": ts,
    })
}

pub fn claim_result(client_id: &str, time: &str, status: &str) -> Value {
    json!({
        "type": "claim_result",
        "providerId": "dr-pedro",
        "date": "2026-10-20",
        "time": time,
        "clientId": client_id,
        "status": status,
    })
}
