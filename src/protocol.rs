// Availability WebSocket Protocol
//
// Wire shapes exchanged with the availability service. All frames are JSON
// text messages tagged by a `type` field.
//
// Protocol flow:
// 1. Client sends "subscribe" for (providerId, serviceId, date), always asking
//    for a full snapshot
// 2. Server replies with a "provider_update" carrying the complete slot list
// 3. Server pushes "slot_booked" / "slot_released" / "system_update" deltas
// 4. Client sends "claim_slot" / "release_slot"; server answers claims with
//    "claim_result"

use crate::model::{ClientId, ServerTimestamp, SlotRef, SlotTime, SubscriptionKey};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Frame sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        #[serde(flatten)]
        key: SubscriptionKey,
        /// Ask for a complete slot list before any delta
        snapshot: bool,
    },

    Unsubscribe {
        #[serde(flatten)]
        key: SubscriptionKey,
    },

    /// Resynchronization request for the active subscription
    RequestSnapshot {
        #[serde(flatten)]
        key: SubscriptionKey,
    },

    ClaimSlot {
        #[serde(flatten)]
        slot: SlotRef,
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },

    ReleaseSlot {
        #[serde(flatten)]
        slot: SlotRef,
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },

    /// Advisory notice so other viewers can see a selection in progress
    SlotSelected {
        #[serde(flatten)]
        slot: SlotRef,
    },

    /// Application-level keepalive
    Ping {},
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::RequestSnapshot { .. } => "request_snapshot",
            Self::ClaimSlot { .. } => "claim_slot",
            Self::ReleaseSlot { .. } => "release_slot",
            Self::SlotSelected { .. } => "slot_selected",
            Self::Ping {} => "ping",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Loosely-typed inbound frame as it appears on the wire.
///
/// Every field beyond `type` is optional here; the codec decides which ones a
/// given message kind requires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawServerFrame {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    /// Type-specific body
    #[serde(default, alias = "payload", skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,

    #[serde(default, alias = "serverTimestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<ServerTimestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// "confirmed" or "rejected" on claim results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One slot entry inside a `provider_update` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSlot {
    pub time: SlotTime,
    pub capacity: u32,
    #[serde(default)]
    pub current_bookings: u32,
}

/// Body of a `provider_update`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUpdateBody {
    pub slots: Vec<RawSlot>,
}

/// Body of a `system_update`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemUpdateBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewers_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Build the `provider_update` frame a server would send for a slot list.
/// Used by fakes and tooling that stand in for the availability service.
pub fn provider_update_frame(
    provider_id: &str,
    date: NaiveDate,
    timestamp: ServerTimestamp,
    slots: Vec<RawSlot>,
) -> RawServerFrame {
    RawServerFrame {
        kind: "provider_update".to_string(),
        provider_id: Some(provider_id.to_string()),
        date: Some(date.to_string()),
        data: serde_json::to_value(ProviderUpdateBody { slots }).ok(),
        timestamp: Some(timestamp),
        ..Default::default()
    }
}
