// Update Codec
//
// Turns inbound text frames into typed server messages. Anything that fails
// validation is logged and dropped here so that no malformed payload ever
// reaches the slot store.

use crate::error::CodecError;
use crate::model::{ClientId, ServerTimestamp, SlotRef, SlotTime, StreamKey, TimeSlot};
use crate::protocol::{ProviderUpdateBody, RawServerFrame, SystemUpdateBody};
use chrono::NaiveDate;
use std::collections::HashSet;
use tracing::{debug, error, warn};

/// A validated availability update for one (provider, date) stream
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub stream: StreamKey,
    pub server_timestamp: ServerTimestamp,
    pub kind: UpdateKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateKind {
    /// One more booking on a slot
    SlotBooked { time: SlotTime },
    /// One booking on a slot was given back
    SlotReleased { time: SlotTime },
    /// Complete slot list for the stream; replaces, never merges
    ProviderUpdate { slots: Vec<TimeSlot> },
    /// Ancillary information such as viewer counts
    SystemUpdate {
        viewers_count: Option<u32>,
        message: Option<String>,
    },
}

impl UpdateEvent {
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            UpdateKind::SlotBooked { .. } => "slot_booked",
            UpdateKind::SlotReleased { .. } => "slot_released",
            UpdateKind::ProviderUpdate { .. } => "provider_update",
            UpdateKind::SystemUpdate { .. } => "system_update",
        }
    }

    /// Slot targeted by a per-slot event
    pub fn slot_time(&self) -> Option<SlotTime> {
        match &self.kind {
            UpdateKind::SlotBooked { time } | UpdateKind::SlotReleased { time } => Some(*time),
            UpdateKind::ProviderUpdate { .. } | UpdateKind::SystemUpdate { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    Confirmed,
    Rejected,
}

/// Server verdict on a `claim_slot` request
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimResult {
    pub slot: SlotRef,
    pub client_id: ClientId,
    pub status: ClaimStatus,
    pub reason: Option<String>,
}

/// Everything the client understands from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Update(UpdateEvent),
    ClaimResult(ClaimResult),
    Pong,
}

/// Stateless decoding plus a count of dropped frames for diagnostics
#[derive(Debug, Default)]
pub struct UpdateCodec {
    dropped: u64,
}

impl UpdateCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a frame, logging and dropping it on any validation failure
    pub fn accept(&mut self, text: &str) -> Option<ServerMessage> {
        match Self::decode(text) {
            Ok(message) => Some(message),
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, dropped = self.dropped, "Dropping inbound message");
                debug!(frame = %text, "Dropped frame body");
                None
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn decode(text: &str) -> Result<ServerMessage, CodecError> {
        let raw: RawServerFrame = serde_json::from_str(text)?;
        Self::decode_frame(raw)
    }

    pub fn decode_frame(raw: RawServerFrame) -> Result<ServerMessage, CodecError> {
        match raw.kind.as_str() {
            "slot_booked" | "slot_released" => {
                let stream = stream_key(&raw)?;
                let time = slot_time(&raw)?;
                let server_timestamp = timestamp(&raw)?;
                let kind = if raw.kind == "slot_booked" {
                    UpdateKind::SlotBooked { time }
                } else {
                    UpdateKind::SlotReleased { time }
                };
                Ok(ServerMessage::Update(UpdateEvent {
                    stream,
                    server_timestamp,
                    kind,
                }))
            }
            "provider_update" => {
                let stream = stream_key(&raw)?;
                let server_timestamp = timestamp(&raw)?;
                let slots = slot_list(&raw)?;
                Ok(ServerMessage::Update(UpdateEvent {
                    stream,
                    server_timestamp,
                    kind: UpdateKind::ProviderUpdate { slots },
                }))
            }
            "system_update" => {
                let stream = stream_key(&raw)?;
                let body: SystemUpdateBody = match raw.data.clone() {
                    Some(data) => serde_json::from_value(data)
                        .map_err(|e| CodecError::invalid(&raw.kind, "data", e.to_string()))?,
                    None => SystemUpdateBody::default(),
                };
                Ok(ServerMessage::Update(UpdateEvent {
                    stream,
                    server_timestamp: raw.timestamp.unwrap_or_default(),
                    kind: UpdateKind::SystemUpdate {
                        viewers_count: body.viewers_count,
                        message: body.message,
                    },
                }))
            }
            "claim_result" => {
                let stream = stream_key(&raw)?;
                let time = slot_time(&raw)?;
                let client_id = raw
                    .client_id
                    .clone()
                    .ok_or_else(|| CodecError::missing(&raw.kind, "clientId"))?;
                let status = match raw.status.as_deref() {
                    Some("confirmed") => ClaimStatus::Confirmed,
                    Some("rejected") => ClaimStatus::Rejected,
                    Some(other) => {
                        return Err(CodecError::invalid(
                            &raw.kind,
                            "status",
                            format!("expected confirmed or rejected, got '{}'", other),
                        ))
                    }
                    None => return Err(CodecError::missing(&raw.kind, "status")),
                };
                Ok(ServerMessage::ClaimResult(ClaimResult {
                    slot: SlotRef {
                        provider_id: stream.provider_id,
                        date: stream.date,
                        time,
                    },
                    client_id: ClientId::new(client_id),
                    status,
                    reason: raw.reason,
                }))
            }
            "pong" => Ok(ServerMessage::Pong),
            other => Err(CodecError::UnknownType(other.to_string())),
        }
    }
}

fn stream_key(raw: &RawServerFrame) -> Result<StreamKey, CodecError> {
    let provider_id = raw
        .provider_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| CodecError::missing(&raw.kind, "providerId"))?;
    let date = raw
        .date
        .as_deref()
        .ok_or_else(|| CodecError::missing(&raw.kind, "date"))?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| CodecError::invalid(&raw.kind, "date", e.to_string()))?;
    Ok(StreamKey {
        provider_id: provider_id.to_string(),
        date,
    })
}

fn slot_time(raw: &RawServerFrame) -> Result<SlotTime, CodecError> {
    raw.time
        .as_deref()
        .ok_or_else(|| CodecError::missing(&raw.kind, "time"))?
        .parse()
        .map_err(|e: chrono::ParseError| CodecError::invalid(&raw.kind, "time", e.to_string()))
}

fn timestamp(raw: &RawServerFrame) -> Result<ServerTimestamp, CodecError> {
    raw.timestamp
        .ok_or_else(|| CodecError::missing(&raw.kind, "timestamp"))
}

fn slot_list(raw: &RawServerFrame) -> Result<Vec<TimeSlot>, CodecError> {
    let data = raw
        .data
        .clone()
        .ok_or_else(|| CodecError::missing(&raw.kind, "data"))?;
    let body: ProviderUpdateBody = serde_json::from_value(data)
        .map_err(|e| CodecError::invalid(&raw.kind, "data", e.to_string()))?;

    let mut seen = HashSet::with_capacity(body.slots.len());
    body.slots
        .into_iter()
        .map(|slot| {
            if !seen.insert(slot.time) {
                return Err(CodecError::invalid(
                    &raw.kind,
                    "data",
                    format!("duplicate slot {}", slot.time),
                ));
            }
            TimeSlot::new(slot.time, slot.capacity, slot.current_bookings).map_err(|e| {
                error!(error = %e, "Rejecting slot record that breaks the booking invariant");
                CodecError::invalid(&raw.kind, "data", e.to_string())
            })
        })
        .collect()
}
