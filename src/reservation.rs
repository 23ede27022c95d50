// Reservation Coordinator
//
// Owns this client's selection claim: optimistic local lock, expiry, and the
// transition to whatever the server decides. The server is the only authority
// on whether a claim succeeds; nothing here touches slot counts.

use crate::codec::{ClaimResult, ClaimStatus};
use crate::error::SelectError;
use crate::model::{ClientId, SlotRef, SlotTime};
use crate::store::SlotView;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Claim lifecycle as reported to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    None,
    Pending,
    Confirmed,
    Rejected,
    Expired,
    Cancelled,
}

impl ClaimState {
    /// Pending or confirmed claims block further selections
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A client's intent to reserve one slot
#[derive(Debug, Clone)]
pub struct SelectionClaim {
    pub slot: SlotRef,
    pub client_id: ClientId,
    pub state: ClaimState,
    pub created_at: DateTime<Utc>,
    pub expires_at: Instant,
}

/// Claim transition published to observers
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimUpdate {
    pub state: ClaimState,
    pub slot: SlotRef,
    pub reason: Option<String>,
}

/// What to do with a server claim verdict
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimDisposition {
    Updated(ClaimUpdate),
    /// Server confirmed a claim this client already abandoned; release it
    Orphaned(SlotRef),
    Ignored,
}

#[derive(Debug)]
pub struct ReservationCoordinator {
    client_id: ClientId,
    claim_timeout: Duration,
    current: Option<SelectionClaim>,
}

impl ReservationCoordinator {
    pub fn new(client_id: ClientId, claim_timeout: Duration) -> Self {
        Self {
            client_id,
            claim_timeout,
            current: None,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn state(&self) -> ClaimState {
        self.current
            .as_ref()
            .map_or(ClaimState::None, |claim| claim.state)
    }

    pub fn current(&self) -> Option<&SelectionClaim> {
        self.current.as_ref()
    }

    /// Slot to render as taken by us
    pub fn locked_slot(&self) -> Option<&SlotRef> {
        self.current.as_ref().map(|claim| &claim.slot)
    }

    /// Expiry timer; armed only while a claim is pending
    pub fn deadline(&self) -> Option<Instant> {
        self.current
            .as_ref()
            .filter(|claim| claim.state == ClaimState::Pending)
            .map(|claim| claim.expires_at)
    }

    /// Start a pending claim on `time` for the subscription shown in `view`.
    /// Every refusal is local; nothing is sent when this returns an error.
    pub fn select(&mut self, time: SlotTime, view: &SlotView, now: Instant) -> Result<ClaimUpdate, SelectError> {
        if let Some(claim) = &self.current {
            return Err(SelectError::ClaimInProgress(claim.slot.to_string()));
        }
        let key = view.key.as_ref().ok_or(SelectError::NotSubscribed)?;
        if view.stale {
            return Err(SelectError::StaleData);
        }
        match view.get(time) {
            None => return Err(SelectError::UnknownSlot(time.to_string())),
            Some(slot) if !slot.available() => {
                return Err(SelectError::Unavailable(time.to_string()))
            }
            Some(_) => {}
        }

        let slot = key.slot(time);
        info!(slot = %slot, "Claim pending");
        self.current = Some(SelectionClaim {
            slot: slot.clone(),
            client_id: self.client_id.clone(),
            state: ClaimState::Pending,
            created_at: Utc::now(),
            expires_at: now + self.claim_timeout,
        });
        Ok(ClaimUpdate {
            state: ClaimState::Pending,
            slot,
            reason: None,
        })
    }

    pub fn on_claim_result(&mut self, result: &ClaimResult) -> ClaimDisposition {
        if result.client_id != self.client_id {
            debug!(client = %result.client_id, "Ignoring claim result for another client");
            return ClaimDisposition::Ignored;
        }

        let matches_current = self
            .current
            .as_ref()
            .is_some_and(|claim| claim.slot == result.slot);
        if !matches_current {
            return match result.status {
                ClaimStatus::Confirmed => {
                    warn!(slot = %result.slot, "Confirmation for an abandoned claim; releasing");
                    ClaimDisposition::Orphaned(result.slot.clone())
                }
                ClaimStatus::Rejected => ClaimDisposition::Ignored,
            };
        }

        match result.status {
            ClaimStatus::Confirmed => {
                let Some(claim) = self.current.as_mut() else {
                    return ClaimDisposition::Ignored;
                };
                if claim.state == ClaimState::Confirmed {
                    return ClaimDisposition::Ignored;
                }
                claim.state = ClaimState::Confirmed;
                info!(slot = %claim.slot, "Claim confirmed");
                ClaimDisposition::Updated(ClaimUpdate {
                    state: ClaimState::Confirmed,
                    slot: claim.slot.clone(),
                    reason: result.reason.clone(),
                })
            }
            ClaimStatus::Rejected => {
                let slot = result.slot.clone();
                self.current = None;
                info!(slot = %slot, reason = ?result.reason, "Claim rejected");
                ClaimDisposition::Updated(ClaimUpdate {
                    state: ClaimState::Rejected,
                    slot,
                    reason: result.reason.clone(),
                })
            }
        }
    }

    /// Drop a pending claim whose timer has run out. The claim is not resent.
    pub fn expire_due(&mut self, now: Instant) -> Option<ClaimUpdate> {
        let due = self.deadline().is_some_and(|deadline| now >= deadline);
        if !due {
            return None;
        }
        let claim = self.current.take()?;
        info!(slot = %claim.slot, "Claim expired without a server response");
        Some(ClaimUpdate {
            state: ClaimState::Expired,
            slot: claim.slot,
            reason: None,
        })
    }

    /// User backed out. The returned slot should get a best-effort release.
    pub fn cancel(&mut self) -> Option<ClaimUpdate> {
        let claim = self.current.take()?;
        info!(slot = %claim.slot, "Claim cancelled");
        Some(ClaimUpdate {
            state: ClaimState::Cancelled,
            slot: claim.slot,
            reason: None,
        })
    }

    /// Confirmed claim handed to the booking flow; frees the client for a new selection
    pub fn finish(&mut self) -> Option<SlotRef> {
        match &self.current {
            Some(claim) if claim.state == ClaimState::Confirmed => {
                self.current.take().map(|claim| claim.slot)
            }
            _ => None,
        }
    }
}
