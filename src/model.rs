// Slot Data Model
//
// Identity and value types shared by the codec, the slot store and the
// reservation coordinator.

use crate::error::ConsistencyError;
use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Server-assigned timestamp, monotonic per (provider, date) stream
pub type ServerTimestamp = u64;

/// Bookings at or above this share of capacity render as "almost full"
const ALMOST_FULL_RATIO: f64 = 0.8;

/// Start time of a slot, rendered as `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotTime(NaiveTime);

impl SlotTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0.hour(), self.0.minute())
    }
}

impl FromStr for SlotTime {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .map(Self)
    }
}

impl TryFrom<String> for SlotTime {
    type Error = chrono::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SlotTime> for String {
    fn from(value: SlotTime) -> Self {
        value.to_string()
    }
}

/// Identity of one ordered update stream: all events for a provider on a date
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamKey {
    pub provider_id: String,
    pub date: NaiveDate,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.provider_id, self.date)
    }
}

/// What a client is currently watching
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionKey {
    pub provider_id: String,
    pub service_id: String,
    pub date: NaiveDate,
}

impl SubscriptionKey {
    pub fn new(provider_id: impl Into<String>, service_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            provider_id: provider_id.into(),
            service_id: service_id.into(),
            date,
        }
    }

    /// The update stream this subscription receives
    pub fn stream(&self) -> StreamKey {
        StreamKey {
            provider_id: self.provider_id.clone(),
            date: self.date,
        }
    }

    pub fn slot(&self, time: SlotTime) -> SlotRef {
        SlotRef {
            provider_id: self.provider_id.clone(),
            date: self.date,
            time,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.provider_id, self.service_id, self.date)
    }
}

/// Full identity of a bookable slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRef {
    pub provider_id: String,
    pub date: NaiveDate,
    pub time: SlotTime,
}

impl SlotRef {
    pub fn stream(&self) -> StreamKey {
        StreamKey {
            provider_id: self.provider_id.clone(),
            date: self.date,
        }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} {}", self.provider_id, self.date, self.time)
    }
}

/// Per-session client identifier sent with claims
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Availability of one slot within a (provider, date) stream.
///
/// `current_bookings` never exceeds `capacity`; construction rejects records
/// that would, and mutations leave the record untouched when they fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    time: SlotTime,
    capacity: u32,
    current_bookings: u32,
}

impl TimeSlot {
    pub fn new(time: SlotTime, capacity: u32, current_bookings: u32) -> Result<Self, ConsistencyError> {
        if capacity == 0 {
            return Err(ConsistencyError::ZeroCapacity {
                time: time.to_string(),
            });
        }
        if current_bookings > capacity {
            return Err(ConsistencyError::Overbooked {
                time: time.to_string(),
                bookings: current_bookings,
                capacity,
            });
        }
        Ok(Self {
            time,
            capacity,
            current_bookings,
        })
    }

    pub fn time(&self) -> SlotTime {
        self.time
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn current_bookings(&self) -> u32 {
        self.current_bookings
    }

    pub fn available(&self) -> bool {
        self.current_bookings < self.capacity
    }

    pub fn remaining(&self) -> u32 {
        self.capacity - self.current_bookings
    }

    /// Multi-seat slot that is at least 80% booked
    pub fn is_almost_full(&self) -> bool {
        self.capacity > 1 && f64::from(self.current_bookings) >= f64::from(self.capacity) * ALMOST_FULL_RATIO
    }

    /// Record one more booking. A full slot stays at capacity and the call fails.
    pub fn try_book(&mut self) -> Result<(), ConsistencyError> {
        if self.current_bookings >= self.capacity {
            return Err(ConsistencyError::Overbooked {
                time: self.time.to_string(),
                bookings: self.current_bookings + 1,
                capacity: self.capacity,
            });
        }
        self.current_bookings += 1;
        Ok(())
    }

    /// Drop one booking. An empty slot stays at zero and the call fails.
    pub fn try_release(&mut self) -> Result<(), ConsistencyError> {
        if self.current_bookings == 0 {
            return Err(ConsistencyError::Underflow {
                time: self.time.to_string(),
            });
        }
        self.current_bookings -= 1;
        Ok(())
    }
}

/// Evenly spaced empty slots from `start` (inclusive) to `end` (exclusive)
pub fn day_grid(start: SlotTime, end: SlotTime, step_minutes: u32, capacity: u32) -> Vec<TimeSlot> {
    if step_minutes == 0 || capacity == 0 {
        return Vec::new();
    }
    let step = chrono::Duration::minutes(i64::from(step_minutes));
    let mut slots = Vec::new();
    let mut cursor = start.as_naive();
    while cursor < end.as_naive() {
        slots.push(TimeSlot {
            time: SlotTime(cursor),
            capacity,
            current_bookings: 0,
        });
        let (next, wrapped) = cursor.overflowing_add_signed(step);
        if wrapped != 0 {
            break;
        }
        cursor = next;
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nine() -> SlotTime {
        SlotTime::new(9, 0).unwrap()
    }

    #[test]
    fn test_slot_time_parse_and_display() {
        let t: SlotTime = "09:30".parse().unwrap();
        assert_eq!(t.to_string(), "09:30");
        let t: SlotTime = "14:00:00".parse().unwrap();
        assert_eq!(t.to_string(), "14:00");
        assert!("9am".parse::<SlotTime>().is_err());
        assert!("25:00".parse::<SlotTime>().is_err());
    }

    #[test]
    fn test_time_slot_rejects_invalid_records() {
        assert!(matches!(
            TimeSlot::new(nine(), 0, 0),
            Err(ConsistencyError::ZeroCapacity { .. })
        ));
        assert!(matches!(
            TimeSlot::new(nine(), 2, 3),
            Err(ConsistencyError::Overbooked { bookings: 3, capacity: 2, .. })
        ));
    }

    #[test]
    fn test_book_and_release_stay_in_range() {
        let mut slot = TimeSlot::new(nine(), 1, 0).unwrap();
        assert!(slot.available());

        slot.try_book().unwrap();
        assert!(!slot.available());
        assert!(slot.try_book().is_err());
        assert_eq!(slot.current_bookings(), 1);

        slot.try_release().unwrap();
        assert!(slot.try_release().is_err());
        assert_eq!(slot.current_bookings(), 0);
    }

    #[test]
    fn test_almost_full() {
        assert!(!TimeSlot::new(nine(), 1, 1).unwrap().is_almost_full());
        assert!(!TimeSlot::new(nine(), 5, 3).unwrap().is_almost_full());
        assert!(TimeSlot::new(nine(), 5, 4).unwrap().is_almost_full());
        assert_eq!(TimeSlot::new(nine(), 5, 4).unwrap().remaining(), 1);
    }

    #[test]
    fn test_day_grid() {
        let grid = day_grid(nine(), SlotTime::new(17, 0).unwrap(), 30, 1);
        assert_eq!(grid.len(), 16);
        assert_eq!(grid[0].time().to_string(), "09:00");
        assert_eq!(grid[15].time().to_string(), "16:30");
        assert!(grid.iter().all(TimeSlot::available));
    }

    #[test]
    fn test_slot_time_serde_as_string() {
        let json = serde_json::to_string(&nine()).unwrap();
        assert_eq!(json, "\"09:00\"");
        let back: SlotTime = serde_json::from_str("\"09:00\"").unwrap();
        assert_eq!(back, nine());
    }
}
