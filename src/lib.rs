// slotsync - Real-time slot availability sync
//
// Keeps a client's view of bookable time slots consistent with the
// availability service over a WebSocket feed, and coordinates this client's
// single optimistic slot claim with the server.

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod reservation;
pub mod session;
pub mod store;

pub use codec::{ClaimResult, ClaimStatus, ServerMessage, UpdateCodec, UpdateEvent, UpdateKind};
pub use config::{ConfigLoader, ConfigValidator, SyncConfig};
pub use connection::{
    Channel, ConnectionManager, ConnectionState, Connector, Inbound, ReconnectPolicy, WsConnector,
};
pub use error::{
    CodecError, ConfigError, ConsistencyError, Result, SelectError, SyncError, TransportError,
};
pub use model::{day_grid, ClientId, SlotRef, SlotTime, StreamKey, SubscriptionKey, TimeSlot};
pub use presence::{ActivityEntry, PresenceAggregator, PresenceSnapshot};
pub use protocol::{ClientFrame, RawServerFrame};
pub use reservation::{ClaimState, ClaimUpdate, ReservationCoordinator};
pub use session::{AvailabilitySession, SessionCommand, SessionHandle, SyncNotification};
pub use store::{ApplyOutcome, SlotStateStore, SlotView};
