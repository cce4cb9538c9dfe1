//! Real-time event routing for the Consortium relay.

pub mod payload;
pub mod router;

pub use payload::{update_key, Ephemeral, UpdateBody, UpdateEnvelope, VersionedValue};
pub use router::{
    ClientConnection, ConnectionScope, EmitParams, EventName, EventRouter, PendingResult,
    RecipientFilter,
};
