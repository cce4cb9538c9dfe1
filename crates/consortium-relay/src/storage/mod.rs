//! SQLite storage for the Consortium relay.
//!
//! Provides persistence for accounts, sessions, messages, machines, and
//! pairing requests, plus the atomic per-account/per-session sequence
//! allocators the event protocol depends on.

mod db;
mod models;
mod queries;
mod queries_machines;
mod queries_messages;
mod queries_pairing;
mod queries_sessions;
mod sequencer;

#[cfg(test)]
mod tests;

pub use db::{DatabaseError, RelayDatabase};
pub use models::*;
pub use queries::unix_timestamp_ms;
pub use queries_messages::MESSAGE_LIST_LIMIT;
pub use queries_sessions::SESSION_LIST_LIMIT;
