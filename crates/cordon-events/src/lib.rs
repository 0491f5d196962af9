//! Cordon Events
//!
//! Append-only per-run event log with live fan-out. Every state transition in
//! a run is recorded as an [`Event`] with a per-run monotonic sequence;
//! subscribers replay from a cursor out of storage, then switch to live tail.
//!
//! Producers never block on slow consumers: each subscriber has a bounded
//! buffer and is dropped with a terminal overrun marker when it falls behind.

mod event;
mod hub;
mod redact;
mod store;

pub use event::{Event, EventKind};
pub use hub::{EventStream, StreamHub, StreamMessage};
pub use redact::redact;
pub use store::{EventError, EventStore, MemoryEventStore};
