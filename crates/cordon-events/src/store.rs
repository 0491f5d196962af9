use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::event::Event;

/// Error type for event persistence.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
  /// The backing store failed.
  #[error("event store error: {message}")]
  Store { message: String },

  /// A sequence was appended out of order; indicates an engine defect.
  #[error("sequence conflict for run '{run_id}': {sequence}")]
  SequenceConflict { run_id: String, sequence: u64 },
}

impl EventError {
  pub fn store(message: impl Into<String>) -> Self {
    Self::Store {
      message: message.into(),
    }
  }
}

/// Durable backing for the event log, indexed by `(run_id, sequence)`.
#[async_trait]
pub trait EventStore: Send + Sync {
  /// Persist one event. The hub serializes appends per run.
  async fn append(&self, event: &Event) -> Result<(), EventError>;

  /// Events with `sequence > after`, ascending, optionally bounded by
  /// `until` (exclusive).
  async fn read_after(
    &self,
    run_id: &str,
    after: u64,
    until: Option<u64>,
  ) -> Result<Vec<Event>, EventError>;

  /// Highest stored sequence for the run, or 0 when none.
  async fn last_sequence(&self, run_id: &str) -> Result<u64, EventError>;
}

/// In-memory event store for tests and embedded use.
#[derive(Default)]
pub struct MemoryEventStore {
  events: Mutex<HashMap<String, Vec<Event>>>,
}

impl MemoryEventStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl EventStore for MemoryEventStore {
  async fn append(&self, event: &Event) -> Result<(), EventError> {
    let mut events = self.events.lock().expect("event store lock");
    let run = events.entry(event.run_id.clone()).or_default();
    if let Some(last) = run.last() {
      if event.sequence <= last.sequence {
        return Err(EventError::SequenceConflict {
          run_id: event.run_id.clone(),
          sequence: event.sequence,
        });
      }
    }
    run.push(event.clone());
    Ok(())
  }

  async fn read_after(
    &self,
    run_id: &str,
    after: u64,
    until: Option<u64>,
  ) -> Result<Vec<Event>, EventError> {
    let events = self.events.lock().expect("event store lock");
    Ok(
      events
        .get(run_id)
        .map(|run| {
          run
            .iter()
            .filter(|e| e.sequence > after && until.map(|u| e.sequence < u).unwrap_or(true))
            .cloned()
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  async fn last_sequence(&self, run_id: &str) -> Result<u64, EventError> {
    let events = self.events.lock().expect("event store lock");
    Ok(
      events
        .get(run_id)
        .and_then(|run| run.last())
        .map(|e| e.sequence)
        .unwrap_or(0),
    )
  }
}
