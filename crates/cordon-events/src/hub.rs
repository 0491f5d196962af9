use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

use crate::event::{Event, EventKind};
use crate::redact::redact;
use crate::store::{EventError, EventStore};

/// Default per-subscriber buffer before an overrun drop.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
  tx: mpsc::Sender<Event>,
  overrun: Arc<AtomicBool>,
}

struct RunLog {
  next_sequence: u64,
  subscribers: Vec<Subscriber>,
}

/// Per-run event sequencer and fan-out point.
///
/// Appends to a given run are serialized by a per-run mutex; appends across
/// runs are independent. The hub never blocks producers: a subscriber whose
/// buffer is full is dropped with a terminal overrun marker.
pub struct StreamHub {
  store: Arc<dyn EventStore>,
  runs: Mutex<HashMap<String, Arc<Mutex<RunLog>>>>,
  buffer: usize,
}

impl StreamHub {
  pub fn new(store: Arc<dyn EventStore>) -> Self {
    Self::with_buffer(store, DEFAULT_SUBSCRIBER_BUFFER)
  }

  pub fn with_buffer(store: Arc<dyn EventStore>, buffer: usize) -> Self {
    Self {
      store,
      runs: Mutex::new(HashMap::new()),
      buffer,
    }
  }

  /// The per-run log, seeded from storage on first touch.
  async fn run_log(&self, run_id: &str) -> Result<Arc<Mutex<RunLog>>, EventError> {
    {
      let runs = self.runs.lock().await;
      if let Some(log) = runs.get(run_id) {
        return Ok(log.clone());
      }
    }

    // Seed outside the map lock; racing initializers resolve below.
    let last = self.store.last_sequence(run_id).await?;
    let mut runs = self.runs.lock().await;
    let log = runs.entry(run_id.to_string()).or_insert_with(|| {
      Arc::new(Mutex::new(RunLog {
        next_sequence: last + 1,
        subscribers: Vec::new(),
      }))
    });
    Ok(log.clone())
  }

  /// Append an event, assigning the next sequence atomically.
  ///
  /// The payload is redacted before anything persists or fans out.
  pub async fn append(
    &self,
    run_id: &str,
    node_ref: Option<&str>,
    kind: EventKind,
    payload: serde_json::Value,
  ) -> Result<Event, EventError> {
    let log = self.run_log(run_id).await?;
    let mut log = log.lock().await;

    let event = Event {
      sequence: log.next_sequence,
      run_id: run_id.to_string(),
      node_ref: node_ref.map(str::to_string),
      ts: Utc::now(),
      kind,
      payload: redact(payload),
    };

    self.store.append(&event).await?;
    log.next_sequence += 1;

    log.subscribers.retain(|sub| {
      match sub.tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
          // Slow subscriber: mark the overrun and cut it loose.
          sub.overrun.store(true, Ordering::Release);
          false
        }
        Err(TrySendError::Closed(_)) => false,
      }
    });

    Ok(event)
  }

  /// Subscribe from a cursor: replay stored events with `sequence > after`,
  /// then tail live appends. Every event is delivered exactly once, in order.
  pub async fn subscribe(&self, run_id: &str, after: u64) -> Result<EventStream, EventError> {
    let log = self.run_log(run_id).await?;

    // Attach first so nothing appended during replay is missed; the stream
    // drops live duplicates that the replay already covered.
    let (tx, rx) = mpsc::channel(self.buffer);
    let overrun = Arc::new(AtomicBool::new(false));
    let live_from = {
      let mut log = log.lock().await;
      log.subscribers.push(Subscriber {
        tx,
        overrun: overrun.clone(),
      });
      log.next_sequence
    };

    let backlog = if after + 1 < live_from {
      self.store.read_after(run_id, after, Some(live_from)).await?
    } else {
      Vec::new()
    };

    Ok(EventStream {
      backlog: backlog.into(),
      rx,
      overrun,
      last_seen: after,
    })
  }

  /// Detach all subscribers of a terminated run and forget its sequencer.
  ///
  /// Live streams end after draining their buffers; late subscribers replay
  /// from storage as usual.
  pub async fn close_run(&self, run_id: &str) {
    let log = {
      let mut runs = self.runs.lock().await;
      runs.remove(run_id)
    };
    if let Some(log) = log {
      let mut log = log.lock().await;
      log.subscribers.clear();
    }
  }
}

/// A message delivered to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
  Event(Event),
  /// The subscriber fell behind and was dropped; the stream ends here.
  Overrun,
}

/// Ordered, duplicate-free view of one run's events for one subscriber.
pub struct EventStream {
  backlog: VecDeque<Event>,
  rx: mpsc::Receiver<Event>,
  overrun: Arc<AtomicBool>,
  last_seen: u64,
}

impl EventStream {
  /// Next message, or `None` once the stream is finished.
  pub async fn next(&mut self) -> Option<StreamMessage> {
    if let Some(event) = self.backlog.pop_front() {
      self.last_seen = event.sequence;
      return Some(StreamMessage::Event(event));
    }

    loop {
      match self.rx.recv().await {
        Some(event) => {
          if event.sequence <= self.last_seen {
            // Already replayed from storage.
            continue;
          }
          self.last_seen = event.sequence;
          return Some(StreamMessage::Event(event));
        }
        None => {
          if self.overrun.swap(false, Ordering::AcqRel) {
            return Some(StreamMessage::Overrun);
          }
          return None;
        }
      }
    }
  }

  /// Sequence of the last delivered event.
  pub fn cursor(&self) -> u64 {
    self.last_seen
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryEventStore;
  use serde_json::json;

  fn hub() -> StreamHub {
    StreamHub::new(Arc::new(MemoryEventStore::new()))
  }

  #[tokio::test]
  async fn append_assigns_monotonic_sequences() {
    let hub = hub();
    let first = hub
      .append("run-1", None, EventKind::RunStarted, json!({}))
      .await
      .unwrap();
    let second = hub
      .append("run-1", Some("a"), EventKind::NodeStarted, json!({}))
      .await
      .unwrap();

    assert_eq!(first.sequence, 1);
    assert_eq!(second.sequence, 2);

    // Sequences are per run.
    let other = hub
      .append("run-2", None, EventKind::RunStarted, json!({}))
      .await
      .unwrap();
    assert_eq!(other.sequence, 1);
  }

  #[tokio::test]
  async fn live_subscriber_sees_appends_in_order() {
    let hub = hub();
    let mut stream = hub.subscribe("run-1", 0).await.unwrap();

    hub
      .append("run-1", None, EventKind::RunStarted, json!({}))
      .await
      .unwrap();
    hub
      .append("run-1", Some("a"), EventKind::NodeStarted, json!({}))
      .await
      .unwrap();

    let StreamMessage::Event(first) = stream.next().await.unwrap() else {
      panic!("expected event");
    };
    let StreamMessage::Event(second) = stream.next().await.unwrap() else {
      panic!("expected event");
    };
    assert_eq!(first.kind, EventKind::RunStarted);
    assert_eq!(second.sequence, 2);
  }

  #[tokio::test]
  async fn reconnect_replays_after_cursor_exactly_once() {
    let hub = hub();
    for i in 0..5 {
      hub
        .append("run-1", None, EventKind::NodeProgress, json!({"i": i}))
        .await
        .unwrap();
    }

    let mut stream = hub.subscribe("run-1", 2).await.unwrap();
    // live append racing the replay
    hub
      .append("run-1", None, EventKind::RunCompleted, json!({}))
      .await
      .unwrap();

    let mut sequences = Vec::new();
    for _ in 0..4 {
      match stream.next().await.unwrap() {
        StreamMessage::Event(e) => sequences.push(e.sequence),
        StreamMessage::Overrun => panic!("unexpected overrun"),
      }
    }
    assert_eq!(sequences, vec![3, 4, 5, 6]);
  }

  #[tokio::test]
  async fn slow_subscriber_is_dropped_with_overrun() {
    let store = Arc::new(MemoryEventStore::new());
    let hub = StreamHub::with_buffer(store, 2);
    let mut stream = hub.subscribe("run-1", 0).await.unwrap();

    // Fill the buffer past capacity without draining.
    for i in 0..4 {
      hub
        .append("run-1", None, EventKind::NodeProgress, json!({"i": i}))
        .await
        .unwrap();
    }

    let mut messages = Vec::new();
    while let Some(message) = stream.next().await {
      messages.push(message);
    }

    // Two buffered events, then the overrun marker.
    assert_eq!(messages.len(), 3);
    assert_eq!(messages.last(), Some(&StreamMessage::Overrun));
  }

  #[tokio::test]
  async fn close_run_ends_live_streams() {
    let hub = hub();
    let mut stream = hub.subscribe("run-1", 0).await.unwrap();
    hub
      .append("run-1", None, EventKind::RunCompleted, json!({}))
      .await
      .unwrap();
    hub.close_run("run-1").await;

    assert!(matches!(
      stream.next().await,
      Some(StreamMessage::Event(_))
    ));
    assert_eq!(stream.next().await, None);
  }

  #[tokio::test]
  async fn payloads_are_redacted_before_store_and_fanout() {
    let hub = hub();
    let mut stream = hub.subscribe("run-1", 0).await.unwrap();
    let appended = hub
      .append(
        "run-1",
        None,
        EventKind::NodeLogged,
        json!({"message": "ok", "api_key": "sk-live-123"}),
      )
      .await
      .unwrap();

    assert_eq!(appended.payload["api_key"], "[redacted]");
    let StreamMessage::Event(seen) = stream.next().await.unwrap() else {
      panic!("expected event");
    };
    assert_eq!(seen.payload["api_key"], "[redacted]");
  }
}
