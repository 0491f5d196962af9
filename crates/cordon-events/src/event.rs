use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
  #[serde(rename = "run.started")]
  RunStarted,
  #[serde(rename = "node.started")]
  NodeStarted,
  #[serde(rename = "node.progress")]
  NodeProgress,
  #[serde(rename = "node.logged")]
  NodeLogged,
  #[serde(rename = "node.succeeded")]
  NodeSucceeded,
  #[serde(rename = "node.failed")]
  NodeFailed,
  #[serde(rename = "node.suspended")]
  NodeSuspended,
  #[serde(rename = "node.resumed")]
  NodeResumed,
  #[serde(rename = "run.completed")]
  RunCompleted,
  #[serde(rename = "run.failed")]
  RunFailed,
  #[serde(rename = "stream.chunk")]
  StreamChunk,
  #[serde(rename = "tool.call")]
  ToolCall,
  #[serde(rename = "tool.result")]
  ToolResult,
}

impl EventKind {
  /// Terminal run events end a subscription naturally.
  pub fn is_run_terminal(self) -> bool {
    matches!(self, EventKind::RunCompleted | EventKind::RunFailed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      EventKind::RunStarted => "run.started",
      EventKind::NodeStarted => "node.started",
      EventKind::NodeProgress => "node.progress",
      EventKind::NodeLogged => "node.logged",
      EventKind::NodeSucceeded => "node.succeeded",
      EventKind::NodeFailed => "node.failed",
      EventKind::NodeSuspended => "node.suspended",
      EventKind::NodeResumed => "node.resumed",
      EventKind::RunCompleted => "run.completed",
      EventKind::RunFailed => "run.failed",
      EventKind::StreamChunk => "stream.chunk",
      EventKind::ToolCall => "tool.call",
      EventKind::ToolResult => "tool.result",
    }
  }
}

impl std::fmt::Display for EventKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One recorded state transition. Events are append-only; no mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  /// Per-run monotonic sequence, starting at 1.
  pub sequence: u64,
  pub run_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub node_ref: Option<String>,
  pub ts: DateTime<Utc>,
  pub kind: EventKind,
  pub payload: serde_json::Value,
}
