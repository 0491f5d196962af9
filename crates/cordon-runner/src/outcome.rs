use cordon_registry::ErrorKind;
use serde::{Deserialize, Serialize};

/// Successful completion: one value per declared output port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Success {
  pub outputs: serde_json::Map<String, serde_json::Value>,
}

impl Success {
  pub fn single(port_id: impl Into<String>, value: serde_json::Value) -> Self {
    let mut outputs = serde_json::Map::new();
    outputs.insert(port_id.into(), value);
    Self { outputs }
  }
}

/// Component failure, surfaced as a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
  pub kind: ErrorKind,
  pub message: String,
  /// The component's own judgment; the orchestrator still applies the retry
  /// policy and the kind's terminal rules on top.
  pub retryable: bool,
}

impl Failure {
  pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
    Self {
      kind,
      message: message.into(),
      retryable,
    }
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Timeout, message, true)
  }

  pub fn cancelled() -> Self {
    Self::new(ErrorKind::Cancel, "activation cancelled", false)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Internal, message, false)
  }
}

/// The component is waiting on an external completion (approval decision,
/// form submission, tool-session end). The orchestrator parks the node until
/// something signals the wait token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspend {
  /// Opaque handle used to resume the node.
  pub wait_token: String,
  /// Context carried into the `node.suspended` event and back on resume.
  pub payload: serde_json::Value,
}

/// Result of one activation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  Success(Success),
  Failure(Failure),
  Suspend(Suspend),
}

impl Outcome {
  pub fn success(outputs: serde_json::Map<String, serde_json::Value>) -> Self {
    Outcome::Success(Success { outputs })
  }

  pub fn failure(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
    Outcome::Failure(Failure::new(kind, message, retryable))
  }
}
