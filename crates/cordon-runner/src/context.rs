use std::sync::Arc;
use std::time::Duration;

use cordon_events::{EventKind, StreamHub};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::http::ScopedHttp;

/// Gateway session handed to a tool-mode component for the lifetime of one
/// attempt. The token dies with the attempt.
#[derive(Debug, Clone)]
pub struct ToolSessionHandle {
  pub endpoint: String,
  pub token: String,
}

/// Structured logger that feeds the run's event stream.
///
/// Log lines become `node.logged` events and progress marks become
/// `node.progress`; both go through the hub's redaction before append.
#[derive(Clone)]
pub struct EventLogger {
  hub: Arc<StreamHub>,
  run_id: String,
  node_ref: String,
}

impl EventLogger {
  pub fn new(hub: Arc<StreamHub>, run_id: impl Into<String>, node_ref: impl Into<String>) -> Self {
    Self {
      hub,
      run_id: run_id.into(),
      node_ref: node_ref.into(),
    }
  }

  pub async fn log(&self, level: &str, message: &str) {
    let payload = serde_json::json!({"level": level, "message": message});
    if let Err(e) = self
      .hub
      .append(&self.run_id, Some(&self.node_ref), EventKind::NodeLogged, payload)
      .await
    {
      warn!(run_id = %self.run_id, error = %e, "failed to append log event");
    }
  }

  pub async fn info(&self, message: &str) {
    self.log("info", message).await;
  }

  pub async fn progress(&self, payload: serde_json::Value) {
    if let Err(e) = self
      .hub
      .append(
        &self.run_id,
        Some(&self.node_ref),
        EventKind::NodeProgress,
        payload,
      )
      .await
    {
      warn!(run_id = %self.run_id, error = %e, "failed to append progress event");
    }
  }
}

/// Sandboxed capabilities offered to a component during one attempt.
#[derive(Clone)]
pub struct ExecutionContext {
  pub run_id: String,
  pub node_ref: String,
  pub tenant_id: String,
  /// 1-based attempt counter.
  pub attempt: u32,
  /// Stable per-attempt key for idempotent external side-effects.
  pub idempotency_key: String,
  pub logger: EventLogger,
  pub http: ScopedHttp,
  /// Cooperative cancellation; well-behaved components check it.
  pub cancel: CancellationToken,
  /// Deadline for the whole activation, enforced by the runner.
  pub timeout: Duration,
  /// Present only for tool-mode components.
  pub tool_session: Option<ToolSessionHandle>,
}
