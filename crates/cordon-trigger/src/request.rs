use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
  Manual,
  Schedule,
  Webhook,
}

impl TriggerKind {
  pub fn as_str(self) -> &'static str {
    match self {
      TriggerKind::Manual => "manual",
      TriggerKind::Schedule => "schedule",
      TriggerKind::Webhook => "webhook",
    }
  }
}

/// Envelope every trigger produces; the orchestrator consumes it uniformly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
  pub workflow_id: String,
  pub tenant_id: String,
  pub kind: TriggerKind,
  /// Runtime inputs handed to the entrypoint node.
  pub payload: serde_json::Value,
  /// Submissions with the same key return the same run.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub idempotency_key: Option<String>,
  /// Per-run override of the intra-run concurrency bound.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_in_flight: Option<usize>,
  /// Per-run override of the activation deadline.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_override: Option<Duration>,
}

impl RunRequest {
  pub fn manual(
    workflow_id: impl Into<String>,
    tenant_id: impl Into<String>,
    payload: serde_json::Value,
  ) -> Self {
    Self {
      workflow_id: workflow_id.into(),
      tenant_id: tenant_id.into(),
      kind: TriggerKind::Manual,
      payload,
      idempotency_key: None,
      max_in_flight: None,
      timeout_override: None,
    }
  }

  pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
    self.idempotency_key = Some(key.into());
    self
  }
}

/// Why a submission was refused.
#[derive(Debug, Error)]
pub enum SubmitError {
  #[error("workflow not found: {0}")]
  WorkflowNotFound(String),

  #[error("workflow failed validation: {0}")]
  Validation(String),

  #[error("submission failed: {0}")]
  Internal(String),
}

/// Accepts run requests. Implemented by the orchestrator.
#[async_trait]
pub trait RunSubmitter: Send + Sync {
  /// Submit a run, returning its id. Idempotent on `idempotency_key`.
  async fn submit(&self, request: RunRequest) -> Result<String, SubmitError>;
}
