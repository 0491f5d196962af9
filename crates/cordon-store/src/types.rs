use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Queued,
  Running,
  Suspended,
  Completed,
  Failed,
  Cancelled,
}

impl RunStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
    )
  }
}

/// A run as stored in the database. The unit of durability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Run {
  pub id: String,
  pub workflow_id: String,
  pub tenant_id: String,
  pub plan_signature: String,
  /// Compiled plan JSON, kept for crash recovery.
  pub plan: Json<serde_json::Value>,
  pub status: RunStatus,
  pub trigger_kind: String,
  pub trigger_payload: Json<serde_json::Value>,
  pub idempotency_key: Option<String>,
  pub started_at: DateTime<Utc>,
  pub ended_at: Option<DateTime<Utc>>,
}

/// Status of one node execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
  Pending,
  Running,
  Suspended,
  Succeeded,
  Failed,
  Skipped,
}

/// One attempt at executing one node within a run.
///
/// Exactly one attempt per `(run_id, node_ref)` is active at any time; the
/// row for the latest attempt carries the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct NodeExecution {
  pub run_id: String,
  pub node_ref: String,
  pub attempt: i32,
  pub status: NodeExecutionStatus,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: Option<DateTime<Utc>>,
  pub error_kind: Option<String>,
  pub error_message: Option<String>,
  pub input_digest: Option<String>,
  pub output_digest: Option<String>,
  /// Opaque handle resuming a suspended attempt.
  pub wait_token: Option<String>,
  pub heartbeat_at: Option<DateTime<Utc>>,
}

/// What a suspended node is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ApprovalKind {
  Approval,
  Form,
}

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ApprovalStatus {
  Pending,
  Approved,
  Rejected,
  Cancelled,
  TimedOut,
}

/// A human-in-the-loop gate awaiting a decision or form submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ApprovalRequest {
  pub id: String,
  pub run_id: String,
  pub node_ref: String,
  pub kind: ApprovalKind,
  pub title: String,
  pub description: String,
  /// Single-use, cryptographically random decision tokens.
  pub approve_token: String,
  pub reject_token: String,
  /// Handle that resumes the suspended node once decided.
  pub wait_token: String,
  pub timeout_at: Option<DateTime<Utc>>,
  pub status: ApprovalStatus,
  pub decided_by: Option<String>,
  pub decided_at: Option<DateTime<Utc>>,
  pub context_data: Json<serde_json::Value>,
}

/// Which decision token matched a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSide {
  Approve,
  Reject,
}

/// A stored workflow definition row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
  pub id: String,
  pub tenant_id: String,
  pub name: String,
  pub description: String,
  pub graph: Json<serde_json::Value>,
  pub version: i32,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Cron schedule for a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Schedule {
  pub id: String,
  pub workflow_id: String,
  pub tenant_id: String,
  pub cron: String,
  pub next_fire_at: DateTime<Utc>,
  pub paused: bool,
}

/// Metadata for a stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ArtifactRow {
  pub digest: String,
  pub media_type: String,
  pub size_bytes: i64,
  pub stored_at: DateTime<Utc>,
}

/// Direction of a node I/O linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum IoDirection {
  Input,
  Output,
}

/// Linkage from a node port to a stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct NodeIo {
  pub run_id: String,
  pub node_ref: String,
  pub port_id: String,
  pub direction: IoDirection,
  pub digest: String,
}
