//! Cordon Store
//!
//! Relational persistence for the engine's durable state: workflows, runs,
//! node executions, events, artifact metadata, node I/O linkage, approvals,
//! schedules, webhook deliveries, and scheduler leases.
//!
//! The [`Store`] trait is the seam between the orchestrator and the storage
//! engine; [`SqliteStore`] is the shipped implementation. The SQLite store
//! also implements [`cordon_events::EventStore`], so the event hub and the
//! rest of the engine share one database.

mod sqlite;
mod types;

pub use sqlite::SqliteStore;
/// Re-exported so callers can build rows without depending on sqlx.
pub use sqlx::types::Json;
pub use types::{
  ApprovalKind, ApprovalRequest, ApprovalStatus, ArtifactRow, IoDirection, NodeExecution,
  NodeExecutionStatus, NodeIo, Run, RunStatus, Schedule, TokenSide, WorkflowRow,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage seam for all durable engine state.
#[async_trait]
pub trait Store: Send + Sync {
  // -- workflows ----------------------------------------------------------

  async fn upsert_workflow(&self, workflow: &WorkflowRow) -> Result<(), StoreError>;
  async fn get_workflow(&self, id: &str) -> Result<WorkflowRow, StoreError>;

  // -- runs ---------------------------------------------------------------

  async fn create_run(&self, run: &Run) -> Result<(), StoreError>;
  async fn get_run(&self, run_id: &str) -> Result<Run, StoreError>;
  async fn find_run_by_idempotency_key(&self, key: &str) -> Result<Option<Run>, StoreError>;
  async fn update_run_status(
    &self,
    run_id: &str,
    status: RunStatus,
    ended_at: Option<DateTime<Utc>>,
  ) -> Result<(), StoreError>;
  /// Runs that are not in a terminal status, oldest first.
  async fn list_active_runs(&self) -> Result<Vec<Run>, StoreError>;

  // -- node executions ----------------------------------------------------

  /// Insert or replace the row for `(run_id, node_ref, attempt)`.
  async fn upsert_node_execution(&self, execution: &NodeExecution) -> Result<(), StoreError>;
  async fn list_node_executions(&self, run_id: &str) -> Result<Vec<NodeExecution>, StoreError>;
  /// Record a heartbeat for a running attempt.
  async fn heartbeat(
    &self,
    run_id: &str,
    node_ref: &str,
    attempt: i32,
    at: DateTime<Utc>,
  ) -> Result<(), StoreError>;
  /// Latest attempts stuck in `running` whose heartbeat is older than the
  /// cutoff (or absent).
  async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeExecution>, StoreError>;

  // -- artifacts and node I/O --------------------------------------------

  /// Record artifact metadata; a digest already present is left untouched.
  async fn put_artifact_meta(&self, artifact: &ArtifactRow) -> Result<(), StoreError>;
  async fn get_artifact_meta(&self, digest: &str) -> Result<ArtifactRow, StoreError>;
  async fn attach_node_io(&self, io: &NodeIo) -> Result<(), StoreError>;
  async fn list_node_io(&self, run_id: &str, node_ref: &str) -> Result<Vec<NodeIo>, StoreError>;
  /// Output linkage of `node_ref` from the most recent completed run with
  /// the same plan signature, for cached reuse of deterministic components.
  async fn cached_outputs(
    &self,
    plan_signature: &str,
    node_ref: &str,
  ) -> Result<Vec<NodeIo>, StoreError>;

  // -- approvals ----------------------------------------------------------

  async fn create_approval(&self, approval: &ApprovalRequest) -> Result<(), StoreError>;
  async fn get_approval(&self, id: &str) -> Result<ApprovalRequest, StoreError>;
  /// Look up a pending-or-decided request by either decision token.
  async fn find_approval_by_token(
    &self,
    token: &str,
  ) -> Result<Option<(ApprovalRequest, TokenSide)>, StoreError>;
  /// Look up a request by the wait token of its suspended node.
  async fn find_approval_by_wait_token(
    &self,
    wait_token: &str,
  ) -> Result<Option<ApprovalRequest>, StoreError>;
  /// Replace the context payload (e.g. a submitted form body).
  async fn update_approval_context(
    &self,
    id: &str,
    context_data: &serde_json::Value,
  ) -> Result<(), StoreError>;
  /// Transition a pending request to a decision. Returns `false` when the
  /// request was not pending (token already used, cancelled, or timed out).
  async fn decide_approval(
    &self,
    id: &str,
    status: ApprovalStatus,
    decided_by: Option<&str>,
    decided_at: DateTime<Utc>,
  ) -> Result<bool, StoreError>;
  /// Invalidate every pending request of a run (cancellation path).
  async fn cancel_pending_approvals(&self, run_id: &str) -> Result<u64, StoreError>;
  /// Expire pending requests whose deadline has passed; their tokens stop
  /// resolving.
  async fn timeout_overdue_approvals(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

  // -- schedules ----------------------------------------------------------

  async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;
  /// Unpaused schedules with `next_fire_at <= now`.
  async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError>;
  async fn update_schedule_fire(
    &self,
    id: &str,
    next_fire_at: DateTime<Utc>,
  ) -> Result<(), StoreError>;

  // -- webhook deliveries -------------------------------------------------

  /// Record a delivery; returns `false` for a duplicate within the window.
  async fn record_webhook_delivery(
    &self,
    source: &str,
    delivery_id: &str,
    head_signature: &str,
    at: DateTime<Utc>,
  ) -> Result<bool, StoreError>;
  async fn prune_webhook_deliveries(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

  // -- leases and retention ----------------------------------------------

  /// Take or renew a named lease. Returns `true` when `owner` holds it.
  async fn acquire_lease(
    &self,
    name: &str,
    owner: &str,
    until: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> Result<bool, StoreError>;

  /// Drop events older than the retention window for terminal runs.
  async fn prune_events(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}
