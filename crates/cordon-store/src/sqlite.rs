use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cordon_events::{Event, EventError, EventStore};
use sqlx::{Row, SqlitePool};

use crate::types::{
  ApprovalRequest, ApprovalStatus, ArtifactRow, NodeExecution, NodeIo, Run, RunStatus, Schedule,
  TokenSide, WorkflowRow,
};
use crate::{Store, StoreError};

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn upsert_workflow(&self, workflow: &WorkflowRow) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO workflows (id, tenant_id, name, description, graph, version, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT(id) DO UPDATE SET
        name = excluded.name,
        description = excluded.description,
        graph = excluded.graph,
        version = excluded.version,
        updated_at = excluded.updated_at
      "#,
    )
    .bind(&workflow.id)
    .bind(&workflow.tenant_id)
    .bind(&workflow.name)
    .bind(&workflow.description)
    .bind(&workflow.graph)
    .bind(workflow.version)
    .bind(workflow.created_at)
    .bind(workflow.updated_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_workflow(&self, id: &str) -> Result<WorkflowRow, StoreError> {
    sqlx::query_as(
      r#"
      SELECT id, tenant_id, name, description, graph, version, created_at, updated_at
      FROM workflows
      WHERE id = ?
      "#,
    )
    .bind(id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("workflow {id}")))
  }

  async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO runs (id, workflow_id, tenant_id, plan_signature, plan, status,
                        trigger_kind, trigger_payload, idempotency_key, started_at, ended_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&run.id)
    .bind(&run.workflow_id)
    .bind(&run.tenant_id)
    .bind(&run.plan_signature)
    .bind(&run.plan)
    .bind(run.status)
    .bind(&run.trigger_kind)
    .bind(&run.trigger_payload)
    .bind(&run.idempotency_key)
    .bind(run.started_at)
    .bind(run.ended_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
    sqlx::query_as(
      r#"
      SELECT id, workflow_id, tenant_id, plan_signature, plan, status,
             trigger_kind, trigger_payload, idempotency_key, started_at, ended_at
      FROM runs
      WHERE id = ?
      "#,
    )
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
  }

  async fn find_run_by_idempotency_key(&self, key: &str) -> Result<Option<Run>, StoreError> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT id, workflow_id, tenant_id, plan_signature, plan, status,
               trigger_kind, trigger_payload, idempotency_key, started_at, ended_at
        FROM runs
        WHERE idempotency_key = ?
        "#,
      )
      .bind(key)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  async fn update_run_status(
    &self,
    run_id: &str,
    status: RunStatus,
    ended_at: Option<DateTime<Utc>>,
  ) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      UPDATE runs
      SET status = ?, ended_at = ?
      WHERE id = ?
      "#,
    )
    .bind(status)
    .bind(ended_at)
    .bind(run_id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_active_runs(&self) -> Result<Vec<Run>, StoreError> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT id, workflow_id, tenant_id, plan_signature, plan, status,
               trigger_kind, trigger_payload, idempotency_key, started_at, ended_at
        FROM runs
        WHERE status IN ('queued', 'running', 'suspended')
        ORDER BY started_at ASC
        "#,
      )
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn upsert_node_execution(&self, execution: &NodeExecution) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO node_executions (run_id, node_ref, attempt, status, started_at, ended_at,
                                   error_kind, error_message, input_digest, output_digest,
                                   wait_token, heartbeat_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT(run_id, node_ref, attempt) DO UPDATE SET
        status = excluded.status,
        started_at = excluded.started_at,
        ended_at = excluded.ended_at,
        error_kind = excluded.error_kind,
        error_message = excluded.error_message,
        input_digest = excluded.input_digest,
        output_digest = excluded.output_digest,
        wait_token = excluded.wait_token,
        heartbeat_at = excluded.heartbeat_at
      "#,
    )
    .bind(&execution.run_id)
    .bind(&execution.node_ref)
    .bind(execution.attempt)
    .bind(execution.status)
    .bind(execution.started_at)
    .bind(execution.ended_at)
    .bind(&execution.error_kind)
    .bind(&execution.error_message)
    .bind(&execution.input_digest)
    .bind(&execution.output_digest)
    .bind(&execution.wait_token)
    .bind(execution.heartbeat_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_node_executions(&self, run_id: &str) -> Result<Vec<NodeExecution>, StoreError> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT run_id, node_ref, attempt, status, started_at, ended_at,
               error_kind, error_message, input_digest, output_digest,
               wait_token, heartbeat_at
        FROM node_executions
        WHERE run_id = ?
        ORDER BY node_ref ASC, attempt ASC
        "#,
      )
      .bind(run_id)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn heartbeat(
    &self,
    run_id: &str,
    node_ref: &str,
    attempt: i32,
    at: DateTime<Utc>,
  ) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      UPDATE node_executions
      SET heartbeat_at = ?
      WHERE run_id = ? AND node_ref = ? AND attempt = ? AND status = 'running'
      "#,
    )
    .bind(at)
    .bind(run_id)
    .bind(node_ref)
    .bind(attempt)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeExecution>, StoreError> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT run_id, node_ref, attempt, status, started_at, ended_at,
               error_kind, error_message, input_digest, output_digest,
               wait_token, heartbeat_at
        FROM node_executions
        WHERE status = 'running' AND (heartbeat_at IS NULL OR heartbeat_at < ?)
        "#,
      )
      .bind(cutoff)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn put_artifact_meta(&self, artifact: &ArtifactRow) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT OR IGNORE INTO artifacts (digest, media_type, size_bytes, stored_at)
      VALUES (?, ?, ?, ?)
      "#,
    )
    .bind(&artifact.digest)
    .bind(&artifact.media_type)
    .bind(artifact.size_bytes)
    .bind(artifact.stored_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_artifact_meta(&self, digest: &str) -> Result<ArtifactRow, StoreError> {
    sqlx::query_as(
      r#"
      SELECT digest, media_type, size_bytes, stored_at
      FROM artifacts
      WHERE digest = ?
      "#,
    )
    .bind(digest)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("artifact {digest}")))
  }

  async fn attach_node_io(&self, io: &NodeIo) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO node_io (run_id, node_ref, port_id, direction, digest)
      VALUES (?, ?, ?, ?, ?)
      ON CONFLICT(run_id, node_ref, port_id, direction) DO UPDATE SET
        digest = excluded.digest
      "#,
    )
    .bind(&io.run_id)
    .bind(&io.node_ref)
    .bind(&io.port_id)
    .bind(io.direction)
    .bind(&io.digest)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_node_io(&self, run_id: &str, node_ref: &str) -> Result<Vec<NodeIo>, StoreError> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT run_id, node_ref, port_id, direction, digest
        FROM node_io
        WHERE run_id = ? AND node_ref = ?
        ORDER BY direction ASC, port_id ASC
        "#,
      )
      .bind(run_id)
      .bind(node_ref)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn cached_outputs(
    &self,
    plan_signature: &str,
    node_ref: &str,
  ) -> Result<Vec<NodeIo>, StoreError> {
    let run_id: Option<String> = sqlx::query_scalar(
      r#"
      SELECT id FROM runs
      WHERE plan_signature = ? AND status = 'completed'
      ORDER BY started_at DESC
      LIMIT 1
      "#,
    )
    .bind(plan_signature)
    .fetch_optional(&self.pool)
    .await?;

    let Some(run_id) = run_id else {
      return Ok(Vec::new());
    };

    Ok(
      sqlx::query_as(
        r#"
        SELECT run_id, node_ref, port_id, direction, digest
        FROM node_io
        WHERE run_id = ? AND node_ref = ? AND direction = 'output'
        ORDER BY port_id ASC
        "#,
      )
      .bind(run_id)
      .bind(node_ref)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn create_approval(&self, approval: &ApprovalRequest) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO approvals (id, run_id, node_ref, kind, title, description,
                             approve_token, reject_token, wait_token, timeout_at,
                             status, decided_by, decided_at, context_data)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&approval.id)
    .bind(&approval.run_id)
    .bind(&approval.node_ref)
    .bind(approval.kind)
    .bind(&approval.title)
    .bind(&approval.description)
    .bind(&approval.approve_token)
    .bind(&approval.reject_token)
    .bind(&approval.wait_token)
    .bind(approval.timeout_at)
    .bind(approval.status)
    .bind(&approval.decided_by)
    .bind(approval.decided_at)
    .bind(&approval.context_data)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_approval(&self, id: &str) -> Result<ApprovalRequest, StoreError> {
    sqlx::query_as(
      r#"
      SELECT id, run_id, node_ref, kind, title, description,
             approve_token, reject_token, wait_token, timeout_at,
             status, decided_by, decided_at, context_data
      FROM approvals
      WHERE id = ?
      "#,
    )
    .bind(id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("approval {id}")))
  }

  async fn find_approval_by_token(
    &self,
    token: &str,
  ) -> Result<Option<(ApprovalRequest, TokenSide)>, StoreError> {
    let row: Option<ApprovalRequest> = sqlx::query_as(
      r#"
      SELECT id, run_id, node_ref, kind, title, description,
             approve_token, reject_token, wait_token, timeout_at,
             status, decided_by, decided_at, context_data
      FROM approvals
      WHERE approve_token = ? OR reject_token = ?
      "#,
    )
    .bind(token)
    .bind(token)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.map(|approval| {
      let side = if approval.approve_token == token {
        TokenSide::Approve
      } else {
        TokenSide::Reject
      };
      (approval, side)
    }))
  }

  async fn find_approval_by_wait_token(
    &self,
    wait_token: &str,
  ) -> Result<Option<ApprovalRequest>, StoreError> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT id, run_id, node_ref, kind, title, description,
               approve_token, reject_token, wait_token, timeout_at,
               status, decided_by, decided_at, context_data
        FROM approvals
        WHERE wait_token = ?
        "#,
      )
      .bind(wait_token)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  async fn update_approval_context(
    &self,
    id: &str,
    context_data: &serde_json::Value,
  ) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      UPDATE approvals
      SET context_data = ?
      WHERE id = ?
      "#,
    )
    .bind(sqlx::types::Json(context_data.clone()))
    .bind(id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn decide_approval(
    &self,
    id: &str,
    status: ApprovalStatus,
    decided_by: Option<&str>,
    decided_at: DateTime<Utc>,
  ) -> Result<bool, StoreError> {
    let result = sqlx::query(
      r#"
      UPDATE approvals
      SET status = ?, decided_by = ?, decided_at = ?
      WHERE id = ? AND status = 'pending'
      "#,
    )
    .bind(status)
    .bind(decided_by)
    .bind(decided_at)
    .bind(id)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn cancel_pending_approvals(&self, run_id: &str) -> Result<u64, StoreError> {
    let result = sqlx::query(
      r#"
      UPDATE approvals
      SET status = 'cancelled'
      WHERE run_id = ? AND status = 'pending'
      "#,
    )
    .bind(run_id)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected())
  }

  async fn timeout_overdue_approvals(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
    let result = sqlx::query(
      r#"
      UPDATE approvals
      SET status = 'timed_out', decided_at = ?
      WHERE status = 'pending' AND timeout_at IS NOT NULL AND timeout_at < ?
      "#,
    )
    .bind(now)
    .bind(now)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected())
  }

  async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO schedules (id, workflow_id, tenant_id, cron, next_fire_at, paused)
      VALUES (?, ?, ?, ?, ?, ?)
      ON CONFLICT(id) DO UPDATE SET
        cron = excluded.cron,
        next_fire_at = excluded.next_fire_at,
        paused = excluded.paused
      "#,
    )
    .bind(&schedule.id)
    .bind(&schedule.workflow_id)
    .bind(&schedule.tenant_id)
    .bind(&schedule.cron)
    .bind(schedule.next_fire_at)
    .bind(schedule.paused)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
    Ok(
      sqlx::query_as(
        r#"
        SELECT id, workflow_id, tenant_id, cron, next_fire_at, paused
        FROM schedules
        WHERE paused = 0 AND next_fire_at <= ?
        ORDER BY next_fire_at ASC
        "#,
      )
      .bind(now)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn update_schedule_fire(
    &self,
    id: &str,
    next_fire_at: DateTime<Utc>,
  ) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      UPDATE schedules
      SET next_fire_at = ?
      WHERE id = ?
      "#,
    )
    .bind(next_fire_at)
    .bind(id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn record_webhook_delivery(
    &self,
    source: &str,
    delivery_id: &str,
    head_signature: &str,
    at: DateTime<Utc>,
  ) -> Result<bool, StoreError> {
    let result = sqlx::query(
      r#"
      INSERT OR IGNORE INTO webhook_deliveries (source, delivery_id, head_signature, received_at)
      VALUES (?, ?, ?, ?)
      "#,
    )
    .bind(source)
    .bind(delivery_id)
    .bind(head_signature)
    .bind(at)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn prune_webhook_deliveries(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
    let result = sqlx::query(
      r#"
      DELETE FROM webhook_deliveries
      WHERE received_at < ?
      "#,
    )
    .bind(older_than)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected())
  }

  async fn acquire_lease(
    &self,
    name: &str,
    owner: &str,
    until: DateTime<Utc>,
    now: DateTime<Utc>,
  ) -> Result<bool, StoreError> {
    let result = sqlx::query(
      r#"
      INSERT INTO leases (name, owner, expires_at)
      VALUES (?, ?, ?)
      ON CONFLICT(name) DO UPDATE SET
        owner = excluded.owner,
        expires_at = excluded.expires_at
      WHERE leases.owner = excluded.owner OR leases.expires_at < ?
      "#,
    )
    .bind(name)
    .bind(owner)
    .bind(until)
    .bind(now)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn prune_events(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
    let result = sqlx::query(
      r#"
      DELETE FROM events
      WHERE ts < ?
        AND run_id IN (SELECT id FROM runs WHERE status IN ('completed', 'failed', 'cancelled'))
      "#,
    )
    .bind(older_than)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected())
  }
}

#[async_trait]
impl EventStore for SqliteStore {
  async fn append(&self, event: &Event) -> Result<(), EventError> {
    let payload =
      serde_json::to_string(&event.payload).map_err(|e| EventError::store(e.to_string()))?;

    sqlx::query(
      r#"
      INSERT INTO events (run_id, sequence, node_ref, kind, ts, payload)
      VALUES (?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&event.run_id)
    .bind(event.sequence as i64)
    .bind(&event.node_ref)
    .bind(event.kind.as_str())
    .bind(event.ts)
    .bind(payload)
    .execute(&self.pool)
    .await
    .map_err(|e| match &e {
      sqlx::Error::Database(db) if db.is_unique_violation() => EventError::SequenceConflict {
        run_id: event.run_id.clone(),
        sequence: event.sequence,
      },
      _ => EventError::store(e.to_string()),
    })?;

    Ok(())
  }

  async fn read_after(
    &self,
    run_id: &str,
    after: u64,
    until: Option<u64>,
  ) -> Result<Vec<Event>, EventError> {
    let rows = sqlx::query(
      r#"
      SELECT run_id, sequence, node_ref, kind, ts, payload
      FROM events
      WHERE run_id = ? AND sequence > ? AND sequence < ?
      ORDER BY sequence ASC
      "#,
    )
    .bind(run_id)
    .bind(after as i64)
    .bind(until.map(|u| u as i64).unwrap_or(i64::MAX))
    .fetch_all(&self.pool)
    .await
    .map_err(|e| EventError::store(e.to_string()))?;

    rows
      .into_iter()
      .map(|row| {
        let kind: String = row.get("kind");
        let payload: String = row.get("payload");
        Ok(Event {
          run_id: row.get("run_id"),
          sequence: row.get::<i64, _>("sequence") as u64,
          node_ref: row.get("node_ref"),
          kind: serde_json::from_value(serde_json::Value::String(kind))
            .map_err(|e| EventError::store(e.to_string()))?,
          ts: row.get("ts"),
          payload: serde_json::from_str(&payload).map_err(|e| EventError::store(e.to_string()))?,
        })
      })
      .collect()
  }

  async fn last_sequence(&self, run_id: &str) -> Result<u64, EventError> {
    let row = sqlx::query(
      r#"
      SELECT COALESCE(MAX(sequence), 0) AS last
      FROM events
      WHERE run_id = ?
      "#,
    )
    .bind(run_id)
    .fetch_one(&self.pool)
    .await
    .map_err(|e| EventError::store(e.to_string()))?;

    Ok(row.get::<i64, _>("last") as u64)
  }
}
