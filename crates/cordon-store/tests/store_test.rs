//! SQLite store tests over an in-memory database.

use chrono::{Duration, Utc};
use cordon_events::{Event, EventKind, EventStore};
use cordon_store::{
  ApprovalKind, ApprovalRequest, ApprovalStatus, NodeExecution, NodeExecutionStatus, Run,
  RunStatus, SqliteStore, Store, TokenSide, WorkflowRow,
};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;

async fn store() -> SqliteStore {
  let pool = SqlitePoolOptions::new()
    .max_connections(1)
    .connect("sqlite::memory:")
    .await
    .expect("open in-memory sqlite");
  let store = SqliteStore::new(pool);
  store.migrate().await.expect("migrations");
  store
}

fn workflow_row(id: &str) -> WorkflowRow {
  let now = Utc::now();
  WorkflowRow {
    id: id.to_string(),
    tenant_id: "tenant-1".to_string(),
    name: "recon".to_string(),
    description: String::new(),
    graph: Json(json!({"nodes": [], "edges": []})),
    version: 1,
    created_at: now,
    updated_at: now,
  }
}

fn run_row(id: &str, workflow_id: &str, key: Option<&str>) -> Run {
  Run {
    id: id.to_string(),
    workflow_id: workflow_id.to_string(),
    tenant_id: "tenant-1".to_string(),
    plan_signature: "sig".to_string(),
    plan: Json(json!({"actions": []})),
    status: RunStatus::Queued,
    trigger_kind: "manual".to_string(),
    trigger_payload: Json(json!({"x": 21})),
    idempotency_key: key.map(str::to_string),
    started_at: Utc::now(),
    ended_at: None,
  }
}

#[tokio::test]
async fn run_round_trip_and_idempotency_key() {
  let store = store().await;
  store.upsert_workflow(&workflow_row("wf-1")).await.unwrap();
  store
    .create_run(&run_row("run-1", "wf-1", Some("key-1")))
    .await
    .unwrap();

  let run = store.get_run("run-1").await.unwrap();
  assert_eq!(run.status, RunStatus::Queued);
  assert_eq!(run.trigger_payload.0["x"], 21);

  let by_key = store
    .find_run_by_idempotency_key("key-1")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(by_key.id, "run-1");
  assert!(store
    .find_run_by_idempotency_key("other")
    .await
    .unwrap()
    .is_none());

  store
    .update_run_status("run-1", RunStatus::Completed, Some(Utc::now()))
    .await
    .unwrap();
  assert_eq!(
    store.get_run("run-1").await.unwrap().status,
    RunStatus::Completed
  );
}

#[tokio::test]
async fn node_execution_upsert_and_stale_scan() {
  let store = store().await;
  store.upsert_workflow(&workflow_row("wf-1")).await.unwrap();
  store
    .create_run(&run_row("run-1", "wf-1", None))
    .await
    .unwrap();

  let now = Utc::now();
  let mut execution = NodeExecution {
    run_id: "run-1".to_string(),
    node_ref: "scan".to_string(),
    attempt: 1,
    status: NodeExecutionStatus::Running,
    started_at: Some(now),
    ended_at: None,
    error_kind: None,
    error_message: None,
    input_digest: None,
    output_digest: None,
    wait_token: None,
    heartbeat_at: Some(now - Duration::seconds(120)),
  };
  store.upsert_node_execution(&execution).await.unwrap();

  let stale = store
    .stale_running(now - Duration::seconds(30))
    .await
    .unwrap();
  assert_eq!(stale.len(), 1);
  assert_eq!(stale[0].node_ref, "scan");

  // A fresh heartbeat clears it from the scan.
  store
    .heartbeat("run-1", "scan", 1, now)
    .await
    .unwrap();
  let stale = store
    .stale_running(now - Duration::seconds(30))
    .await
    .unwrap();
  assert!(stale.is_empty());

  // The same attempt row is replaced, not duplicated.
  execution.status = NodeExecutionStatus::Succeeded;
  execution.ended_at = Some(Utc::now());
  store.upsert_node_execution(&execution).await.unwrap();
  let all = store.list_node_executions("run-1").await.unwrap();
  assert_eq!(all.len(), 1);
  assert_eq!(all[0].status, NodeExecutionStatus::Succeeded);
}

#[tokio::test]
async fn approval_tokens_are_single_use() {
  let store = store().await;
  store.upsert_workflow(&workflow_row("wf-1")).await.unwrap();
  store
    .create_run(&run_row("run-1", "wf-1", None))
    .await
    .unwrap();

  let approval = ApprovalRequest {
    id: "appr-1".to_string(),
    run_id: "run-1".to_string(),
    node_ref: "gate".to_string(),
    kind: ApprovalKind::Approval,
    title: "Deploy exploit?".to_string(),
    description: String::new(),
    approve_token: "tok-approve".to_string(),
    reject_token: "tok-reject".to_string(),
    wait_token: "wait-1".to_string(),
    timeout_at: None,
    status: ApprovalStatus::Pending,
    decided_by: None,
    decided_at: None,
    context_data: Json(json!({})),
  };
  store.create_approval(&approval).await.unwrap();

  let (found, side) = store
    .find_approval_by_token("tok-approve")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(found.id, "appr-1");
  assert_eq!(side, TokenSide::Approve);

  let decided = store
    .decide_approval("appr-1", ApprovalStatus::Approved, Some("alice"), Utc::now())
    .await
    .unwrap();
  assert!(decided);

  // Second decision on the same request fails.
  let decided_again = store
    .decide_approval("appr-1", ApprovalStatus::Rejected, Some("bob"), Utc::now())
    .await
    .unwrap();
  assert!(!decided_again);
}

#[tokio::test]
async fn webhook_deliveries_dedupe() {
  let store = store().await;
  let now = Utc::now();

  assert!(store
    .record_webhook_delivery("github", "d-1", "sha256=abc", now)
    .await
    .unwrap());
  assert!(!store
    .record_webhook_delivery("github", "d-1", "sha256=abc", now)
    .await
    .unwrap());
  // Same id from a different source is a distinct delivery.
  assert!(store
    .record_webhook_delivery("gitlab", "d-1", "sha256=abc", now)
    .await
    .unwrap());
}

#[tokio::test]
async fn leases_exclude_other_owners_until_expiry() {
  let store = store().await;
  let now = Utc::now();

  assert!(store
    .acquire_lease("scheduler", "worker-a", now + Duration::seconds(30), now)
    .await
    .unwrap());
  // Another worker cannot steal a live lease.
  assert!(!store
    .acquire_lease("scheduler", "worker-b", now + Duration::seconds(30), now)
    .await
    .unwrap());
  // The holder renews freely.
  assert!(store
    .acquire_lease("scheduler", "worker-a", now + Duration::seconds(60), now)
    .await
    .unwrap());
  // After expiry the lease is up for grabs.
  let later = now + Duration::seconds(90);
  assert!(store
    .acquire_lease("scheduler", "worker-b", later + Duration::seconds(30), later)
    .await
    .unwrap());
}

#[tokio::test]
async fn event_store_round_trips_through_sqlite() {
  let store = store().await;
  store.upsert_workflow(&workflow_row("wf-1")).await.unwrap();
  store
    .create_run(&run_row("run-1", "wf-1", None))
    .await
    .unwrap();

  for sequence in 1..=3u64 {
    store
      .append(&Event {
        sequence,
        run_id: "run-1".to_string(),
        node_ref: Some("scan".to_string()),
        ts: Utc::now(),
        kind: EventKind::NodeProgress,
        payload: json!({"step": sequence}),
      })
      .await
      .unwrap();
  }

  assert_eq!(store.last_sequence("run-1").await.unwrap(), 3);

  let tail = store.read_after("run-1", 1, None).await.unwrap();
  assert_eq!(tail.len(), 2);
  assert_eq!(tail[0].sequence, 2);
  assert_eq!(tail[0].kind, EventKind::NodeProgress);
  assert_eq!(tail[1].payload["step"], 3);
}
