use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cordon_artifact::{ArtifactStore, Digest};
use cordon_events::{EventKind, EventStream, StreamHub};
use cordon_gateway::{Gateway, ToolResolver};
use cordon_plan::{compile, ExecutionPlan};
use cordon_registry::ComponentRegistry;
use cordon_runner::Runner;
use cordon_store::{
  ApprovalKind, ApprovalStatus, IoDirection, Json, NodeExecutionStatus, Run, RunStatus, Store,
  TokenSide, WorkflowRow,
};
use cordon_trigger::{RunRequest, RunSubmitter, SubmitError};
use cordon_workflow::{validate, GraphDef, WorkflowDef};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::driver::{DriverSeed, NodeState, RecoveredState, RunDriver};
use crate::error::OrchestratorError;

/// The runners an orchestrator dispatches activations to.
#[derive(Clone)]
pub struct RunnerSet {
  pub inline: Arc<dyn Runner>,
  pub container: Option<Arc<dyn Runner>>,
}

#[derive(Clone)]
pub struct OrchestratorConfig {
  /// Default bound on concurrent activations per run.
  pub max_in_flight: usize,
  /// Interval between activation heartbeats.
  pub heartbeat_interval: Duration,
  /// Slack added on top of `2 × interval` before an attempt counts as lost.
  pub heartbeat_grace: Duration,
  /// How long a cancelled activation may run before it is abandoned.
  pub cancel_grace: Duration,
  /// Activation deadline when the component declares none.
  pub default_timeout: Duration,
  /// Public JSON-RPC endpoint agents reach the gateway on.
  pub gateway_endpoint: Option<String>,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      max_in_flight: 8,
      heartbeat_interval: Duration::from_secs(10),
      heartbeat_grace: Duration::from_secs(5),
      cancel_grace: Duration::from_secs(5),
      default_timeout: Duration::from_secs(120),
      gateway_endpoint: None,
    }
  }
}

impl OrchestratorConfig {
  /// Heartbeats older than this mark the attempt as lost.
  pub fn lost_cutoff(&self) -> Duration {
    self.heartbeat_interval * 2 + self.heartbeat_grace
  }
}

/// Control messages delivered to a live run driver.
pub(crate) enum Control {
  Resume { wait_token: String, payload: Value },
  Cancel { reason: String },
}

pub(crate) struct Inner {
  pub registry: Arc<ComponentRegistry>,
  pub store: Arc<dyn Store>,
  pub hub: Arc<StreamHub>,
  pub artifacts: Arc<dyn ArtifactStore>,
  pub runners: RunnerSet,
  pub gateway: Option<Arc<Gateway>>,
  pub tool_resolver: Option<Arc<dyn ToolResolver>>,
  pub config: OrchestratorConfig,
  pub controls: Mutex<HashMap<String, mpsc::UnboundedSender<Control>>>,
}

/// Node inputs and outputs resolved back into values.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NodeIoView {
  pub inputs: serde_json::Map<String, Value>,
  pub outputs: serde_json::Map<String, Value>,
}

/// The durable execution orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
  inner: Arc<Inner>,
}

impl Orchestrator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    registry: Arc<ComponentRegistry>,
    store: Arc<dyn Store>,
    hub: Arc<StreamHub>,
    artifacts: Arc<dyn ArtifactStore>,
    runners: RunnerSet,
    gateway: Option<Arc<Gateway>>,
    tool_resolver: Option<Arc<dyn ToolResolver>>,
    config: OrchestratorConfig,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        registry,
        store,
        hub,
        artifacts,
        runners,
        gateway,
        tool_resolver,
        config,
        controls: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Store (or update) a workflow definition.
  pub async fn register_workflow(
    &self,
    workflow: &WorkflowDef,
    tenant_id: &str,
  ) -> Result<(), OrchestratorError> {
    let now = Utc::now();
    let row = WorkflowRow {
      id: workflow.id.clone(),
      tenant_id: tenant_id.to_string(),
      name: workflow.name.clone(),
      description: workflow.description.clone(),
      graph: Json(serde_json::to_value(&workflow.graph).unwrap_or(Value::Null)),
      version: workflow.version as i32,
      created_at: now,
      updated_at: now,
    };
    self.inner.store.upsert_workflow(&row).await?;
    Ok(())
  }

  /// Submit a run. Validates, compiles, persists the run, and spawns its
  /// driver. Idempotent on the request's idempotency key.
  #[instrument(name = "submit_run", skip(self, request), fields(workflow_id = %request.workflow_id))]
  pub async fn submit(&self, request: RunRequest) -> Result<String, OrchestratorError> {
    if let Some(key) = &request.idempotency_key {
      if let Some(existing) = self.inner.store.find_run_by_idempotency_key(key).await? {
        info!(run_id = %existing.id, "idempotent resubmission");
        return Ok(existing.id);
      }
    }

    let workflow = self.load_workflow(&request.workflow_id).await?;

    let report = validate(&workflow, &self.inner.registry);
    if !report.is_valid() {
      return Err(OrchestratorError::Validation { report });
    }

    let plan = compile(&workflow, &self.inner.registry)?;

    let run_id = Uuid::new_v4().to_string();
    let run = Run {
      id: run_id.clone(),
      workflow_id: request.workflow_id.clone(),
      tenant_id: request.tenant_id.clone(),
      plan_signature: plan.signature.clone(),
      plan: Json(serde_json::to_value(&plan).unwrap_or(Value::Null)),
      status: RunStatus::Queued,
      trigger_kind: request.kind.as_str().to_string(),
      trigger_payload: Json(request.payload.clone()),
      idempotency_key: request.idempotency_key.clone(),
      started_at: Utc::now(),
      ended_at: None,
    };
    self.inner.store.create_run(&run).await?;

    self
      .spawn_driver(DriverSeed {
        run_id: run_id.clone(),
        workflow_id: request.workflow_id,
        tenant_id: request.tenant_id,
        plan,
        trigger_payload: request.payload,
        max_in_flight: request.max_in_flight.unwrap_or(self.inner.config.max_in_flight),
        timeout_override: request.timeout_override,
        recovered: None,
      })
      .await;

    Ok(run_id)
  }

  /// Cancel a run. Live drivers get a cooperative signal; inert runs are
  /// finalized directly from storage.
  pub async fn cancel(&self, run_id: &str, reason: &str) -> Result<(), OrchestratorError> {
    let sent = {
      let controls = self.inner.controls.lock().await;
      match controls.get(run_id) {
        Some(tx) => tx
          .send(Control::Cancel {
            reason: reason.to_string(),
          })
          .is_ok(),
        None => false,
      }
    };
    if sent {
      return Ok(());
    }

    // No live driver (crashed worker, not yet recovered). Finalize in place.
    let run = self.inner.store.get_run(run_id).await?;
    if run.status.is_terminal() {
      return Err(OrchestratorError::RunNotActive(run_id.to_string()));
    }
    self.inner.store.cancel_pending_approvals(run_id).await?;
    self
      .inner
      .store
      .update_run_status(run_id, RunStatus::Cancelled, Some(Utc::now()))
      .await?;
    self
      .inner
      .hub
      .append(
        run_id,
        None,
        EventKind::RunFailed,
        serde_json::json!({"status": "cancelled", "reason": reason}),
      )
      .await?;
    self.inner.hub.close_run(run_id).await;
    Ok(())
  }

  /// Apply an approval decision by token. Tokens are single-use; the side
  /// the token encodes must match the stated decision.
  pub async fn decide_approval(
    &self,
    token: &str,
    decision: &str,
    decided_by: Option<&str>,
    note: Option<&str>,
  ) -> Result<(), OrchestratorError> {
    let Some((approval, side)) = self.inner.store.find_approval_by_token(token).await? else {
      return Err(OrchestratorError::ApprovalNotFound);
    };

    let expected = match side {
      TokenSide::Approve => "approve",
      TokenSide::Reject => "reject",
    };
    if decision != expected {
      return Err(OrchestratorError::DecisionMismatch);
    }

    match approval.status {
      ApprovalStatus::Pending => {}
      ApprovalStatus::Approved | ApprovalStatus::Rejected => {
        return Err(OrchestratorError::ApprovalAlreadyDecided);
      }
      // Invalidated tokens (cancelled run, expired gate) read as gone.
      ApprovalStatus::Cancelled | ApprovalStatus::TimedOut => {
        return Err(OrchestratorError::ApprovalNotFound);
      }
    }

    let status = match side {
      TokenSide::Approve => ApprovalStatus::Approved,
      TokenSide::Reject => ApprovalStatus::Rejected,
    };
    let updated = self
      .inner
      .store
      .decide_approval(&approval.id, status, decided_by, Utc::now())
      .await?;
    if !updated {
      return Err(OrchestratorError::ApprovalAlreadyDecided);
    }

    self
      .resume(
        &approval.run_id,
        &approval.wait_token,
        serde_json::json!({
          "decision": decision,
          "decided_by": decided_by,
          "note": note,
        }),
      )
      .await
  }

  /// Complete a suspended manual-form node.
  pub async fn submit_form_response(
    &self,
    request_id: &str,
    payload: Value,
  ) -> Result<(), OrchestratorError> {
    let approval = self.inner.store.get_approval(request_id).await?;
    if approval.kind != ApprovalKind::Form {
      return Err(OrchestratorError::ApprovalNotFound);
    }
    let updated = self
      .inner
      .store
      .decide_approval(&approval.id, ApprovalStatus::Approved, None, Utc::now())
      .await?;
    if !updated {
      return Err(OrchestratorError::ApprovalAlreadyDecided);
    }
    // Keep the submission durable so a crashed worker resumes with it.
    let mut context = approval.context_data.0.clone();
    if !context.is_object() {
      context = serde_json::json!({});
    }
    context["submitted"] = payload.clone();
    self
      .inner
      .store
      .update_approval_context(&approval.id, &context)
      .await?;

    self
      .resume(
        &approval.run_id,
        &approval.wait_token,
        serde_json::json!({"payload": payload}),
      )
      .await
  }

  async fn resume(
    &self,
    run_id: &str,
    wait_token: &str,
    payload: Value,
  ) -> Result<(), OrchestratorError> {
    let controls = self.inner.controls.lock().await;
    let Some(tx) = controls.get(run_id) else {
      // The decision is durable; recovery will pick it up when the run's
      // driver is rebuilt.
      warn!(run_id, "resume signalled for a run with no live driver");
      return Ok(());
    };
    tx.send(Control::Resume {
      wait_token: wait_token.to_string(),
      payload,
    })
    .map_err(|_| OrchestratorError::RunNotActive(run_id.to_string()))?;
    Ok(())
  }

  /// Live event stream for a run, replaying from `after`.
  pub async fn subscribe_events(
    &self,
    run_id: &str,
    after: u64,
  ) -> Result<EventStream, OrchestratorError> {
    Ok(self.inner.hub.subscribe(run_id, after).await?)
  }

  /// Fetch artifact bytes by digest.
  pub async fn get_artifact(&self, digest: &str) -> Result<bytes::Bytes, OrchestratorError> {
    Ok(
      self
        .inner
        .artifacts
        .get(&Digest::from_hex(digest))
        .await?,
    )
  }

  /// Resolve a node's recorded inputs and outputs back into values.
  pub async fn get_node_io(
    &self,
    run_id: &str,
    node_ref: &str,
  ) -> Result<NodeIoView, OrchestratorError> {
    let mut view = NodeIoView::default();
    for io in self.inner.store.list_node_io(run_id, node_ref).await? {
      let bytes = self
        .inner
        .artifacts
        .get(&Digest::from_hex(&io.digest))
        .await?;
      let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
      match io.direction {
        IoDirection::Input => view.inputs.insert(io.port_id, value),
        IoDirection::Output => view.outputs.insert(io.port_id, value),
      };
    }
    Ok(view)
  }

  /// Rebuild drivers for every non-terminal run after a restart.
  pub async fn recover(&self) -> Result<usize, OrchestratorError> {
    let active = self.inner.store.list_active_runs().await?;
    let mut recovered = 0;
    for run in active {
      if let Err(e) = self.recover_run(&run).await {
        error!(run_id = %run.id, error = %e, "run recovery failed");
      } else {
        recovered += 1;
      }
    }
    Ok(recovered)
  }

  /// Rebuild one run's driver from persisted state.
  #[instrument(name = "recover_run", skip(self, run), fields(run_id = %run.id))]
  async fn recover_run(&self, run: &Run) -> Result<(), OrchestratorError> {
    {
      let controls = self.inner.controls.lock().await;
      if controls.contains_key(&run.id) {
        return Ok(());
      }
    }

    let plan: ExecutionPlan = serde_json::from_value(run.plan.0.clone())
      .map_err(|e| OrchestratorError::Internal(format!("stored plan unreadable: {e}")))?;

    let mut state = RecoveredState::default();
    let cutoff = Utc::now()
      - chrono::Duration::from_std(self.inner.config.lost_cutoff()).expect("cutoff fits");

    for execution in self.inner.store.list_node_executions(&run.id).await? {
      // Rows are ordered by attempt; the last row per node wins.
      let node_ref = execution.node_ref.clone();
      state.attempts.insert(node_ref.clone(), execution.attempt as u32);
      match execution.status {
        NodeExecutionStatus::Succeeded => {
          let view = self.get_node_io(&run.id, &node_ref).await?;
          state.outputs.insert(node_ref.clone(), view.outputs);
          state.statuses.insert(node_ref, NodeState::Succeeded);
        }
        NodeExecutionStatus::Running => {
          let stale = execution.heartbeat_at.map(|hb| hb < cutoff).unwrap_or(true);
          if stale {
            state.lost.push((node_ref.clone(), execution.attempt as u32));
          }
          state.statuses.insert(node_ref, NodeState::Pending);
        }
        NodeExecutionStatus::Suspended => {
          let wait_token = execution.wait_token.clone().unwrap_or_default();
          // A decision made while the worker was down resumes immediately.
          match self.decided_resume_payload(&run.id, &node_ref).await? {
            Some(payload) => {
              state.resume_payloads.insert(node_ref.clone(), payload);
              state.statuses.insert(node_ref, NodeState::Pending);
            }
            None => {
              state
                .statuses
                .insert(node_ref, NodeState::Suspended { wait_token });
            }
          }
        }
        NodeExecutionStatus::Failed => {
          // Run is still active, so this attempt was awaiting a retry.
          state.statuses.insert(node_ref, NodeState::Pending);
        }
        NodeExecutionStatus::Pending | NodeExecutionStatus::Skipped => {
          state.statuses.insert(node_ref, NodeState::Pending);
        }
      }
    }

    self
      .spawn_driver(DriverSeed {
        run_id: run.id.clone(),
        workflow_id: run.workflow_id.clone(),
        tenant_id: run.tenant_id.clone(),
        plan,
        trigger_payload: run.trigger_payload.0.clone(),
        max_in_flight: self.inner.config.max_in_flight,
        timeout_override: None,
        recovered: Some(state),
      })
      .await;

    info!("run driver rebuilt");
    Ok(())
  }

  async fn decided_resume_payload(
    &self,
    run_id: &str,
    node_ref: &str,
  ) -> Result<Option<Value>, OrchestratorError> {
    // The approval table is keyed by id, not node; reach the row through the
    // suspended attempt's wait token.
    let Some(execution) = self
      .inner
      .store
      .list_node_executions(run_id)
      .await?
      .into_iter()
      .filter(|e| e.node_ref == node_ref)
      .next_back()
    else {
      return Ok(None);
    };
    let Some(wait_token) = execution.wait_token else {
      return Ok(None);
    };
    let Some(approval) = self
      .inner
      .store
      .find_approval_by_wait_token(&wait_token)
      .await?
    else {
      return Ok(None);
    };
    match approval.status {
      ApprovalStatus::Approved => Ok(Some(serde_json::json!({
        "decision": "approve",
        "decided_by": approval.decided_by,
        "payload": approval.context_data.0.get("submitted").cloned().unwrap_or(Value::Null),
      }))),
      ApprovalStatus::Rejected => Ok(Some(serde_json::json!({"decision": "reject"}))),
      _ => Ok(None),
    }
  }

  /// Background maintenance: stale-heartbeat sweeping, event retention, and
  /// webhook-delivery pruning.
  pub fn spawn_maintenance(
    &self,
    retention: Duration,
    cancel: CancellationToken,
  ) -> tokio::task::JoinHandle<()> {
    let orchestrator = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(Duration::from_secs(60));
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        tokio::select! {
          _ = ticker.tick() => {}
          _ = cancel.cancelled() => return,
        }
        if let Err(e) = orchestrator.sweep(retention).await {
          warn!(error = %e, "maintenance sweep failed");
        }
      }
    })
  }

  async fn sweep(&self, retention: Duration) -> Result<(), OrchestratorError> {
    let now = Utc::now();
    let cutoff =
      now - chrono::Duration::from_std(self.inner.config.lost_cutoff()).expect("cutoff fits");

    // Attempts with stale heartbeats whose run has no live driver belong to
    // a dead worker; rebuild those runs.
    let stale = self.inner.store.stale_running(cutoff).await?;
    for execution in stale {
      let has_driver = {
        let controls = self.inner.controls.lock().await;
        controls.contains_key(&execution.run_id)
      };
      if has_driver {
        continue;
      }
      let run = self.inner.store.get_run(&execution.run_id).await?;
      if !run.status.is_terminal() {
        self.recover_run(&run).await?;
      }
    }

    self.inner.store.timeout_overdue_approvals(now).await?;

    let retention_cutoff =
      now - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(30));
    self.inner.store.prune_events(retention_cutoff).await?;
    self
      .inner
      .store
      .prune_webhook_deliveries(retention_cutoff)
      .await?;
    Ok(())
  }

  async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowDef, OrchestratorError> {
    let row = match self.inner.store.get_workflow(workflow_id).await {
      Ok(row) => row,
      Err(cordon_store::StoreError::NotFound(_)) => {
        return Err(OrchestratorError::WorkflowNotFound(workflow_id.to_string()));
      }
      Err(e) => return Err(e.into()),
    };
    let graph: GraphDef = serde_json::from_value(row.graph.0)
      .map_err(|e| OrchestratorError::Internal(format!("stored graph unreadable: {e}")))?;
    Ok(WorkflowDef {
      id: row.id,
      name: row.name,
      description: row.description,
      version: row.version as u32,
      graph,
    })
  }

  async fn spawn_driver(&self, seed: DriverSeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    {
      let mut controls = self.inner.controls.lock().await;
      controls.insert(seed.run_id.clone(), tx);
    }
    let driver = RunDriver::new(self.inner.clone(), seed, rx);
    tokio::spawn(driver.drive());
  }
}

#[async_trait]
impl RunSubmitter for Orchestrator {
  async fn submit(&self, request: RunRequest) -> Result<String, SubmitError> {
    Orchestrator::submit(self, request).await.map_err(|e| match e {
      OrchestratorError::WorkflowNotFound(id) => SubmitError::WorkflowNotFound(id),
      OrchestratorError::Validation { report } => SubmitError::Validation(
        report
          .errors
          .iter()
          .map(|i| i.message.clone())
          .collect::<Vec<_>>()
          .join("; "),
      ),
      other => SubmitError::Internal(other.to_string()),
    })
  }
}
