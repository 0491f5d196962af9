use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use cordon_artifact::digest_bytes;
use cordon_events::EventKind;
use cordon_gateway::random_token;
use cordon_plan::{ExecutionPlan, InputBinding, PlannedAction};
use cordon_registry::{ComponentDefinition, ErrorKind, RunnerKind};
use cordon_runner::{
  builtins::TRIGGER_PAYLOAD_INPUT, Activation, EventLogger, ExecutionContext, Failure, Outcome,
  ScopedHttp, Success, ToolSessionHandle,
};
use cordon_store::{
  ApprovalKind, ApprovalRequest, ApprovalStatus, ArtifactRow, IoDirection, Json, NodeExecution,
  NodeExecutionStatus, NodeIo, RunStatus,
};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::orchestrator::{Control, Inner};

/// Driver-local view of one node's progress.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeState {
  Pending,
  Ready,
  Running,
  Backoff,
  Suspended { wait_token: String },
  Succeeded,
  Failed,
  Skipped,
  /// Tool-mode nodes are reached through the gateway, never scheduled.
  ToolServer,
}

/// State reconstructed from storage when a run is recovered.
#[derive(Default)]
pub(crate) struct RecoveredState {
  pub statuses: HashMap<String, NodeState>,
  pub attempts: HashMap<String, u32>,
  pub outputs: HashMap<String, Map<String, Value>>,
  pub resume_payloads: HashMap<String, Value>,
  /// Attempts that were `running` with a stale heartbeat.
  pub lost: Vec<(String, u32)>,
}

pub(crate) struct DriverSeed {
  pub run_id: String,
  pub workflow_id: String,
  pub tenant_id: String,
  pub plan: ExecutionPlan,
  pub trigger_payload: Value,
  pub max_in_flight: usize,
  pub timeout_override: Option<Duration>,
  pub recovered: Option<RecoveredState>,
}

/// How a finished run ends.
enum Terminal {
  Completed,
  Failed { reason: String },
  Cancelled { reason: String },
}

pub(crate) struct RunDriver {
  inner: Arc<Inner>,
  run_id: String,
  workflow_id: String,
  tenant_id: String,
  plan: ExecutionPlan,
  trigger_payload: Value,
  max_in_flight: usize,
  timeout_override: Option<Duration>,
  recovered: Option<RecoveredState>,
  control_rx: mpsc::UnboundedReceiver<Control>,
  cancel: CancellationToken,

  states: HashMap<String, NodeState>,
  attempts: HashMap<String, u32>,
  outputs: HashMap<String, Map<String, Value>>,
  resume_payloads: HashMap<String, Value>,
  /// Nodes resumed from suspension skip the `node.started` event.
  resumed_nodes: HashSet<String>,
  ready: VecDeque<String>,
  in_flight: JoinSet<(String, u32, Outcome)>,
  retry_timers: JoinSet<String>,
  /// wait token -> node ref
  suspended: HashMap<String, String>,
  /// (node, attempt) -> open gateway session
  sessions: HashMap<(String, u32), String>,
  failing: Option<Terminal>,
  started_at: chrono::DateTime<chrono::Utc>,
}

impl RunDriver {
  pub(crate) fn new(
    inner: Arc<Inner>,
    seed: DriverSeed,
    control_rx: mpsc::UnboundedReceiver<Control>,
  ) -> Self {
    Self {
      inner,
      run_id: seed.run_id,
      workflow_id: seed.workflow_id,
      tenant_id: seed.tenant_id,
      plan: seed.plan,
      trigger_payload: seed.trigger_payload,
      max_in_flight: seed.max_in_flight.max(1),
      timeout_override: seed.timeout_override,
      recovered: seed.recovered,
      control_rx,
      cancel: CancellationToken::new(),
      states: HashMap::new(),
      attempts: HashMap::new(),
      outputs: HashMap::new(),
      resume_payloads: HashMap::new(),
      resumed_nodes: HashSet::new(),
      ready: VecDeque::new(),
      in_flight: JoinSet::new(),
      retry_timers: JoinSet::new(),
      suspended: HashMap::new(),
      sessions: HashMap::new(),
      failing: None,
      started_at: Utc::now(),
    }
  }

  #[instrument(name = "run_drive", skip(self), fields(run_id = %self.run_id, workflow_id = %self.workflow_id))]
  pub(crate) async fn drive(mut self) {
    let terminal = match self.drive_inner().await {
      Ok(terminal) => terminal,
      Err(e) => {
        error!(error = %e, "run driver aborted");
        Terminal::Failed {
          reason: format!("internal error: {e}"),
        }
      }
    };
    if let Err(e) = self.finalize(terminal).await {
      error!(error = %e, "run finalization failed");
    }
  }

  async fn drive_inner(&mut self) -> Result<Terminal, crate::OrchestratorError> {
    let recovering = self.recovered.is_some();
    self.seed_states().await?;

    if !recovering {
      self
        .emit(
          None,
          EventKind::RunStarted,
          json!({
            "workflow_id": self.workflow_id,
            "plan_signature": self.plan.signature,
          }),
        )
        .await;
    }
    self
      .inner
      .store
      .update_run_status(&self.run_id, RunStatus::Running, None)
      .await?;

    self.enqueue_ready();

    loop {
      // Saturate the in-flight window unless the run is winding down.
      while self.failing.is_none()
        && self.in_flight.len() < self.max_in_flight
        && !self.ready.is_empty()
      {
        let node_ref = self.ready.pop_front().expect("non-empty queue");
        self.activate(node_ref).await?;
      }

      let idle = self.in_flight.is_empty() && self.retry_timers.is_empty();
      if idle && self.ready.is_empty() {
        if let Some(terminal) = self.failing.take() {
          return Ok(terminal);
        }
        if self.suspended.is_empty() {
          return Ok(self.assess_terminal());
        }
        // Parked on human input; reflect that in the run row.
        self
          .inner
          .store
          .update_run_status(&self.run_id, RunStatus::Suspended, None)
          .await?;
      }

      tokio::select! {
        biased;
        control = self.control_rx.recv() => match control {
          Some(control) => self.handle_control(control).await?,
          None => {
            return Ok(Terminal::Failed {
              reason: "orchestrator shut down".to_string(),
            });
          }
        },
        Some(result) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
          match result {
            Ok((node_ref, attempt, outcome)) => {
              self.handle_outcome(node_ref, attempt, outcome).await?;
            }
            Err(join_error) => {
              // The activation task itself died; treat it as a lost attempt.
              warn!(error = %join_error, "activation task failed to join");
              // The node cannot be identified from the join error alone;
              // sweep running states that have no live task next iteration.
              self.reconcile_running_states().await?;
            }
          }
        },
        Some(result) = self.retry_timers.join_next(), if !self.retry_timers.is_empty() => {
          if let Ok(node_ref) = result {
            if self.states.get(&node_ref) == Some(&NodeState::Backoff) {
              self.states.insert(node_ref.clone(), NodeState::Ready);
              self.ready.push_back(node_ref);
            }
          }
        },
      }
    }
  }

  /// Initialize per-node state, fresh or from recovery.
  async fn seed_states(&mut self) -> Result<(), crate::OrchestratorError> {
    for action in &self.plan.actions {
      let state = if action.tool_mode {
        NodeState::ToolServer
      } else {
        NodeState::Pending
      };
      self.states.insert(action.node_ref.clone(), state);
      self.attempts.insert(action.node_ref.clone(), 0);
    }

    let Some(recovered) = self.recovered.take() else {
      return Ok(());
    };

    for (node_ref, attempt) in &recovered.attempts {
      self.attempts.insert(node_ref.clone(), *attempt);
    }
    for (node_ref, state) in recovered.statuses {
      if let NodeState::Suspended { wait_token } = &state {
        self.suspended.insert(wait_token.clone(), node_ref.clone());
      }
      self.states.insert(node_ref, state);
    }
    self.outputs = recovered.outputs;
    for (node_ref, payload) in recovered.resume_payloads {
      self.resumed_nodes.insert(node_ref.clone());
      self.resume_payloads.insert(node_ref, payload);
    }

    // Stale running attempts die as `lost` and re-enter under policy.
    for (node_ref, attempt) in recovered.lost {
      let failure = Failure::new(ErrorKind::Lost, "worker heartbeat lost", true);
      self.record_failure(&node_ref, attempt, &failure).await?;
      let component = self.component_for(&node_ref)?;
      if component.retry_policy.allows_retry(attempt, ErrorKind::Lost) {
        self.states.insert(node_ref, NodeState::Pending);
      } else {
        self.states.insert(node_ref.clone(), NodeState::Failed);
        self.begin_run_failure(format!("node '{node_ref}' lost after final attempt")).await?;
      }
    }
    Ok(())
  }

  /// Move every satisfied pending node into the FIFO ready queue, in plan
  /// order.
  fn enqueue_ready(&mut self) {
    let ready: Vec<String> = self
      .plan
      .actions
      .iter()
      .filter(|action| self.states.get(&action.node_ref) == Some(&NodeState::Pending))
      .filter(|action| self.deps_satisfied(action))
      .map(|action| action.node_ref.clone())
      .collect();
    for node_ref in ready {
      self.states.insert(node_ref.clone(), NodeState::Ready);
      self.ready.push_back(node_ref);
    }
  }

  fn deps_satisfied(&self, action: &PlannedAction) -> bool {
    action.input_bindings.iter().all(|binding| match binding {
      InputBinding::Edge { source_ref, .. } => {
        self.states.get(source_ref) == Some(&NodeState::Succeeded)
      }
      InputBinding::Literal { .. } => true,
    })
  }

  fn component_for(
    &self,
    node_ref: &str,
  ) -> Result<Arc<ComponentDefinition>, crate::OrchestratorError> {
    let action = self
      .plan
      .action(node_ref)
      .ok_or_else(|| crate::OrchestratorError::Internal(format!("unknown node '{node_ref}'")))?;
    self
      .inner
      .registry
      .get(&action.component_id)
      .ok_or_else(|| {
        crate::OrchestratorError::Internal(format!(
          "component '{}' vanished from the registry",
          action.component_id
        ))
      })
  }

  /// Bind inputs and launch one activation.
  async fn activate(&mut self, node_ref: String) -> Result<(), crate::OrchestratorError> {
    let action = self
      .plan
      .action(&node_ref)
      .ok_or_else(|| crate::OrchestratorError::Internal(format!("unknown node '{node_ref}'")))?
      .clone();
    let component = self.component_for(&node_ref)?;

    let resumed = self.resumed_nodes.remove(&node_ref);
    let attempt = if resumed {
      (*self.attempts.get(&node_ref).unwrap_or(&1)).max(1)
    } else {
      let next = self.attempts.get(&node_ref).copied().unwrap_or(0) + 1;
      self.attempts.insert(node_ref.clone(), next);
      next
    };

    // Bind inputs from literals and upstream outputs.
    let mut inputs = Map::new();
    for binding in &action.input_bindings {
      match binding {
        InputBinding::Literal { port_id, value } => {
          inputs.insert(port_id.clone(), value.clone());
        }
        InputBinding::Edge {
          port_id,
          source_ref,
          source_port_id,
        } => {
          let value = self
            .outputs
            .get(source_ref)
            .and_then(|outputs| outputs.get(source_port_id))
            .cloned()
            .ok_or_else(|| {
              crate::OrchestratorError::Internal(format!(
                "upstream output '{source_ref}.{source_port_id}' missing for '{node_ref}'"
              ))
            })?;
          inputs.insert(port_id.clone(), value);
        }
      }
    }
    if node_ref == self.plan.entrypoint_ref {
      inputs.insert(
        TRIGGER_PAYLOAD_INPUT.to_string(),
        self.trigger_payload.clone(),
      );
    }

    // Persist input artifacts and the attempt row before anything runs.
    let input_digest = self
      .store_io(&node_ref, &inputs, IoDirection::Input)
      .await?;
    let now = Utc::now();
    self
      .inner
      .store
      .upsert_node_execution(&NodeExecution {
        run_id: self.run_id.clone(),
        node_ref: node_ref.clone(),
        attempt: attempt as i32,
        status: NodeExecutionStatus::Running,
        started_at: Some(now),
        ended_at: None,
        error_kind: None,
        error_message: None,
        input_digest: Some(input_digest),
        output_digest: None,
        wait_token: None,
        heartbeat_at: Some(now),
      })
      .await?;

    if !resumed {
      self
        .emit(
          Some(&node_ref),
          EventKind::NodeStarted,
          json!({"attempt": attempt, "component_id": action.component_id}),
        )
        .await;
    }

    // Deterministic components may reuse cached outputs from an identical
    // prior plan.
    if component.deterministic && attempt == 1 && !resumed {
      if let Some(outputs) = self.cached_outputs(&node_ref).await? {
        info!(node_ref = %node_ref, "reusing cached outputs");
        self.states.insert(node_ref.clone(), NodeState::Running);
        self
          .handle_outcome(node_ref, attempt, Outcome::Success(Success { outputs }))
          .await?;
        return Ok(());
      }
    }

    let resume = self.resume_payloads.remove(&node_ref);
    let activation = Activation {
      run_id: self.run_id.clone(),
      node_ref: node_ref.clone(),
      component: component.clone(),
      params: action.params.clone(),
      inputs,
      attempt,
      resume,
    };

    let tool_session = if component.capabilities.is_tool_mode {
      match self.open_tool_session(&action).await {
        Ok(session) => session,
        Err(e) => {
          // Session setup failure is an activation failure, not a crash.
          let failure = Failure::new(ErrorKind::Startup, e.to_string(), true);
          self.states.insert(node_ref.clone(), NodeState::Running);
          self.handle_outcome(node_ref, attempt, Outcome::Failure(failure)).await?;
          return Ok(());
        }
      }
    } else {
      None
    };
    if let Some((session_id, _)) = &tool_session {
      self
        .sessions
        .insert((node_ref.clone(), attempt), session_id.clone());
    }

    let timeout = self
      .timeout_override
      .or(component.timeout)
      .unwrap_or(self.inner.config.default_timeout);
    let ctx = ExecutionContext {
      run_id: self.run_id.clone(),
      node_ref: node_ref.clone(),
      tenant_id: self.tenant_id.clone(),
      attempt,
      idempotency_key: format!("{}:{}:{}", self.run_id, node_ref, attempt),
      logger: EventLogger::new(self.inner.hub.clone(), &self.run_id, &node_ref),
      http: ScopedHttp::new(&self.tenant_id),
      cancel: self.cancel.child_token(),
      timeout,
      tool_session: tool_session.map(|(_, handle)| handle),
    };

    let runner = match &component.runner {
      RunnerKind::Inline => self.inner.runners.inline.clone(),
      RunnerKind::Container(_) => match &self.inner.runners.container {
        Some(runner) => runner.clone(),
        None => {
          let failure = Failure::new(
            ErrorKind::Configuration,
            "no container runner configured",
            false,
          );
          self.states.insert(node_ref.clone(), NodeState::Running);
          self.handle_outcome(node_ref, attempt, Outcome::Failure(failure)).await?;
          return Ok(());
        }
      },
    };

    self.states.insert(node_ref.clone(), NodeState::Running);

    let heartbeat = self.spawn_heartbeat(node_ref.clone(), attempt);
    self.in_flight.spawn(async move {
      let outcome = runner.run(activation, ctx).await;
      heartbeat.abort();
      (node_ref, attempt, outcome)
    });
    Ok(())
  }

  fn spawn_heartbeat(&self, node_ref: String, attempt: u32) -> tokio::task::JoinHandle<()> {
    let store = self.inner.store.clone();
    let run_id = self.run_id.clone();
    let interval = self.inner.config.heartbeat_interval;
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await; // immediate first tick
      loop {
        ticker.tick().await;
        if let Err(e) = store
          .heartbeat(&run_id, &node_ref, attempt as i32, Utc::now())
          .await
        {
          warn!(error = %e, "heartbeat write failed");
        }
      }
    })
  }

  /// Open a gateway session covering the agent's tool neighborhood.
  async fn open_tool_session(
    &self,
    action: &PlannedAction,
  ) -> Result<Option<(String, ToolSessionHandle)>, crate::OrchestratorError> {
    let (Some(gateway), Some(endpoint)) = (
      self.inner.gateway.clone(),
      self.inner.config.gateway_endpoint.clone(),
    ) else {
      return Ok(None);
    };

    if let Some(resolver) = &self.inner.tool_resolver {
      for tool_ref in &action.tool_refs {
        let tool_action = self.plan.action(tool_ref).ok_or_else(|| {
          crate::OrchestratorError::Internal(format!("tool node '{tool_ref}' not in plan"))
        })?;
        let component = self.component_for(tool_ref)?;
        let registrations = resolver
          .resolve(&self.run_id, tool_ref, &component, &tool_action.params)
          .await
          .map_err(|e| crate::OrchestratorError::Internal(e.to_string()))?;
        gateway.register_run_tools(&self.run_id, registrations).await;
      }
    }

    let handle = gateway
      .open_session(&self.run_id, &action.node_ref, action.tool_refs.clone())
      .await;
    Ok(Some((
      handle.session_id,
      ToolSessionHandle {
        endpoint,
        token: handle.token,
      },
    )))
  }

  async fn handle_outcome(
    &mut self,
    node_ref: String,
    attempt: u32,
    outcome: Outcome,
  ) -> Result<(), crate::OrchestratorError> {
    // The session is scoped to the attempt; revoke it no matter what.
    if let Some(session_id) = self.sessions.remove(&(node_ref.clone(), attempt)) {
      if let Some(gateway) = &self.inner.gateway {
        gateway.close_session(&session_id).await;
      }
    }

    match outcome {
      Outcome::Success(success) => self.handle_success(node_ref, attempt, success).await,
      Outcome::Failure(failure) => self.handle_failure(node_ref, attempt, failure).await,
      Outcome::Suspend(suspend) => {
        self
          .handle_suspend(node_ref, attempt, suspend.wait_token, suspend.payload)
          .await
      }
    }
  }

  async fn handle_success(
    &mut self,
    node_ref: String,
    attempt: u32,
    success: Success,
  ) -> Result<(), crate::OrchestratorError> {
    let output_digest = self
      .store_io(&node_ref, &success.outputs, IoDirection::Output)
      .await?;

    self
      .inner
      .store
      .upsert_node_execution(&NodeExecution {
        run_id: self.run_id.clone(),
        node_ref: node_ref.clone(),
        attempt: attempt as i32,
        status: NodeExecutionStatus::Succeeded,
        started_at: None,
        ended_at: Some(Utc::now()),
        error_kind: None,
        error_message: None,
        input_digest: None,
        output_digest: Some(output_digest),
        wait_token: None,
        heartbeat_at: None,
      })
      .await?;

    self
      .emit(
        Some(&node_ref),
        EventKind::NodeSucceeded,
        json!({"attempt": attempt, "output": success.outputs}),
      )
      .await;

    self.outputs.insert(node_ref.clone(), success.outputs);
    self.states.insert(node_ref, NodeState::Succeeded);
    if self.failing.is_none() {
      self.enqueue_ready();
    }
    Ok(())
  }

  async fn handle_failure(
    &mut self,
    node_ref: String,
    attempt: u32,
    failure: Failure,
  ) -> Result<(), crate::OrchestratorError> {
    self.record_failure(&node_ref, attempt, &failure).await?;

    // While the run is winding down, late failures never re-enter the queue.
    if self.failing.is_some() || failure.kind == ErrorKind::Cancel {
      self.states.insert(node_ref, NodeState::Skipped);
      return Ok(());
    }

    let component = self.component_for(&node_ref)?;
    let retry =
      failure.retryable && component.retry_policy.allows_retry(attempt, failure.kind);

    if retry {
      let delay = component.retry_policy.backoff(attempt, failure.kind);
      info!(
        node_ref = %node_ref,
        attempt,
        delay_ms = delay.as_millis() as u64,
        "retrying after backoff"
      );
      self.states.insert(node_ref.clone(), NodeState::Backoff);
      self.retry_timers.spawn(async move {
        tokio::time::sleep(delay).await;
        node_ref
      });
      return Ok(());
    }

    self.states.insert(node_ref.clone(), NodeState::Failed);
    self
      .begin_run_failure(format!(
        "node '{}' failed: {} ({})",
        node_ref, failure.message, failure.kind
      ))
      .await?;
    Ok(())
  }

  /// Persist one failed attempt and emit its event.
  async fn record_failure(
    &self,
    node_ref: &str,
    attempt: u32,
    failure: &Failure,
  ) -> Result<(), crate::OrchestratorError> {
    self
      .inner
      .store
      .upsert_node_execution(&NodeExecution {
        run_id: self.run_id.clone(),
        node_ref: node_ref.to_string(),
        attempt: attempt as i32,
        status: NodeExecutionStatus::Failed,
        started_at: None,
        ended_at: Some(Utc::now()),
        error_kind: Some(failure.kind.to_string()),
        error_message: Some(failure.message.clone()),
        input_digest: None,
        output_digest: None,
        wait_token: None,
        heartbeat_at: None,
      })
      .await?;

    self
      .emit(
        Some(node_ref),
        EventKind::NodeFailed,
        json!({
          "attempt": attempt,
          "kind": failure.kind,
          "message": failure.message,
          "retryable": failure.retryable,
        }),
      )
      .await;
    Ok(())
  }

  async fn handle_suspend(
    &mut self,
    node_ref: String,
    attempt: u32,
    wait_token: String,
    payload: Value,
  ) -> Result<(), crate::OrchestratorError> {
    self
      .inner
      .store
      .upsert_node_execution(&NodeExecution {
        run_id: self.run_id.clone(),
        node_ref: node_ref.clone(),
        attempt: attempt as i32,
        status: NodeExecutionStatus::Suspended,
        started_at: None,
        ended_at: None,
        error_kind: None,
        error_message: None,
        input_digest: None,
        output_digest: None,
        wait_token: Some(wait_token.clone()),
        heartbeat_at: None,
      })
      .await?;

    // Approval gates and manual forms get a durable request row with
    // single-use decision tokens.
    let mut event_payload = if payload.is_object() {
      payload.clone()
    } else {
      json!({"payload": payload})
    };
    let request_kind = if payload.get("approval").is_some() {
      Some(ApprovalKind::Approval)
    } else if payload.get("form").is_some() {
      Some(ApprovalKind::Form)
    } else {
      None
    };
    if let Some(kind) = request_kind {
      let detail = payload
        .get("approval")
        .or_else(|| payload.get("form"))
        .cloned()
        .unwrap_or(Value::Null);
      let approval = ApprovalRequest {
        id: Uuid::new_v4().to_string(),
        run_id: self.run_id.clone(),
        node_ref: node_ref.clone(),
        kind,
        title: detail
          .get("title")
          .and_then(Value::as_str)
          .unwrap_or("Approval required")
          .to_string(),
        description: detail
          .get("description")
          .and_then(Value::as_str)
          .unwrap_or_default()
          .to_string(),
        approve_token: random_token(),
        reject_token: random_token(),
        wait_token: wait_token.clone(),
        timeout_at: detail
          .get("timeout_minutes")
          .and_then(Value::as_i64)
          .map(|minutes| Utc::now() + chrono::Duration::minutes(minutes)),
        status: ApprovalStatus::Pending,
        decided_by: None,
        decided_at: None,
        context_data: Json(detail),
      };
      self.inner.store.create_approval(&approval).await?;
      event_payload["request_id"] = json!(approval.id);
      event_payload["approve_token"] = json!(approval.approve_token);
      event_payload["reject_token"] = json!(approval.reject_token);
    }
    event_payload["wait_token"] = json!(wait_token);
    event_payload["attempt"] = json!(attempt);

    self
      .emit(Some(&node_ref), EventKind::NodeSuspended, event_payload)
      .await;

    self.suspended.insert(wait_token.clone(), node_ref.clone());
    self
      .states
      .insert(node_ref, NodeState::Suspended { wait_token });
    Ok(())
  }

  async fn handle_control(&mut self, control: Control) -> Result<(), crate::OrchestratorError> {
    match control {
      Control::Resume { wait_token, payload } => {
        let Some(node_ref) = self.suspended.remove(&wait_token) else {
          warn!(wait_token = %wait_token, "resume for unknown or invalidated wait token");
          return Ok(());
        };
        self
          .emit(Some(&node_ref), EventKind::NodeResumed, payload.clone())
          .await;
        self.resume_payloads.insert(node_ref.clone(), payload);
        self.resumed_nodes.insert(node_ref.clone());
        self.states.insert(node_ref.clone(), NodeState::Ready);
        self.ready.push_back(node_ref);
        self
          .inner
          .store
          .update_run_status(&self.run_id, RunStatus::Running, None)
          .await?;
      }
      Control::Cancel { reason } => {
        info!(reason = %reason, "run cancellation requested");
        self.failing = Some(Terminal::Cancelled { reason });
        self.cancel.cancel();
        self.ready.clear();

        // Suspended nodes resolve to skipped and their wait tokens die.
        let parked: Vec<String> = self.suspended.drain().map(|(_, node)| node).collect();
        for node_ref in parked {
          self.mark_skipped(&node_ref).await?;
        }
        self.inner.store.cancel_pending_approvals(&self.run_id).await?;

        for (node_ref, state) in self.states.clone() {
          if matches!(state, NodeState::Pending | NodeState::Ready | NodeState::Backoff) {
            self.mark_skipped(&node_ref).await?;
          }
        }
        // In-flight activations got the cancel signal; give them the grace
        // period, then abandon whatever is left.
        let grace = self.inner.config.cancel_grace;
        let drained = tokio::time::timeout(grace, async {
          while let Some(result) = self.in_flight.join_next().await {
            if let Ok((node_ref, attempt, _)) = result {
              let _ = self
                .record_failure(
                  &node_ref,
                  attempt,
                  &Failure::new(ErrorKind::Cancel, "activation cancelled", false),
                )
                .await;
              self.states.insert(node_ref, NodeState::Skipped);
            }
          }
        })
        .await;
        if drained.is_err() {
          warn!("activations ignored cancellation; abandoning");
          self.in_flight.abort_all();
          for (node_ref, state) in self.states.clone() {
            if state == NodeState::Running {
              let _ = self
                .record_failure(
                  &node_ref,
                  *self.attempts.get(&node_ref).unwrap_or(&1),
                  &Failure::new(ErrorKind::CancelTimeout, "cancellation grace exceeded", false),
                )
                .await;
              self.states.insert(node_ref, NodeState::Failed);
            }
          }
        }
        self.retry_timers.abort_all();
      }
    }
    Ok(())
  }

  /// Give-up path: mark the run as failing, stop feeding the queue, skip
  /// whatever has not started.
  async fn begin_run_failure(&mut self, reason: String) -> Result<(), crate::OrchestratorError> {
    if self.failing.is_some() {
      return Ok(());
    }
    self.failing = Some(Terminal::Failed { reason });
    self.ready.clear();
    self.retry_timers.abort_all();
    self.cancel.cancel();

    let parked: Vec<String> = self.suspended.drain().map(|(_, node)| node).collect();
    for node_ref in parked {
      self.mark_skipped(&node_ref).await?;
    }
    self.inner.store.cancel_pending_approvals(&self.run_id).await?;

    for (node_ref, state) in self.states.clone() {
      if matches!(
        state,
        NodeState::Pending | NodeState::Ready | NodeState::Backoff
      ) {
        self.mark_skipped(&node_ref).await?;
      }
    }
    Ok(())
  }

  async fn mark_skipped(&mut self, node_ref: &str) -> Result<(), crate::OrchestratorError> {
    let attempt = self.attempts.get(node_ref).copied().unwrap_or(0).max(1);
    self
      .inner
      .store
      .upsert_node_execution(&NodeExecution {
        run_id: self.run_id.clone(),
        node_ref: node_ref.to_string(),
        attempt: attempt as i32,
        status: NodeExecutionStatus::Skipped,
        started_at: None,
        ended_at: Some(Utc::now()),
        error_kind: None,
        error_message: None,
        input_digest: None,
        output_digest: None,
        wait_token: None,
        heartbeat_at: None,
      })
      .await?;
    self.states.insert(node_ref.to_string(), NodeState::Skipped);
    Ok(())
  }

  /// All queues empty, nothing suspended: the run is done.
  fn assess_terminal(&self) -> Terminal {
    let failed: Vec<&String> = self
      .states
      .iter()
      .filter(|(_, state)| **state == NodeState::Failed)
      .map(|(node, _)| node)
      .collect();
    if failed.is_empty() {
      Terminal::Completed
    } else {
      Terminal::Failed {
        reason: format!("nodes failed: {:?}", failed),
      }
    }
  }

  async fn finalize(&mut self, terminal: Terminal) -> Result<(), crate::OrchestratorError> {
    let duration_ms = (Utc::now() - self.started_at).num_milliseconds().max(0);

    // Run outputs: union of exposed succeeded nodes.
    let mut exposed = Map::new();
    for action in &self.plan.actions {
      if action.expose_as_run_output {
        if let Some(outputs) = self.outputs.get(&action.node_ref) {
          exposed.insert(
            action.node_ref.clone(),
            Value::Object(outputs.clone()),
          );
        }
      }
    }

    let mut nodes = Map::new();
    for action in &self.plan.actions {
      let state = match self.states.get(&action.node_ref) {
        Some(NodeState::Succeeded) => "succeeded",
        Some(NodeState::Failed) => "failed",
        Some(NodeState::Skipped) => "skipped",
        Some(NodeState::Suspended { .. }) => "suspended",
        Some(NodeState::ToolServer) => "tool",
        _ => "incomplete",
      };
      nodes.insert(
        action.node_ref.clone(),
        json!({
          "status": state,
          "attempts": self.attempts.get(&action.node_ref).copied().unwrap_or(0),
        }),
      );
    }
    let summary = json!({"duration_ms": duration_ms, "nodes": nodes});

    let (status, kind, payload) = match &terminal {
      Terminal::Completed => (
        RunStatus::Completed,
        EventKind::RunCompleted,
        json!({"outputs": exposed, "summary": summary}),
      ),
      Terminal::Failed { reason } => (
        RunStatus::Failed,
        EventKind::RunFailed,
        json!({"status": "failed", "reason": reason, "summary": summary}),
      ),
      Terminal::Cancelled { reason } => (
        RunStatus::Cancelled,
        EventKind::RunFailed,
        json!({"status": "cancelled", "reason": reason, "summary": summary}),
      ),
    };

    self.emit(None, kind, payload).await;
    self
      .inner
      .store
      .update_run_status(&self.run_id, status, Some(Utc::now()))
      .await?;

    if let Some(gateway) = &self.inner.gateway {
      gateway.close_run(&self.run_id).await;
    }
    self.inner.hub.close_run(&self.run_id).await;
    {
      let mut controls = self.inner.controls.lock().await;
      controls.remove(&self.run_id);
    }

    info!(run_id = %self.run_id, status = ?status, "run finished");
    Ok(())
  }

  /// Persist a port-value map as content-addressed artifacts plus node I/O
  /// linkage; returns the digest of the merged object.
  async fn store_io(
    &self,
    node_ref: &str,
    values: &Map<String, Value>,
    direction: IoDirection,
  ) -> Result<String, crate::OrchestratorError> {
    for (port_id, value) in values {
      let bytes = serde_json::to_vec(value).unwrap_or_default();
      let stored = self
        .inner
        .artifacts
        .put(Bytes::from(bytes), "application/json")
        .await?;
      self
        .inner
        .store
        .put_artifact_meta(&ArtifactRow {
          digest: stored.digest.to_string(),
          media_type: stored.media_type.clone(),
          size_bytes: stored.size_bytes as i64,
          stored_at: Utc::now(),
        })
        .await?;
      self
        .inner
        .store
        .attach_node_io(&NodeIo {
          run_id: self.run_id.clone(),
          node_ref: node_ref.to_string(),
          port_id: port_id.clone(),
          direction,
          digest: stored.digest.to_string(),
        })
        .await?;
    }

    let merged = serde_json::to_vec(&Value::Object(values.clone())).unwrap_or_default();
    Ok(digest_bytes(&merged).to_string())
  }

  /// Load cached outputs for a deterministic node from an identical prior
  /// plan, if any exist.
  async fn cached_outputs(
    &self,
    node_ref: &str,
  ) -> Result<Option<Map<String, Value>>, crate::OrchestratorError> {
    let cached = self
      .inner
      .store
      .cached_outputs(&self.plan.signature, node_ref)
      .await?;
    if cached.is_empty() {
      return Ok(None);
    }

    let mut outputs = Map::new();
    for io in cached {
      let bytes = self
        .inner
        .artifacts
        .get(&cordon_artifact::Digest::from_hex(&io.digest))
        .await?;
      let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
      outputs.insert(io.port_id, value);
    }
    Ok(Some(outputs))
  }

  /// After a join error the owning task is gone; any node still marked
  /// running without a live task is retried as lost.
  async fn reconcile_running_states(&mut self) -> Result<(), crate::OrchestratorError> {
    if !self.in_flight.is_empty() {
      return Ok(());
    }
    for (node_ref, state) in self.states.clone() {
      if state == NodeState::Running {
        let attempt = self.attempts.get(&node_ref).copied().unwrap_or(1);
        let failure = Failure::new(ErrorKind::Lost, "activation task lost", true);
        self.handle_failure(node_ref, attempt, failure).await?;
      }
    }
    Ok(())
  }

  async fn emit(&self, node_ref: Option<&str>, kind: EventKind, payload: Value) {
    if let Err(e) = self
      .inner
      .hub
      .append(&self.run_id, node_ref, kind, payload)
      .await
    {
      error!(error = %e, kind = %kind, "event append failed");
    }
  }
}
