//! End-to-end orchestrator tests over an in-memory database and inline
//! components.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cordon_artifact::MemoryArtifactStore;
use cordon_events::{EventKind, EventStore, StreamHub, StreamMessage};
use cordon_orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, RunnerSet};
use cordon_registry::{
  ComponentDefinition, ComponentRegistry, DataType, ErrorKind, PortSpec, PrimitiveType,
  RetryPolicy,
};
use cordon_runner::{builtins, FnComponent, InlineRunner, Outcome, Success};
use cordon_store::{NodeExecutionStatus, RunStatus, SqliteStore, Store};
use cordon_trigger::RunRequest;
use cordon_workflow::{EdgeDef, GraphDef, NodeDef, WorkflowDef};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

struct Harness {
  orchestrator: Orchestrator,
  store: Arc<SqliteStore>,
  hub: Arc<StreamHub>,
  artifacts: Arc<MemoryArtifactStore>,
}

async fn harness(customize: impl FnOnce(&mut ComponentRegistry, &mut InlineRunner)) -> Harness {
  let pool = SqlitePoolOptions::new()
    .max_connections(1)
    .connect("sqlite::memory:")
    .await
    .expect("open sqlite");
  let store = Arc::new(SqliteStore::new(pool));
  store.migrate().await.expect("migrations");

  let event_store: Arc<dyn EventStore> = store.clone();
  let hub = Arc::new(StreamHub::new(event_store));
  let artifacts = Arc::new(MemoryArtifactStore::new());

  let mut registry = ComponentRegistry::new();
  for def in builtins::definitions() {
    registry.register(def).unwrap();
  }
  let mut runner = InlineRunner::new();
  builtins::bind_all(&mut runner);

  customize(&mut registry, &mut runner);
  registry.seal();

  let config = OrchestratorConfig {
    heartbeat_interval: Duration::from_millis(200),
    default_timeout: Duration::from_secs(10),
    ..OrchestratorConfig::default()
  };

  let orchestrator = Orchestrator::new(
    Arc::new(registry),
    store.clone(),
    hub.clone(),
    artifacts.clone(),
    RunnerSet {
      inline: Arc::new(runner),
      container: None,
    },
    None,
    None,
    config,
  );

  Harness {
    orchestrator,
    store,
    hub,
    artifacts,
  }
}

fn double_component() -> ComponentDefinition {
  let mut def = ComponentDefinition::inline("test.double", "1.0.0");
  def.inputs = vec![PortSpec::required(
    "input",
    DataType::primitive(PrimitiveType::Json),
  )];
  def.outputs = vec![PortSpec::required(
    "output",
    DataType::primitive(PrimitiveType::Json),
  )];
  def
}

fn bind_double(runner: &mut InlineRunner) {
  runner.bind(
    "test.double",
    Arc::new(FnComponent::new(|inputs, _, _| async move {
      let x = inputs
        .get("input")
        .and_then(|v| v.get("x"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
      Outcome::Success(Success::single("output", json!({"x": x * 2})))
    })),
  );
}

fn node(id: &str, component: &str, params: serde_json::Value) -> NodeDef {
  NodeDef {
    id: id.to_string(),
    component_ref: component.to_string(),
    params: params.as_object().cloned().unwrap_or_default(),
    position: None,
    expose_as_run_output: false,
  }
}

fn edge(id: &str, source: &str, target: &str, target_handle: &str) -> EdgeDef {
  EdgeDef {
    id: id.to_string(),
    source: source.to_string(),
    target: target.to_string(),
    source_handle: None,
    target_handle: Some(target_handle.to_string()),
  }
}

fn workflow(id: &str, nodes: Vec<NodeDef>, edges: Vec<EdgeDef>) -> WorkflowDef {
  WorkflowDef {
    id: id.to_string(),
    name: id.to_string(),
    description: String::new(),
    version: 1,
    graph: GraphDef {
      nodes,
      edges,
      viewport: None,
    },
  }
}

/// Collect event kinds until the run terminates.
async fn collect_until_terminal(hub: &StreamHub, run_id: &str) -> Vec<cordon_events::Event> {
  let mut stream = hub.subscribe(run_id, 0).await.unwrap();
  let mut events = Vec::new();
  loop {
    let message = tokio::time::timeout(Duration::from_secs(15), stream.next())
      .await
      .expect("stream stalled");
    match message {
      Some(StreamMessage::Event(event)) => {
        let terminal = event.kind.is_run_terminal();
        events.push(event);
        if terminal {
          return events;
        }
      }
      Some(StreamMessage::Overrun) => panic!("unexpected overrun"),
      None => return events,
    }
  }
}

#[tokio::test]
async fn linear_two_node_run_completes_with_expected_events() {
  let h = harness(|registry, runner| {
    registry.register(double_component()).unwrap();
    bind_double(runner);
  })
  .await;

  let mut wf = workflow(
    "wf-linear",
    vec![
      node("start", "core.trigger.manual", json!({})),
      node("double", "test.double", json!({})),
    ],
    vec![edge("e1", "start", "double", "input")],
  );
  wf.graph.nodes[1].expose_as_run_output = true;

  h.orchestrator
    .register_workflow(&wf, "tenant-1")
    .await
    .unwrap();
  let run_id = h
    .orchestrator
    .submit(RunRequest::manual("wf-linear", "tenant-1", json!({"x": 21})))
    .await
    .unwrap();

  let events = collect_until_terminal(&h.hub, &run_id).await;
  let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
  assert_eq!(
    kinds,
    vec![
      EventKind::RunStarted,
      EventKind::NodeStarted,
      EventKind::NodeSucceeded,
      EventKind::NodeStarted,
      EventKind::NodeSucceeded,
      EventKind::RunCompleted,
    ]
  );

  // A's output is the runtime input; B doubles it.
  assert_eq!(events[2].payload["output"]["payload"], json!({"x": 21}));
  assert_eq!(events[4].payload["output"]["output"], json!({"x": 42}));
  // The terminal event exposes the flagged node's outputs.
  assert_eq!(
    events[5].payload["outputs"]["double"]["output"],
    json!({"x": 42})
  );

  let run = h.store.get_run(&run_id).await.unwrap();
  assert_eq!(run.status, RunStatus::Completed);

  let io = h.orchestrator.get_node_io(&run_id, "double").await.unwrap();
  assert_eq!(io.outputs["output"], json!({"x": 42}));
  assert_eq!(io.inputs["input"], json!({"x": 21}));
}

#[tokio::test]
async fn retry_then_succeed_applies_backoff() {
  let attempts = Arc::new(AtomicU32::new(0));
  let attempts_in_component = attempts.clone();

  let h = harness(move |registry, runner| {
    let mut def = ComponentDefinition::inline("test.flaky", "1.0.0");
    def.inputs = vec![PortSpec::optional("input", DataType::Any)];
    def.outputs = vec![PortSpec::required(
      "output",
      DataType::primitive(PrimitiveType::Json),
    )];
    def.retry_policy = RetryPolicy {
      max_attempts: 5,
      initial_backoff: Duration::from_millis(50),
      max_backoff: Duration::from_secs(1),
      multiplier: 2.0,
      non_retryable_kinds: Vec::new(),
    };
    registry.register(def).unwrap();

    runner.bind(
      "test.flaky",
      Arc::new(FnComponent::new(move |_, _, _| {
        let attempts = attempts_in_component.clone();
        async move {
          let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
          if n < 3 {
            Outcome::failure(ErrorKind::Network, "connection reset", true)
          } else {
            Outcome::Success(Success::single("output", json!({"ok": true})))
          }
        }
      })),
    );
  })
  .await;

  let wf = workflow(
    "wf-flaky",
    vec![
      node("start", "core.trigger.manual", json!({})),
      node("scan", "test.flaky", json!({})),
    ],
    vec![edge("e1", "start", "scan", "input")],
  );
  h.orchestrator
    .register_workflow(&wf, "tenant-1")
    .await
    .unwrap();

  let started = std::time::Instant::now();
  let run_id = h
    .orchestrator
    .submit(RunRequest::manual("wf-flaky", "tenant-1", json!({})))
    .await
    .unwrap();

  let events = collect_until_terminal(&h.hub, &run_id).await;
  let scan_kinds: Vec<EventKind> = events
    .iter()
    .filter(|e| e.node_ref.as_deref() == Some("scan"))
    .map(|e| e.kind)
    .collect();
  assert_eq!(
    scan_kinds,
    vec![
      EventKind::NodeStarted,
      EventKind::NodeFailed,
      EventKind::NodeStarted,
      EventKind::NodeFailed,
      EventKind::NodeStarted,
      EventKind::NodeSucceeded,
    ]
  );

  // Backoff: ~50ms then ~100ms between attempts.
  assert!(started.elapsed() >= Duration::from_millis(150));
  assert_eq!(attempts.load(Ordering::SeqCst), 3);
  assert_eq!(
    h.store.get_run(&run_id).await.unwrap().status,
    RunStatus::Completed
  );
}

#[tokio::test]
async fn failing_every_attempt_gives_up_at_max_attempts() {
  let h = harness(|registry, runner| {
    let mut def = ComponentDefinition::inline("test.broken", "1.0.0");
    def.inputs = vec![PortSpec::optional("input", DataType::Any)];
    def.outputs = vec![PortSpec::optional("output", DataType::Any)];
    def.retry_policy = RetryPolicy {
      max_attempts: 3,
      initial_backoff: Duration::from_millis(10),
      max_backoff: Duration::from_millis(100),
      multiplier: 2.0,
      non_retryable_kinds: Vec::new(),
    };
    registry.register(def).unwrap();
    runner.bind(
      "test.broken",
      Arc::new(FnComponent::new(|_, _, _| async {
        Outcome::failure(ErrorKind::Network, "always down", true)
      })),
    );
  })
  .await;

  let wf = workflow(
    "wf-broken",
    vec![
      node("start", "core.trigger.manual", json!({})),
      node("scan", "test.broken", json!({})),
      node("after", "test.broken", json!({})),
    ],
    vec![
      edge("e1", "start", "scan", "input"),
      edge("e2", "scan", "after", "input"),
    ],
  );
  h.orchestrator
    .register_workflow(&wf, "tenant-1")
    .await
    .unwrap();
  let run_id = h
    .orchestrator
    .submit(RunRequest::manual("wf-broken", "tenant-1", json!({})))
    .await
    .unwrap();

  let events = collect_until_terminal(&h.hub, &run_id).await;
  let failed_count = events
    .iter()
    .filter(|e| e.kind == EventKind::NodeFailed && e.node_ref.as_deref() == Some("scan"))
    .count();
  assert_eq!(failed_count, 3);
  assert_eq!(events.last().unwrap().kind, EventKind::RunFailed);

  // Downstream never started; it is skipped in storage.
  let executions = h.store.list_node_executions(&run_id).await.unwrap();
  let after = executions
    .iter()
    .find(|e| e.node_ref == "after")
    .expect("skipped row");
  assert_eq!(after.status, NodeExecutionStatus::Skipped);
  assert_eq!(
    h.store.get_run(&run_id).await.unwrap().status,
    RunStatus::Failed
  );
}

#[tokio::test]
async fn approval_gate_suspends_resumes_and_tokens_are_single_use() {
  let h = harness(|registry, runner| {
    registry.register(double_component()).unwrap();
    bind_double(runner);
  })
  .await;

  let wf = workflow(
    "wf-gate",
    vec![
      node("start", "core.trigger.manual", json!({})),
      node("gate", "core.gate.approval", json!({"title": "Proceed?"})),
      node("double", "test.double", json!({})),
    ],
    vec![
      edge("e1", "start", "gate", "input"),
      edge("e2", "gate", "double", "input"),
    ],
  );
  h.orchestrator
    .register_workflow(&wf, "tenant-1")
    .await
    .unwrap();
  let run_id = h
    .orchestrator
    .submit(RunRequest::manual("wf-gate", "tenant-1", json!({"x": 5})))
    .await
    .unwrap();

  // Wait for the suspension and read the emitted approve token.
  let mut stream = h.hub.subscribe(&run_id, 0).await.unwrap();
  let approve_token = loop {
    match tokio::time::timeout(Duration::from_secs(15), stream.next())
      .await
      .expect("stream stalled")
    {
      Some(StreamMessage::Event(event)) if event.kind == EventKind::NodeSuspended => {
        break event.payload["approve_token"].as_str().unwrap().to_string();
      }
      Some(_) => continue,
      None => panic!("stream ended before suspension"),
    }
  };

  h.orchestrator
    .decide_approval(&approve_token, "approve", Some("alice"), None)
    .await
    .unwrap();

  let events = collect_until_terminal(&h.hub, &run_id).await;
  let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
  assert_eq!(
    kinds,
    vec![
      EventKind::RunStarted,
      EventKind::NodeStarted,     // start
      EventKind::NodeSucceeded,   // start
      EventKind::NodeStarted,     // gate (first activation)
      EventKind::NodeLogged,      // "waiting for approval"
      EventKind::NodeSuspended,   // gate parks
      EventKind::NodeResumed,     // decision arrives
      EventKind::NodeSucceeded,   // gate passes through
      EventKind::NodeStarted,     // double
      EventKind::NodeSucceeded,   // double
      EventKind::RunCompleted,
    ]
  );

  // The gate forwarded its input; downstream doubled it.
  let io = h.orchestrator.get_node_io(&run_id, "double").await.unwrap();
  assert_eq!(io.outputs["output"], json!({"x": 10}));

  // Re-deciding with the used token fails.
  let err = h
    .orchestrator
    .decide_approval(&approve_token, "approve", Some("bob"), None)
    .await
    .unwrap_err();
  assert!(matches!(err, OrchestratorError::ApprovalAlreadyDecided));
}

#[tokio::test]
async fn cancelling_a_suspended_run_invalidates_wait_tokens() {
  let h = harness(|_, _| {}).await;

  let wf = workflow(
    "wf-cancel",
    vec![
      node("start", "core.trigger.manual", json!({})),
      node("gate", "core.gate.approval", json!({"title": "Proceed?"})),
    ],
    vec![edge("e1", "start", "gate", "input")],
  );
  h.orchestrator
    .register_workflow(&wf, "tenant-1")
    .await
    .unwrap();
  let run_id = h
    .orchestrator
    .submit(RunRequest::manual("wf-cancel", "tenant-1", json!({})))
    .await
    .unwrap();

  let mut stream = h.hub.subscribe(&run_id, 0).await.unwrap();
  let approve_token = loop {
    match tokio::time::timeout(Duration::from_secs(15), stream.next())
      .await
      .expect("stream stalled")
    {
      Some(StreamMessage::Event(event)) if event.kind == EventKind::NodeSuspended => {
        break event.payload["approve_token"].as_str().unwrap().to_string();
      }
      Some(_) => continue,
      None => panic!("stream ended before suspension"),
    }
  };

  h.orchestrator.cancel(&run_id, "operator abort").await.unwrap();

  // Wait for the terminal state.
  loop {
    match tokio::time::timeout(Duration::from_secs(15), stream.next())
      .await
      .expect("stream stalled")
    {
      Some(StreamMessage::Event(event)) if event.kind == EventKind::RunFailed => break,
      Some(_) => continue,
      None => break,
    }
  }

  assert_eq!(
    h.store.get_run(&run_id).await.unwrap().status,
    RunStatus::Cancelled
  );
  let executions = h.store.list_node_executions(&run_id).await.unwrap();
  let gate = executions.iter().find(|e| e.node_ref == "gate").unwrap();
  assert_eq!(gate.status, NodeExecutionStatus::Skipped);

  // The wait token died with the cancellation.
  let err = h
    .orchestrator
    .decide_approval(&approve_token, "approve", None, None)
    .await
    .unwrap_err();
  assert!(matches!(err, OrchestratorError::ApprovalNotFound));
}

#[tokio::test]
async fn submissions_are_idempotent_on_key() {
  let h = harness(|registry, runner| {
    registry.register(double_component()).unwrap();
    bind_double(runner);
  })
  .await;

  let wf = workflow(
    "wf-idem",
    vec![node("start", "core.trigger.manual", json!({}))],
    vec![],
  );
  h.orchestrator
    .register_workflow(&wf, "tenant-1")
    .await
    .unwrap();

  let request = RunRequest::manual("wf-idem", "tenant-1", json!({}))
    .with_idempotency_key("submit-once");
  let first = h.orchestrator.submit(request.clone()).await.unwrap();
  let second = h.orchestrator.submit(request).await.unwrap();
  assert_eq!(first, second);
}

#[tokio::test]
async fn validation_failures_reject_submission() {
  let h = harness(|_, _| {}).await;

  // No trigger node at all.
  let wf = workflow(
    "wf-invalid",
    vec![node("gate", "core.gate.approval", json!({"title": "t"}))],
    vec![],
  );
  h.orchestrator
    .register_workflow(&wf, "tenant-1")
    .await
    .unwrap();

  let err = h
    .orchestrator
    .submit(RunRequest::manual("wf-invalid", "tenant-1", json!({})))
    .await
    .unwrap_err();
  assert!(matches!(err, OrchestratorError::Validation { .. }));
}

#[tokio::test]
async fn stale_running_attempt_recovers_as_lost_and_retries() {
  use chrono::{Duration as ChronoDuration, Utc};
  use cordon_artifact::ArtifactStore;
  use cordon_store::{ArtifactRow, IoDirection, Json, NodeExecution, NodeIo, Run};

  let h = harness(|registry, runner| {
    registry.register(double_component()).unwrap();
    bind_double(runner);
  })
  .await;

  let wf = workflow(
    "wf-recover",
    vec![
      node("start", "core.trigger.manual", json!({})),
      node("double", "test.double", json!({})),
    ],
    vec![edge("e1", "start", "double", "input")],
  );
  h.orchestrator
    .register_workflow(&wf, "tenant-1")
    .await
    .unwrap();

  // Compile the same plan the orchestrator would have, using an identical
  // registry, and persist the state a crashed worker leaves behind: trigger
  // succeeded, "double" running with a stale heartbeat.
  let mut registry = ComponentRegistry::new();
  for def in builtins::definitions() {
    registry.register(def).unwrap();
  }
  registry.register(double_component()).unwrap();
  registry.seal();
  let plan = cordon_plan::compile(&wf, &registry).unwrap();

  let run_id = "run-recover".to_string();
  h.store
    .create_run(&Run {
      id: run_id.clone(),
      workflow_id: "wf-recover".to_string(),
      tenant_id: "tenant-1".to_string(),
      plan_signature: plan.signature.clone(),
      plan: Json(serde_json::to_value(&plan).unwrap()),
      status: RunStatus::Running,
      trigger_kind: "manual".to_string(),
      trigger_payload: Json(json!({"x": 4})),
      idempotency_key: None,
      started_at: Utc::now() - ChronoDuration::minutes(5),
      ended_at: None,
    })
    .await
    .unwrap();

  // Trigger output artifact + linkage, so recovery can rebind downstream.
  let stored = h
    .artifacts
    .put(serde_json::to_vec(&json!({"x": 4})).unwrap().into(), "application/json")
    .await
    .unwrap();
  h.store
    .put_artifact_meta(&ArtifactRow {
      digest: stored.digest.to_string(),
      media_type: "application/json".to_string(),
      size_bytes: stored.size_bytes as i64,
      stored_at: Utc::now(),
    })
    .await
    .unwrap();
  h.store
    .attach_node_io(&NodeIo {
      run_id: run_id.clone(),
      node_ref: "start".to_string(),
      port_id: "payload".to_string(),
      direction: IoDirection::Output,
      digest: stored.digest.to_string(),
    })
    .await
    .unwrap();

  let stale = Utc::now() - ChronoDuration::minutes(5);
  h.store
    .upsert_node_execution(&NodeExecution {
      run_id: run_id.clone(),
      node_ref: "start".to_string(),
      attempt: 1,
      status: NodeExecutionStatus::Succeeded,
      started_at: Some(stale),
      ended_at: Some(stale),
      error_kind: None,
      error_message: None,
      input_digest: None,
      output_digest: Some(stored.digest.to_string()),
      wait_token: None,
      heartbeat_at: None,
    })
    .await
    .unwrap();
  h.store
    .upsert_node_execution(&NodeExecution {
      run_id: run_id.clone(),
      node_ref: "double".to_string(),
      attempt: 1,
      status: NodeExecutionStatus::Running,
      started_at: Some(stale),
      ended_at: None,
      error_kind: None,
      error_message: None,
      input_digest: None,
      output_digest: None,
      wait_token: None,
      heartbeat_at: Some(stale),
    })
    .await
    .unwrap();

  let recovered = h.orchestrator.recover().await.unwrap();
  assert_eq!(recovered, 1);

  let events = collect_until_terminal(&h.hub, &run_id).await;
  let double_events: Vec<(EventKind, u64)> = events
    .iter()
    .filter(|e| e.node_ref.as_deref() == Some("double"))
    .map(|e| (e.kind, e.payload["attempt"].as_u64().unwrap_or(0)))
    .collect();

  // The stale attempt dies as lost, then retries and succeeds.
  assert_eq!(double_events[0], (EventKind::NodeFailed, 1));
  assert_eq!(events[0].payload["kind"], "lost");
  assert_eq!(double_events[1], (EventKind::NodeStarted, 2));
  assert_eq!(double_events[2], (EventKind::NodeSucceeded, 2));

  assert_eq!(
    h.store.get_run(&run_id).await.unwrap().status,
    RunStatus::Completed
  );
  let io = h.orchestrator.get_node_io(&run_id, "double").await.unwrap();
  assert_eq!(io.outputs["output"], json!({"x": 8}));
}

#[tokio::test]
async fn event_replay_from_zero_is_gapless_and_terminal() {
  let h = harness(|registry, runner| {
    registry.register(double_component()).unwrap();
    bind_double(runner);
  })
  .await;

  let wf = workflow(
    "wf-replay",
    vec![
      node("start", "core.trigger.manual", json!({})),
      node("double", "test.double", json!({})),
    ],
    vec![edge("e1", "start", "double", "input")],
  );
  h.orchestrator
    .register_workflow(&wf, "tenant-1")
    .await
    .unwrap();
  let run_id = h
    .orchestrator
    .submit(RunRequest::manual("wf-replay", "tenant-1", json!({"x": 1})))
    .await
    .unwrap();
  let live = collect_until_terminal(&h.hub, &run_id).await;

  // A fresh subscription replays the identical, gapless sequence.
  let mut replay = h.hub.subscribe(&run_id, 0).await.unwrap();
  let mut replayed = Vec::new();
  for _ in 0..live.len() {
    match replay.next().await {
      Some(StreamMessage::Event(event)) => replayed.push(event),
      other => panic!("unexpected message: {other:?}"),
    }
  }

  assert_eq!(live, replayed);
  for (i, event) in replayed.iter().enumerate() {
    assert_eq!(event.sequence, (i + 1) as u64);
  }
  assert!(replayed.last().unwrap().kind.is_run_terminal());
}
