//! Built-in inline components: triggers, HTTP request, field mapping,
//! approval gate, manual form, and the tool-mode agent shim.
//!
//! Definitions and implementations are registered together by the binary at
//! startup; tests bind the pieces they need.

use std::sync::Arc;

use async_trait::async_trait;
use cordon_registry::{
  Capabilities, ComponentDefinition, ConnectionType, DataType, ErrorKind, ParamKind, ParamSpec,
  PortSpec, PrimitiveType, RetryPolicy,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::component::InlineComponent;
use crate::context::ExecutionContext;
use crate::outcome::{Failure, Outcome, Success, Suspend};
use crate::runner::InlineRunner;

/// Input key carrying the resume payload into a re-activated component.
pub const RESUME_INPUT: &str = "__resume";

/// Input key the orchestrator uses to hand the trigger payload to the
/// entrypoint activation.
pub const TRIGGER_PAYLOAD_INPUT: &str = "payload";

/// All built-in component definitions, for seeding the registry.
pub fn definitions() -> Vec<ComponentDefinition> {
  vec![
    manual_trigger_def(),
    schedule_trigger_def(),
    webhook_trigger_def(),
    http_request_def(),
    transform_map_def(),
    approval_gate_def(),
    manual_form_def(),
    agent_tools_def(),
  ]
}

/// Bind every built-in implementation into an inline runner.
pub fn bind_all(runner: &mut InlineRunner) {
  runner.bind("core.trigger.manual", Arc::new(TriggerComponent));
  runner.bind("core.trigger.schedule", Arc::new(TriggerComponent));
  runner.bind("core.trigger.webhook", Arc::new(TriggerComponent));
  runner.bind("core.http.request", Arc::new(HttpRequestComponent));
  runner.bind("core.transform.map", Arc::new(TransformMapComponent));
  runner.bind("core.gate.approval", Arc::new(ApprovalGateComponent));
  runner.bind("core.form.manual", Arc::new(ManualFormComponent));
  runner.bind("core.agent.tools", Arc::new(AgentToolsComponent));
}

fn trigger_def(id: &str) -> ComponentDefinition {
  let mut def = ComponentDefinition::inline(id, "1.0.0");
  def.capabilities = Capabilities {
    is_trigger: true,
    ..Capabilities::default()
  };
  def.outputs = vec![PortSpec::required(
    "payload",
    DataType::primitive(PrimitiveType::Json),
  )];
  def.retry_policy = RetryPolicy::none();
  def
}

fn manual_trigger_def() -> ComponentDefinition {
  trigger_def("core.trigger.manual")
}

fn schedule_trigger_def() -> ComponentDefinition {
  trigger_def("core.trigger.schedule")
}

fn webhook_trigger_def() -> ComponentDefinition {
  trigger_def("core.trigger.webhook")
}

fn http_request_def() -> ComponentDefinition {
  let mut def = ComponentDefinition::inline("core.http.request", "1.0.0");
  def.inputs = vec![PortSpec::optional(
    "body",
    DataType::primitive(PrimitiveType::Json),
  )];
  def.outputs = vec![PortSpec::required(
    "response",
    DataType::primitive(PrimitiveType::Json),
  )];
  def.parameters = vec![
    ParamSpec::new("url", "URL", ParamKind::Text).required(),
    ParamSpec::new(
      "method",
      "Method",
      ParamKind::Select {
        options: ["GET", "POST", "PUT", "PATCH", "DELETE"]
          .iter()
          .map(|s| s.to_string())
          .collect(),
      },
    ),
    ParamSpec::new("headers", "Headers", ParamKind::Json),
  ];
  def
}

fn transform_map_def() -> ComponentDefinition {
  let mut def = ComponentDefinition::inline("core.transform.map", "1.0.0");
  def.inputs = vec![PortSpec::required("input", DataType::Any)];
  def.outputs = vec![PortSpec::required(
    "output",
    DataType::primitive(PrimitiveType::Json),
  )];
  def.parameters = vec![ParamSpec::new("mapping", "Field mapping", ParamKind::Json).required()];
  def.deterministic = true;
  def
}

fn approval_gate_def() -> ComponentDefinition {
  let mut def = ComponentDefinition::inline("core.gate.approval", "1.0.0");
  def.inputs = vec![PortSpec::optional("input", DataType::Any)];
  def.outputs = vec![
    PortSpec::required("output", DataType::Any),
    PortSpec::optional("decision", DataType::primitive(PrimitiveType::Json)),
  ];
  def.parameters = vec![
    ParamSpec::new("title", "Title", ParamKind::Text).required(),
    ParamSpec::new("description", "Description", ParamKind::Text),
    ParamSpec::new("timeout_minutes", "Timeout (minutes)", ParamKind::Number),
  ];
  def.retry_policy = RetryPolicy::none();
  def
}

fn manual_form_def() -> ComponentDefinition {
  let mut def = ComponentDefinition::inline("core.form.manual", "1.0.0");
  def.inputs = vec![PortSpec::optional("input", DataType::Any)];
  def.outputs = vec![PortSpec::required(
    "output",
    DataType::primitive(PrimitiveType::Json),
  )];
  def.parameters = vec![
    ParamSpec::new("title", "Title", ParamKind::Text).required(),
    ParamSpec::new("form", "Form fields", ParamKind::Json).required(),
  ];
  def.retry_policy = RetryPolicy::none();
  def
}

fn agent_tools_def() -> ComponentDefinition {
  let mut def = ComponentDefinition::inline("core.agent.tools", "1.0.0");
  def.inputs = vec![
    PortSpec::optional("input", DataType::Any),
    PortSpec {
      id: "tools".to_string(),
      data_type: DataType::Any,
      required: false,
      allow_any: true,
      connection_type: ConnectionType::Tool,
    },
  ];
  def.outputs = vec![PortSpec::required(
    "result",
    DataType::primitive(PrimitiveType::Json),
  )];
  def.parameters = vec![ParamSpec::new("objective", "Objective", ParamKind::Text).required()];
  def
}

/// Triggers echo the runtime payload the orchestrator binds to them.
struct TriggerComponent;

#[async_trait]
impl InlineComponent for TriggerComponent {
  async fn execute(&self, inputs: Map<String, Value>, params: Map<String, Value>, _ctx: ExecutionContext) -> Outcome {
    let payload = inputs
      .get(TRIGGER_PAYLOAD_INPUT)
      .cloned()
      .unwrap_or_else(|| Value::Object(params));
    Outcome::Success(Success::single("payload", payload))
  }
}

/// Tenant-scoped HTTP call through the context's fetch helper.
struct HttpRequestComponent;

#[async_trait]
impl InlineComponent for HttpRequestComponent {
  async fn execute(&self, inputs: Map<String, Value>, params: Map<String, Value>, ctx: ExecutionContext) -> Outcome {
    let Some(url) = params.get("url").and_then(Value::as_str) else {
      return Outcome::failure(ErrorKind::Configuration, "missing 'url' parameter", false);
    };
    let method = params
      .get("method")
      .and_then(Value::as_str)
      .unwrap_or("GET");
    let headers = params
      .get("headers")
      .and_then(Value::as_object)
      .cloned()
      .unwrap_or_default();
    let body = inputs.get("body").or_else(|| params.get("body"));

    match ctx
      .http
      .fetch_json(method, url, &headers, body, ctx.timeout)
      .await
    {
      Ok((status, body)) => Outcome::Success(Success::single(
        "response",
        json!({"status": status, "body": body}),
      )),
      Err(failure) => Outcome::Failure(failure.into()),
    }
  }
}

/// Pure field mapping: `mapping` is `{out_key: "dotted.path"}` resolved
/// against the merged input object; a value starting with `=` is a literal.
struct TransformMapComponent;

#[async_trait]
impl InlineComponent for TransformMapComponent {
  async fn execute(&self, inputs: Map<String, Value>, params: Map<String, Value>, _ctx: ExecutionContext) -> Outcome {
    let Some(mapping) = params.get("mapping").and_then(Value::as_object) else {
      return Outcome::failure(ErrorKind::Configuration, "missing 'mapping' parameter", false);
    };

    let scope = Value::Object(inputs);
    let mut out = Map::new();
    for (key, path) in mapping {
      let value = match path.as_str() {
        Some(path) if path.starts_with('=') => Value::String(path[1..].to_string()),
        Some(path) => lookup_path(&scope, path).unwrap_or(Value::Null),
        None => path.clone(),
      };
      out.insert(key.clone(), value);
    }

    Outcome::Success(Success::single("output", Value::Object(out)))
  }
}

/// Walk a dotted path (`input.host.port`) through a JSON value.
fn lookup_path(scope: &Value, path: &str) -> Option<Value> {
  let mut current = scope;
  for segment in path.split('.') {
    current = match current {
      Value::Object(map) => map.get(segment)?,
      Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
      _ => return None,
    };
  }
  Some(current.clone())
}

/// Human approval gate. First activation suspends with a wait token; the
/// resumed activation turns the decision into success or a terminal failure.
struct ApprovalGateComponent;

#[async_trait]
impl InlineComponent for ApprovalGateComponent {
  async fn execute(&self, inputs: Map<String, Value>, params: Map<String, Value>, ctx: ExecutionContext) -> Outcome {
    let input = inputs.get("input").cloned().unwrap_or(Value::Null);

    if let Some(resume) = inputs.get(RESUME_INPUT) {
      let approved = resume
        .get("decision")
        .and_then(Value::as_str)
        .map(|d| d == "approve")
        .unwrap_or(false);
      if approved {
        let mut outputs = Map::new();
        outputs.insert("output".to_string(), input);
        outputs.insert("decision".to_string(), resume.clone());
        return Outcome::Success(Success { outputs });
      }
      return Outcome::Failure(Failure::new(
        ErrorKind::Cancel,
        "approval rejected",
        false,
      ));
    }

    ctx.logger.info("waiting for approval").await;
    Outcome::Suspend(Suspend {
      wait_token: Uuid::new_v4().to_string(),
      payload: json!({
        "approval": {
          "title": params.get("title").cloned().unwrap_or(Value::Null),
          "description": params.get("description").cloned().unwrap_or(Value::Null),
          "timeout_minutes": params.get("timeout_minutes").cloned().unwrap_or(Value::Null),
          "context": input,
        }
      }),
    })
  }
}

/// Manual form node: suspends until a response is submitted for it.
struct ManualFormComponent;

#[async_trait]
impl InlineComponent for ManualFormComponent {
  async fn execute(&self, inputs: Map<String, Value>, params: Map<String, Value>, _ctx: ExecutionContext) -> Outcome {
    if let Some(resume) = inputs.get(RESUME_INPUT) {
      let submitted = resume.get("payload").cloned().unwrap_or(Value::Null);
      return Outcome::Success(Success::single("output", submitted));
    }

    Outcome::Suspend(Suspend {
      wait_token: Uuid::new_v4().to_string(),
      payload: json!({
        "form": {
          "title": params.get("title").cloned().unwrap_or(Value::Null),
          "fields": params.get("form").cloned().unwrap_or(Value::Null),
          "context": inputs.get("input").cloned().unwrap_or(Value::Null),
        }
      }),
    })
  }
}

/// Tool-mode agent shim: lists the tools its session exposes and reports
/// them alongside the objective. The session token only lives for this
/// attempt; everything goes through the gateway.
struct AgentToolsComponent;

#[async_trait]
impl InlineComponent for AgentToolsComponent {
  async fn execute(&self, inputs: Map<String, Value>, params: Map<String, Value>, ctx: ExecutionContext) -> Outcome {
    let Some(session) = ctx.tool_session.clone() else {
      return Outcome::failure(
        ErrorKind::Configuration,
        "agent activated without a tool session",
        false,
      );
    };

    let request = json!({
      "jsonrpc": "2.0",
      "id": 1,
      "method": "tools/list",
      "params": {},
    });
    let mut headers = Map::new();
    headers.insert(
      "authorization".to_string(),
      Value::String(format!("Bearer {}", session.token)),
    );

    let response = match ctx
      .http
      .fetch_json("POST", &session.endpoint, &headers, Some(&request), ctx.timeout)
      .await
    {
      Ok((_, body)) => body,
      Err(failure) => return Outcome::Failure(failure.into()),
    };

    let tools = response
      .get("result")
      .and_then(|r| r.get("tools"))
      .cloned()
      .unwrap_or_else(|| json!([]));

    Outcome::Success(Success::single(
      "result",
      json!({
        "objective": params.get("objective").cloned().unwrap_or(Value::Null),
        "input": inputs.get("input").cloned().unwrap_or(Value::Null),
        "tools": tools,
      }),
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::context::EventLogger;
  use crate::http::ScopedHttp;
  use cordon_events::{MemoryEventStore, StreamHub};
  use std::time::Duration;
  use tokio_util::sync::CancellationToken;

  fn ctx() -> ExecutionContext {
    let hub = Arc::new(StreamHub::new(Arc::new(MemoryEventStore::new())));
    ExecutionContext {
      run_id: "run-1".to_string(),
      node_ref: "node-1".to_string(),
      tenant_id: "tenant-1".to_string(),
      attempt: 1,
      idempotency_key: "run-1:node-1:1".to_string(),
      logger: EventLogger::new(hub, "run-1", "node-1"),
      http: ScopedHttp::new("tenant-1"),
      cancel: CancellationToken::new(),
      timeout: Duration::from_secs(5),
      tool_session: None,
    }
  }

  fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
  }

  #[tokio::test]
  async fn trigger_echoes_runtime_payload() {
    let outcome = TriggerComponent
      .execute(obj(json!({"payload": {"x": 21}})), Map::new(), ctx())
      .await;
    let Outcome::Success(success) = outcome else {
      panic!("expected success");
    };
    assert_eq!(success.outputs["payload"], json!({"x": 21}));
  }

  #[tokio::test]
  async fn transform_maps_dotted_paths_and_literals() {
    let outcome = TransformMapComponent
      .execute(
        obj(json!({"input": {"host": {"name": "db-1", "port": 5432}}})),
        obj(json!({"mapping": {
          "asset": "input.host.name",
          "port": "input.host.port",
          "source": "=nmap",
        }})),
        ctx(),
      )
      .await;

    let Outcome::Success(success) = outcome else {
      panic!("expected success");
    };
    assert_eq!(success.outputs["output"]["asset"], "db-1");
    assert_eq!(success.outputs["output"]["port"], 5432);
    assert_eq!(success.outputs["output"]["source"], "nmap");
  }

  #[tokio::test]
  async fn approval_gate_suspends_then_approves() {
    let first = ApprovalGateComponent
      .execute(
        obj(json!({"input": {"target": "10.0.0.5"}})),
        obj(json!({"title": "Run exploit?"})),
        ctx(),
      )
      .await;

    let Outcome::Suspend(suspend) = first else {
      panic!("expected suspension");
    };
    assert!(!suspend.wait_token.is_empty());
    assert_eq!(suspend.payload["approval"]["title"], "Run exploit?");

    let resumed = ApprovalGateComponent
      .execute(
        obj(json!({
          "input": {"target": "10.0.0.5"},
          "__resume": {"decision": "approve", "decided_by": "alice"},
        })),
        obj(json!({"title": "Run exploit?"})),
        ctx(),
      )
      .await;

    let Outcome::Success(success) = resumed else {
      panic!("expected success");
    };
    assert_eq!(success.outputs["output"], json!({"target": "10.0.0.5"}));
    assert_eq!(success.outputs["decision"]["decided_by"], "alice");
  }

  #[tokio::test]
  async fn approval_gate_rejection_is_terminal() {
    let outcome = ApprovalGateComponent
      .execute(
        obj(json!({"__resume": {"decision": "reject"}})),
        obj(json!({"title": "Run exploit?"})),
        ctx(),
      )
      .await;

    let Outcome::Failure(failure) = outcome else {
      panic!("expected failure");
    };
    assert_eq!(failure.kind, ErrorKind::Cancel);
    assert!(!failure.retryable);
  }

  #[tokio::test]
  async fn form_resumes_with_submission() {
    let outcome = ManualFormComponent
      .execute(
        obj(json!({"__resume": {"payload": {"severity": "high"}}})),
        obj(json!({"title": "Triage", "form": {}})),
        ctx(),
      )
      .await;

    let Outcome::Success(success) = outcome else {
      panic!("expected success");
    };
    assert_eq!(success.outputs["output"], json!({"severity": "high"}));
  }

  #[tokio::test]
  async fn agent_without_session_fails_configuration() {
    let outcome = AgentToolsComponent
      .execute(Map::new(), obj(json!({"objective": "recon"})), ctx())
      .await;

    let Outcome::Failure(failure) = outcome else {
      panic!("expected failure");
    };
    assert_eq!(failure.kind, ErrorKind::Configuration);
  }
}
