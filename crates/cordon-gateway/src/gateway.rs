use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cordon_events::{EventKind, StreamHub};
use cordon_registry::ComponentDefinition;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::session::{SessionHandle, ToolRegistration, ToolSession};
use crate::token::TokenSigner;
use crate::GatewayError;

/// Resolves the tools a node serves, starting its backing server if needed.
///
/// Implemented by the container runner; the orchestrator calls it while
/// opening a session for an agent's neighborhood.
#[async_trait]
pub trait ToolResolver: Send + Sync {
  async fn resolve(
    &self,
    run_id: &str,
    node_ref: &str,
    component: &ComponentDefinition,
    params: &serde_json::Map<String, Value>,
  ) -> Result<Vec<ToolRegistration>, GatewayError>;
}

/// Default session lifetime; the orchestrator closes sessions on attempt
/// termination long before this is reached.
const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// The tool gateway.
///
/// Session creation and revocation take the table's write lock; tool calls
/// take the read lock. A run-wide tool directory backs the distinction
/// between "tool you may not call" and "tool that does not exist".
pub struct Gateway {
  signer: TokenSigner,
  hub: Arc<StreamHub>,
  http: reqwest::Client,
  sessions: RwLock<HashMap<String, ToolSession>>,
  /// All tools registered across a run, keyed by run id then tool name.
  run_tools: RwLock<HashMap<String, HashMap<String, ToolRegistration>>>,
  /// Per-tool serialization for non-reentrant servers.
  serialize_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Gateway {
  pub fn new(signer: TokenSigner, hub: Arc<StreamHub>) -> Self {
    Self {
      signer,
      hub,
      http: reqwest::Client::new(),
      sessions: RwLock::new(HashMap::new()),
      run_tools: RwLock::new(HashMap::new()),
      serialize_locks: Mutex::new(HashMap::new()),
    }
  }

  /// Record tools served within a run, making them visible to sessions.
  pub async fn register_run_tools(&self, run_id: &str, registrations: Vec<ToolRegistration>) {
    let mut run_tools = self.run_tools.write().await;
    let directory = run_tools.entry(run_id.to_string()).or_default();
    for registration in registrations {
      directory.insert(registration.tool_name.clone(), registration);
    }
  }

  /// Open a session for one agent attempt.
  ///
  /// The session snapshots the tools served by its allowed node refs; the
  /// returned bearer token binds `(run, node, session)` and dies with the
  /// session.
  pub async fn open_session(
    &self,
    run_id: &str,
    node_ref: &str,
    allowed_node_refs: Vec<String>,
  ) -> SessionHandle {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    let registrations = {
      let run_tools = self.run_tools.read().await;
      run_tools
        .get(run_id)
        .map(|directory| {
          directory
            .values()
            .filter(|r| allowed_node_refs.iter().any(|a| a == &r.node_ref))
            .cloned()
            .collect()
        })
        .unwrap_or_default()
    };

    let session = ToolSession {
      id: id.clone(),
      run_id: run_id.to_string(),
      node_ref: node_ref.to_string(),
      allowed_node_refs,
      registrations,
      issued_at: now,
      expires_at: now + chrono::Duration::from_std(SESSION_TTL).expect("ttl fits"),
    };

    let token = self.signer.sign(&id);
    self.sessions.write().await.insert(id.clone(), session);

    info!(run_id, node_ref, session_id = %id, "tool session opened");
    SessionHandle {
      session_id: id,
      token,
    }
  }

  /// Revoke a session; its token stops verifying against the table.
  pub async fn close_session(&self, session_id: &str) {
    if self.sessions.write().await.remove(session_id).is_some() {
      info!(session_id, "tool session closed");
    }
  }

  /// Drop a run's directory and any sessions still open for it.
  pub async fn close_run(&self, run_id: &str) {
    self.run_tools.write().await.remove(run_id);
    self
      .sessions
      .write()
      .await
      .retain(|_, session| session.run_id != run_id);
  }

  /// Handle one JSON-RPC request from an agent.
  pub async fn handle(&self, bearer: Option<&str>, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();

    let session = match self.authorize(bearer).await {
      Ok(session) => session,
      Err(e) => {
        return JsonRpcResponse::error(
          id,
          JsonRpcError::new(JsonRpcError::INVALID_REQUEST, e.to_string()),
        );
      }
    };

    match request.method.as_str() {
      "initialize" => JsonRpcResponse::result(
        id,
        json!({
          "protocolVersion": "2024-11-05",
          "serverInfo": {"name": "cordon-gateway", "version": env!("CARGO_PKG_VERSION")},
          "capabilities": {"tools": {}},
        }),
      ),
      "tools/list" => {
        let tools: Vec<Value> = session
          .registrations
          .iter()
          .map(|r| {
            json!({
              "name": r.tool_name,
              "inputSchema": r.input_schema,
            })
          })
          .collect();
        JsonRpcResponse::result(id, json!({"tools": tools}))
      }
      "tools/call" => self.call_tool(&session, id, request.params).await,
      other => JsonRpcResponse::error(
        id,
        JsonRpcError::new(
          JsonRpcError::METHOD_NOT_FOUND,
          format!("unknown method '{other}'"),
        ),
      ),
    }
  }

  async fn authorize(&self, bearer: Option<&str>) -> Result<ToolSession, GatewayError> {
    let token = bearer.ok_or(GatewayError::InvalidToken)?;
    let session_id = self
      .signer
      .verify(token)
      .ok_or(GatewayError::InvalidToken)?;

    let sessions = self.sessions.read().await;
    let session = sessions.get(&session_id).ok_or(GatewayError::InvalidToken)?;
    if session.is_expired(Utc::now()) {
      return Err(GatewayError::SessionExpired);
    }
    Ok(session.clone())
  }

  async fn call_tool(&self, session: &ToolSession, id: Value, params: Value) -> JsonRpcResponse {
    let name = params
      .get("name")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    match self.dispatch(session, &name, &arguments).await {
      Ok(result) => JsonRpcResponse::result(id, result),
      Err(e) => {
        let code = match &e {
          GatewayError::NotPermitted { .. } => JsonRpcError::NOT_PERMITTED,
          GatewayError::UnknownTool { .. } => JsonRpcError::UNKNOWN_TOOL,
          GatewayError::InvalidArguments { .. } => JsonRpcError::INVALID_PARAMS,
          _ => JsonRpcError::INTERNAL,
        };
        JsonRpcResponse::error(id, JsonRpcError::new(code, e.to_string()))
      }
    }
  }

  /// Verify, serialize if required, and forward one tool call.
  async fn dispatch(
    &self,
    session: &ToolSession,
    name: &str,
    arguments: &Value,
  ) -> Result<Value, GatewayError> {
    let registration = match session.find_tool(name) {
      Some(registration) => registration.clone(),
      None => {
        // Distinguish "exists but out of scope" from "does not exist"; both
        // are recorded as rejected tool.call events.
        let run_tools = self.run_tools.read().await;
        let error = match run_tools
          .get(&session.run_id)
          .and_then(|directory| directory.get(name))
        {
          Some(_) => GatewayError::NotPermitted {
            tool: name.to_string(),
          },
          None => GatewayError::UnknownTool {
            tool: name.to_string(),
          },
        };
        drop(run_tools);

        self
          .emit_call(session, name, arguments, Some(&error.to_string()))
          .await;
        return Err(error);
      }
    };

    if !session.covers(&registration.node_ref) {
      let error = GatewayError::NotPermitted {
        tool: name.to_string(),
      };
      self
        .emit_call(session, name, arguments, Some(&error.to_string()))
        .await;
      return Err(error);
    }

    if let Err(message) = validate_arguments(&registration.input_schema, arguments) {
      let error = GatewayError::InvalidArguments { message };
      self
        .emit_call(session, name, arguments, Some(&error.to_string()))
        .await;
      return Err(error);
    }

    self.emit_call(session, name, arguments, None).await;

    let _guard;
    if registration.non_reentrant {
      let lock = self.serialize_lock(&session.run_id, &registration.node_ref).await;
      _guard = lock.lock_owned().await;
    }

    let started = std::time::Instant::now();
    let result = self.forward(&registration, name, arguments).await;

    let payload = match &result {
      Ok(_) => json!({
        "session_id": session.id,
        "tool": name,
        "ok": true,
        "duration_ms": started.elapsed().as_millis() as u64,
      }),
      Err(e) => json!({
        "session_id": session.id,
        "tool": name,
        "ok": false,
        "error": e.to_string(),
      }),
    };
    if let Err(e) = self
      .hub
      .append(
        &session.run_id,
        Some(&session.node_ref),
        EventKind::ToolResult,
        payload,
      )
      .await
    {
      warn!(error = %e, "failed to append tool.result event");
    }

    result
  }

  async fn emit_call(
    &self,
    session: &ToolSession,
    name: &str,
    arguments: &Value,
    rejection: Option<&str>,
  ) {
    let mut payload = json!({
      "session_id": session.id,
      "tool": name,
      "arguments": arguments,
    });
    if let Some(rejection) = rejection {
      payload["rejected"] = json!(rejection);
    }
    if let Err(e) = self
      .hub
      .append(
        &session.run_id,
        Some(&session.node_ref),
        EventKind::ToolCall,
        payload,
      )
      .await
    {
      warn!(error = %e, "failed to append tool.call event");
    }
  }

  async fn serialize_lock(&self, run_id: &str, node_ref: &str) -> Arc<Mutex<()>> {
    let key = format!("{run_id}/{node_ref}");
    let mut locks = self.serialize_locks.lock().await;
    locks.entry(key).or_default().clone()
  }

  async fn forward(
    &self,
    registration: &ToolRegistration,
    name: &str,
    arguments: &Value,
  ) -> Result<Value, GatewayError> {
    let request = json!({
      "jsonrpc": "2.0",
      "id": Uuid::new_v4().to_string(),
      "method": "tools/call",
      "params": {"name": name, "arguments": arguments},
    });

    let response = self
      .http
      .post(&registration.endpoint)
      .json(&request)
      .send()
      .await
      .map_err(|e| GatewayError::Upstream {
        message: e.to_string(),
      })?;

    let body: Value = response.json().await.map_err(|e| GatewayError::Upstream {
      message: e.to_string(),
    })?;

    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
      return Err(GatewayError::Upstream {
        message: error.to_string(),
      });
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
  }
}

fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
  if schema.is_null() {
    return Ok(());
  }
  let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
  let mut errors = validator.iter_errors(arguments).peekable();
  if errors.peek().is_some() {
    let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
    return Err(messages.join("; "));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use cordon_events::MemoryEventStore;

  fn hub() -> Arc<StreamHub> {
    Arc::new(StreamHub::new(Arc::new(MemoryEventStore::new())))
  }

  fn registration(name: &str, node_ref: &str) -> ToolRegistration {
    ToolRegistration {
      tool_name: name.to_string(),
      node_ref: node_ref.to_string(),
      endpoint: "http://127.0.0.1:1/rpc".to_string(),
      container_id: None,
      input_schema: json!({
        "type": "object",
        "properties": {"target": {"type": "string"}},
        "required": ["target"],
      }),
      non_reentrant: false,
    }
  }

  #[tokio::test]
  async fn sessions_snapshot_allowed_tools() {
    let gateway = Gateway::new(TokenSigner::ephemeral(), hub());
    gateway
      .register_run_tools(
        "run-1",
        vec![registration("nmap.scan", "t1"), registration("nuclei.scan", "t2")],
      )
      .await;

    let handle = gateway
      .open_session("run-1", "agent", vec!["t1".to_string()])
      .await;

    let response = gateway
      .handle(
        Some(&handle.token),
        JsonRpcRequest {
          jsonrpc: "2.0".to_string(),
          id: json!(1),
          method: "tools/list".to_string(),
          params: json!({}),
        },
      )
      .await;

    let tools = response.result.unwrap()["tools"].clone();
    assert_eq!(tools.as_array().unwrap().len(), 1);
    assert_eq!(tools[0]["name"], "nmap.scan");
  }

  #[tokio::test]
  async fn out_of_scope_tool_is_not_permitted_and_not_forwarded() {
    let hub = hub();
    let gateway = Gateway::new(TokenSigner::ephemeral(), hub.clone());
    gateway
      .register_run_tools(
        "run-1",
        vec![registration("nmap.scan", "t1"), registration("sqlmap.run", "t3")],
      )
      .await;

    let handle = gateway
      .open_session("run-1", "agent", vec!["t1".to_string()])
      .await;
    let mut stream = hub.subscribe("run-1", 0).await.unwrap();

    let response = gateway
      .handle(
        Some(&handle.token),
        JsonRpcRequest {
          jsonrpc: "2.0".to_string(),
          id: json!(7),
          method: "tools/call".to_string(),
          params: json!({"name": "sqlmap.run", "arguments": {"target": "x"}}),
        },
      )
      .await;

    let error = response.error.unwrap();
    assert_eq!(error.code, JsonRpcError::NOT_PERMITTED);
    assert_eq!(response.id, json!(7));

    // The rejection is recorded as a tool.call event.
    let Some(cordon_events::StreamMessage::Event(event)) = stream.next().await else {
      panic!("expected event");
    };
    assert_eq!(event.kind, EventKind::ToolCall);
    assert!(event.payload["rejected"].as_str().is_some());
  }

  #[tokio::test]
  async fn unknown_tool_is_distinct_from_not_permitted() {
    let gateway = Gateway::new(TokenSigner::ephemeral(), hub());
    gateway
      .register_run_tools("run-1", vec![registration("nmap.scan", "t1")])
      .await;

    let handle = gateway
      .open_session("run-1", "agent", vec!["t1".to_string()])
      .await;

    let response = gateway
      .handle(
        Some(&handle.token),
        JsonRpcRequest {
          jsonrpc: "2.0".to_string(),
          id: json!(1),
          method: "tools/call".to_string(),
          params: json!({"name": "ghost.tool", "arguments": {}}),
        },
      )
      .await;

    assert_eq!(response.error.unwrap().code, JsonRpcError::UNKNOWN_TOOL);
  }

  #[tokio::test]
  async fn invalid_arguments_are_rejected_by_schema() {
    let gateway = Gateway::new(TokenSigner::ephemeral(), hub());
    gateway
      .register_run_tools("run-1", vec![registration("nmap.scan", "t1")])
      .await;

    let handle = gateway
      .open_session("run-1", "agent", vec!["t1".to_string()])
      .await;

    let response = gateway
      .handle(
        Some(&handle.token),
        JsonRpcRequest {
          jsonrpc: "2.0".to_string(),
          id: json!(1),
          method: "tools/call".to_string(),
          // "target" is required by the schema
          params: json!({"name": "nmap.scan", "arguments": {"ports": 80}}),
        },
      )
      .await;

    assert_eq!(response.error.unwrap().code, JsonRpcError::INVALID_PARAMS);
  }

  #[tokio::test]
  async fn closed_sessions_stop_verifying() {
    let gateway = Gateway::new(TokenSigner::ephemeral(), hub());
    let handle = gateway.open_session("run-1", "agent", vec![]).await;
    gateway.close_session(&handle.session_id).await;

    let response = gateway
      .handle(
        Some(&handle.token),
        JsonRpcRequest {
          jsonrpc: "2.0".to_string(),
          id: json!(1),
          method: "tools/list".to_string(),
          params: json!({}),
        },
      )
      .await;

    assert_eq!(
      response.error.unwrap().code,
      JsonRpcError::INVALID_REQUEST
    );
  }

  #[tokio::test]
  async fn missing_bearer_is_rejected() {
    let gateway = Gateway::new(TokenSigner::ephemeral(), hub());
    let response = gateway
      .handle(
        None,
        JsonRpcRequest {
          jsonrpc: "2.0".to_string(),
          id: json!(1),
          method: "initialize".to_string(),
          params: json!({}),
        },
      )
      .await;
    assert!(response.error.is_some());
  }
}
