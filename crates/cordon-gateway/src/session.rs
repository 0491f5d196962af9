use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One tool exposed by a tool-server node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRegistration {
  /// Unique tool name within the run, e.g. `nuclei.scan`.
  pub tool_name: String,
  /// The graph node serving this tool.
  pub node_ref: String,
  /// JSON-RPC endpoint of the backing server.
  pub endpoint: String,
  /// Backing container, when container-hosted.
  pub container_id: Option<String>,
  /// JSON Schema the arguments must validate against.
  pub input_schema: serde_json::Value,
  /// The backing server cannot service concurrent calls.
  pub non_reentrant: bool,
}

/// A bounded authorization for one agent attempt to invoke tools.
#[derive(Debug, Clone)]
pub struct ToolSession {
  pub id: String,
  pub run_id: String,
  /// The agent node this session belongs to.
  pub node_ref: String,
  /// Tool nodes the agent may reach, from its graph neighborhood.
  pub allowed_node_refs: Vec<String>,
  /// Tools visible to this session, snapshotted at open.
  pub registrations: Vec<ToolRegistration>,
  pub issued_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl ToolSession {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }

  pub fn covers(&self, node_ref: &str) -> bool {
    self.allowed_node_refs.iter().any(|r| r == node_ref)
  }

  pub fn find_tool(&self, name: &str) -> Option<&ToolRegistration> {
    self.registrations.iter().find(|r| r.tool_name == name)
  }
}

/// What the orchestrator hands to the agent component.
#[derive(Debug, Clone)]
pub struct SessionHandle {
  pub session_id: String,
  pub token: String,
}
