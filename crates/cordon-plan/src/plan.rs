use serde::{Deserialize, Serialize};

/// How one effective input port of an action is satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "binding", rename_all = "snake_case")]
pub enum InputBinding {
  /// A static parameter supplied the value.
  Literal {
    port_id: String,
    value: serde_json::Value,
  },
  /// Resolved from exactly one inbound edge.
  Edge {
    port_id: String,
    source_ref: String,
    source_port_id: String,
  },
}

impl InputBinding {
  pub fn port_id(&self) -> &str {
    match self {
      InputBinding::Literal { port_id, .. } => port_id,
      InputBinding::Edge { port_id, .. } => port_id,
    }
  }
}

/// One node of the plan, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
  /// The node id this action was compiled from.
  pub node_ref: String,
  pub component_id: String,
  pub params: serde_json::Map<String, serde_json::Value>,
  pub input_bindings: Vec<InputBinding>,
  /// Include this action's outputs in the terminal run event.
  pub expose_as_run_output: bool,
  /// Invoked by agents through the gateway, never scheduled directly.
  #[serde(default)]
  pub tool_mode: bool,
  /// Tool nodes wired to this action over tool-connection edges; they become
  /// the agent's session neighborhood.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tool_refs: Vec<String>,
}

/// Immutable compiled plan for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
  /// Topologically ordered, tie-broken by node id.
  pub actions: Vec<PlannedAction>,
  /// The unique trigger node.
  pub entrypoint_ref: String,
  /// SHA-256 of the canonical plan JSON.
  pub signature: String,
}

impl ExecutionPlan {
  pub fn action(&self, node_ref: &str) -> Option<&PlannedAction> {
    self.actions.iter().find(|a| a.node_ref == node_ref)
  }

  /// Node refs that `node_ref` consumes through edge bindings.
  pub fn upstream_of(&self, node_ref: &str) -> Vec<&str> {
    self
      .action(node_ref)
      .map(|action| {
        action
          .input_bindings
          .iter()
          .filter_map(|b| match b {
            InputBinding::Edge { source_ref, .. } => Some(source_ref.as_str()),
            InputBinding::Literal { .. } => None,
          })
          .collect()
      })
      .unwrap_or_default()
  }
}
