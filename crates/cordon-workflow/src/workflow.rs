use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A stored workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub version: u32,
  pub graph: GraphDef,
}

/// The drawable graph: nodes, edges, and an opaque viewport blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
  pub nodes: Vec<NodeDef>,
  pub edges: Vec<EdgeDef>,
  /// Editor state; the core never interprets it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub viewport: Option<serde_json::Value>,
}

/// One node placed on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
  pub id: String,
  /// Component id in the registry, e.g. `core.http.request`.
  pub component_ref: String,
  /// Static parameter values, keyed by param or input-port id.
  #[serde(default)]
  pub params: serde_json::Map<String, serde_json::Value>,
  /// Canvas position; opaque to the core.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub position: Option<serde_json::Value>,
  /// Include this node's outputs in the terminal run event.
  #[serde(default)]
  pub expose_as_run_output: bool,
}

/// A directed connection between two node ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
  pub id: String,
  pub source: String,
  pub target: String,
  /// Output port on the source; optional when the source has one output.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_handle: Option<String>,
  /// Input port on the target; optional when the target has one input.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_handle: Option<String>,
}

impl GraphDef {
  /// Nodes indexed by id. Later duplicates win; the validator reports them.
  pub fn node_index(&self) -> HashMap<&str, &NodeDef> {
    self
      .nodes
      .iter()
      .map(|n| (n.id.as_str(), n))
      .collect()
  }

  /// Edges grouped by target node id.
  pub fn inbound_edges(&self, node_id: &str) -> impl Iterator<Item = &EdgeDef> {
    self.edges.iter().filter(move |e| e.target == node_id)
  }

  /// Edges grouped by source node id.
  pub fn outbound_edges(&self, node_id: &str) -> impl Iterator<Item = &EdgeDef> {
    self.edges.iter().filter(move |e| e.source == node_id)
  }
}
