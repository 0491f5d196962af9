use std::collections::HashMap;

use cordon_registry::ComponentRegistry;
use cordon_workflow::{resolve_edge_ports, Graph, PortResolution, WorkflowDef};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::canonical::canonical_json;
use crate::plan::{ExecutionPlan, InputBinding, PlannedAction};

/// Compilation failures.
///
/// The validator catches user-facing graph issues first; these errors guard
/// the compiler's own invariants and the input binding rules.
#[derive(Debug, Error)]
pub enum CompileError {
  #[error("node '{node_ref}' references unknown component '{component_id}'")]
  UnknownComponent {
    node_ref: String,
    component_id: String,
  },

  #[error("workflow must have exactly one trigger node, found {count}")]
  EntrypointCount { count: usize },

  #[error("graph contains a cycle: {message}")]
  Cycle { message: String },

  #[error("edge '{edge_id}' cannot be resolved to ports: {message}")]
  EdgeResolution { edge_id: String, message: String },

  #[error("input '{node_ref}.{port_id}' is bound by both an edge and a literal")]
  ConflictingBinding { node_ref: String, port_id: String },

  #[error("required input '{node_ref}.{port_id}' has no binding")]
  UnboundInput { node_ref: String, port_id: String },
}

/// Compile a validated workflow into an execution plan.
///
/// Deterministic: identical graphs yield identical plans and signatures.
pub fn compile(
  workflow: &WorkflowDef,
  registry: &ComponentRegistry,
) -> Result<ExecutionPlan, CompileError> {
  let def = &workflow.graph;

  // Resolve components and effective ports up front.
  let mut components = HashMap::new();
  let mut effective = HashMap::new();
  let mut triggers = Vec::new();
  for node in &def.nodes {
    let component =
      registry
        .get(&node.component_ref)
        .ok_or_else(|| CompileError::UnknownComponent {
          node_ref: node.id.clone(),
          component_id: node.component_ref.clone(),
        })?;
    if component.capabilities.is_trigger {
      triggers.push(node.id.clone());
    }
    let params = serde_json::Value::Object(node.params.clone());
    effective.insert(node.id.clone(), component.effective_ports(&params));
    components.insert(node.id.clone(), component);
  }

  if triggers.len() != 1 {
    return Err(CompileError::EntrypointCount {
      count: triggers.len(),
    });
  }
  let entrypoint_ref = triggers.remove(0);

  // Edge bindings: (target node, target port) -> (source node, source port).
  // Tool-connection edges carry no data; they define the agent's session
  // neighborhood instead.
  let mut edge_bindings: HashMap<(String, String), (String, String)> = HashMap::new();
  let mut tool_refs: HashMap<String, Vec<String>> = HashMap::new();
  for edge in &def.edges {
    let (Some((_, source_outputs)), Some((target_inputs, _))) =
      (effective.get(&edge.source), effective.get(&edge.target))
    else {
      return Err(CompileError::EdgeResolution {
        edge_id: edge.id.clone(),
        message: "edge endpoint is not a known node".to_string(),
      });
    };

    let ports = match resolve_edge_ports(edge, source_outputs, target_inputs) {
      PortResolution::Resolved(ports) => ports,
      other => {
        return Err(CompileError::EdgeResolution {
          edge_id: edge.id.clone(),
          message: format!("{:?}", other),
        });
      }
    };

    let is_tool_edge = target_inputs
      .iter()
      .find(|p| p.id == ports.target_port)
      .map(|p| p.connection_type == cordon_registry::ConnectionType::Tool)
      .unwrap_or(false);
    if is_tool_edge {
      tool_refs
        .entry(edge.target.clone())
        .or_default()
        .push(edge.source.clone());
      continue;
    }

    edge_bindings.insert(
      (edge.target.clone(), ports.target_port),
      (edge.source.clone(), ports.source_port),
    );
  }

  // Topological order with deterministic tie-break.
  let order = Graph::new(def)
    .topo_order()
    .map_err(|e| CompileError::Cycle {
      message: e.to_string(),
    })?;

  let node_index = def.node_index();
  let mut actions = Vec::with_capacity(order.len());
  for node_ref in order {
    let node = node_index
      .get(node_ref.as_str())
      .expect("topo order only yields known nodes");
    let (inputs, _) = effective.get(&node_ref).expect("resolved above");

    let component = components.get(&node_ref).expect("resolved above");

    let mut input_bindings = Vec::new();
    for port in inputs.iter().filter(|p| {
      p.connection_type == cordon_registry::ConnectionType::Main
    }) {
      let from_edge = edge_bindings.get(&(node_ref.clone(), port.id.clone()));
      let literal = node.params.get(&port.id);

      match (from_edge, literal) {
        (Some(_), Some(_)) => {
          return Err(CompileError::ConflictingBinding {
            node_ref: node_ref.clone(),
            port_id: port.id.clone(),
          });
        }
        (Some((source_ref, source_port_id)), None) => {
          input_bindings.push(InputBinding::Edge {
            port_id: port.id.clone(),
            source_ref: source_ref.clone(),
            source_port_id: source_port_id.clone(),
          });
        }
        (None, Some(value)) => {
          input_bindings.push(InputBinding::Literal {
            port_id: port.id.clone(),
            value: value.clone(),
          });
        }
        (None, None) => {
          if port.required {
            return Err(CompileError::UnboundInput {
              node_ref: node_ref.clone(),
              port_id: port.id.clone(),
            });
          }
        }
      }
    }

    let mut refs = tool_refs.remove(&node_ref).unwrap_or_default();
    refs.sort();

    actions.push(PlannedAction {
      node_ref: node_ref.clone(),
      component_id: node.component_ref.clone(),
      params: node.params.clone(),
      input_bindings,
      expose_as_run_output: node.expose_as_run_output,
      tool_mode: component.capabilities.is_tool_mode,
      tool_refs: refs,
    });
  }

  let signature = sign(&actions, &entrypoint_ref);

  Ok(ExecutionPlan {
    actions,
    entrypoint_ref,
    signature,
  })
}

/// Content hash over the canonical JSON of the plan body.
fn sign(actions: &[PlannedAction], entrypoint_ref: &str) -> String {
  let body = json!({
    "actions": actions,
    "entrypoint_ref": entrypoint_ref,
  });
  let canonical = canonical_json(&body);
  let mut hasher = Sha256::new();
  hasher.update(canonical.as_bytes());
  hex::encode(hasher.finalize())
}
