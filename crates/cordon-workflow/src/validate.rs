use std::collections::{HashMap, HashSet};

use cordon_registry::{ComponentRegistry, ParamKind, ParamSpec, PortSpec};
use serde::{Deserialize, Serialize};

use crate::graph::Graph;
use crate::ports::{resolve_edge_ports, PortResolution};
use crate::secret::looks_like_raw_credential;
use crate::workflow::{NodeDef, WorkflowDef};

/// Classification of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
  UnknownComponent,
  DuplicateNode,
  EntrypointMissing,
  EntrypointMultiple,
  UnknownEdgeNode,
  UnknownPort,
  MissingRequiredInput,
  DuplicateInputBinding,
  TypeIncompat,
  InvalidParams,
  RawSecret,
  Cycle,
  // warnings
  OrphanNode,
  UnreferencedSecret,
  ManualTriggerNoInputs,
}

/// One error or warning found in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
  pub kind: IssueKind,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub node_ref: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub edge_id: Option<String>,
  /// Offending source port for connection issues.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_port: Option<String>,
  /// Offending target port for connection issues.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub target_port: Option<String>,
}

impl ValidationIssue {
  fn new(kind: IssueKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      node_ref: None,
      edge_id: None,
      source_port: None,
      target_port: None,
    }
  }

  fn node(mut self, node_ref: impl Into<String>) -> Self {
    self.node_ref = Some(node_ref.into());
    self
  }

  fn edge(mut self, edge_id: impl Into<String>) -> Self {
    self.edge_id = Some(edge_id.into());
    self
  }
}

/// All errors and warnings for one graph, returned together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
  pub errors: Vec<ValidationIssue>,
  pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
  pub fn is_valid(&self) -> bool {
    self.errors.is_empty()
  }
}

/// Validate a workflow graph against the registry.
///
/// Never fails on user-caused issues; every finding is collected into the
/// report.
pub fn validate(workflow: &WorkflowDef, registry: &ComponentRegistry) -> ValidationReport {
  let mut report = ValidationReport::default();
  let def = &workflow.graph;

  // Duplicate node ids.
  let mut seen = HashSet::new();
  for node in &def.nodes {
    if !seen.insert(node.id.as_str()) {
      report.errors.push(
        ValidationIssue::new(
          IssueKind::DuplicateNode,
          format!("node id '{}' appears more than once", node.id),
        )
        .node(&node.id),
      );
    }
  }

  // Component resolution; unknown refs suppress downstream port checks.
  let mut resolved: HashMap<&str, (Vec<PortSpec>, Vec<PortSpec>)> = HashMap::new();
  let mut triggers = Vec::new();
  for node in &def.nodes {
    match registry.get(&node.component_ref) {
      Some(component) => {
        if component.capabilities.is_trigger {
          triggers.push(node.id.clone());
        }
        let params = serde_json::Value::Object(node.params.clone());
        resolved.insert(node.id.as_str(), component.effective_ports(&params));
        check_params(node, &component.parameters, &mut report);
      }
      None => {
        report.errors.push(
          ValidationIssue::new(
            IssueKind::UnknownComponent,
            format!(
              "node '{}' references unknown component '{}'",
              node.id, node.component_ref
            ),
          )
          .node(&node.id),
        );
      }
    }
  }

  // Exactly one entry point.
  match triggers.len() {
    0 => report.errors.push(ValidationIssue::new(
      IssueKind::EntrypointMissing,
      "workflow has no trigger node",
    )),
    1 => {}
    _ => report.errors.push(ValidationIssue::new(
      IssueKind::EntrypointMultiple,
      format!("workflow has {} trigger nodes: {}", triggers.len(), triggers.join(", ")),
    )),
  }

  // Edge endpoint + handle + type checks. Bound target ports are remembered
  // so required-input and duplicate-binding checks can run afterwards.
  let node_index = def.node_index();
  let mut bound: HashMap<(String, String), u32> = HashMap::new();
  for edge in &def.edges {
    let source_known = node_index.contains_key(edge.source.as_str());
    let target_known = node_index.contains_key(edge.target.as_str());
    if !source_known || !target_known {
      let missing = if source_known { &edge.target } else { &edge.source };
      report.errors.push(
        ValidationIssue::new(
          IssueKind::UnknownEdgeNode,
          format!("edge '{}' references unknown node '{}'", edge.id, missing),
        )
        .edge(&edge.id),
      );
      continue;
    }

    let (Some((_, source_outputs)), Some((target_inputs, _))) = (
      resolved.get(edge.source.as_str()),
      resolved.get(edge.target.as_str()),
    ) else {
      // Component unresolved; already reported.
      continue;
    };

    let ports = match resolve_edge_ports(edge, source_outputs, target_inputs) {
      PortResolution::Resolved(ports) => ports,
      PortResolution::UnknownSourcePort(handle) => {
        report.errors.push(
          ValidationIssue::new(
            IssueKind::UnknownPort,
            format!(
              "edge '{}' names output port '{}' which '{}' does not declare",
              edge.id, handle, edge.source
            ),
          )
          .edge(&edge.id),
        );
        continue;
      }
      PortResolution::UnknownTargetPort(handle) => {
        report.errors.push(
          ValidationIssue::new(
            IssueKind::UnknownPort,
            format!(
              "edge '{}' names input port '{}' which '{}' does not declare",
              edge.id, handle, edge.target
            ),
          )
          .edge(&edge.id),
        );
        continue;
      }
      PortResolution::AmbiguousSource | PortResolution::AmbiguousTarget => {
        report.errors.push(
          ValidationIssue::new(
            IssueKind::UnknownPort,
            format!(
              "edge '{}' omits a handle but its endpoint declares several ports",
              edge.id
            ),
          )
          .edge(&edge.id),
        );
        continue;
      }
    };

    let source_spec = source_outputs
      .iter()
      .find(|p| p.id == ports.source_port)
      .expect("resolved port");
    let target_spec = target_inputs
      .iter()
      .find(|p| p.id == ports.target_port)
      .expect("resolved port");

    if !target_spec.allow_any
      && !source_spec.data_type.compatible_with(&target_spec.data_type)
    {
      let mut issue = ValidationIssue::new(
        IssueKind::TypeIncompat,
        format!(
          "edge '{}': output '{}.{}' is not compatible with input '{}.{}'",
          edge.id, edge.source, ports.source_port, edge.target, ports.target_port
        ),
      )
      .edge(&edge.id);
      issue.source_port = Some(ports.source_port.clone());
      issue.target_port = Some(ports.target_port.clone());
      report.errors.push(issue);
    }

    *bound
      .entry((edge.target.clone(), ports.target_port))
      .or_insert(0) += 1;
  }

  for ((node_id, port_id), count) in &bound {
    if *count > 1 {
      let mut issue = ValidationIssue::new(
        IssueKind::DuplicateInputBinding,
        format!(
          "input '{}.{}' is connected by {} edges; exactly one is allowed",
          node_id, port_id, count
        ),
      )
      .node(node_id);
      issue.target_port = Some(port_id.clone());
      report.errors.push(issue);
    }
  }

  // Required inputs: an edge or a literal param must satisfy each one.
  for node in &def.nodes {
    let Some((inputs, _)) = resolved.get(node.id.as_str()) else {
      continue;
    };
    for port in inputs.iter().filter(|p| p.required) {
      let has_edge = bound.contains_key(&(node.id.clone(), port.id.clone()));
      let has_literal = node.params.contains_key(&port.id);
      if !has_edge && !has_literal {
        let mut issue = ValidationIssue::new(
          IssueKind::MissingRequiredInput,
          format!(
            "required input '{}.{}' has no connected edge and no literal",
            node.id, port.id
          ),
        )
        .node(&node.id);
        issue.target_port = Some(port.id.clone());
        report.errors.push(issue);
      }
    }
  }

  // Cycle detection.
  let graph = Graph::new(def);
  if let Err(err) = graph.topo_order() {
    report
      .errors
      .push(ValidationIssue::new(IssueKind::Cycle, err.to_string()));
  }

  // Warnings.
  for orphan in graph.orphans() {
    let is_lone_trigger = triggers.len() == 1 && triggers[0] == orphan && def.nodes.len() == 1;
    if !is_lone_trigger {
      report.warnings.push(
        ValidationIssue::new(
          IssueKind::OrphanNode,
          format!("node '{}' has no inbound or outbound connection", orphan),
        )
        .node(orphan),
      );
    }
  }

  for node in &def.nodes {
    let Some(component) = registry.get(&node.component_ref) else {
      continue;
    };
    if component.capabilities.is_trigger && node.params.is_empty() {
      report.warnings.push(
        ValidationIssue::new(
          IssueKind::ManualTriggerNoInputs,
          format!("trigger '{}' declares no runtime inputs", node.id),
        )
        .node(&node.id),
      );
    }
    for param in component
      .parameters
      .iter()
      .filter(|p| matches!(p.kind, ParamKind::Secret))
    {
      if !p_is_set(node, param) {
        report.warnings.push(
          ValidationIssue::new(
            IssueKind::UnreferencedSecret,
            format!("secret parameter '{}.{}' is never referenced", node.id, param.id),
          )
          .node(&node.id),
        );
      }
    }
  }

  report
}

fn p_is_set(node: &NodeDef, param: &ParamSpec) -> bool {
  node
    .params
    .get(&param.id)
    .map(|v| !v.is_null())
    .unwrap_or(false)
}

/// Check supplied params against the component's declared parameter specs.
fn check_params(node: &NodeDef, specs: &[ParamSpec], report: &mut ValidationReport) {
  for spec in specs {
    let value = match node.params.get(&spec.id) {
      Some(v) if !v.is_null() => v,
      _ => {
        if spec.required && spec.default.is_none() {
          report.errors.push(
            ValidationIssue::new(
              IssueKind::InvalidParams,
              format!("required parameter '{}.{}' is missing", node.id, spec.id),
            )
            .node(&node.id),
          );
        }
        continue;
      }
    };

    let shape_ok = match &spec.kind {
      ParamKind::Text | ParamKind::Secret => value.is_string(),
      ParamKind::Number => value.is_number(),
      ParamKind::Boolean => value.is_boolean(),
      ParamKind::Json => true,
      ParamKind::Select { options } => value
        .as_str()
        .map(|s| options.iter().any(|o| o == s))
        .unwrap_or(false),
    };
    if !shape_ok {
      report.errors.push(
        ValidationIssue::new(
          IssueKind::InvalidParams,
          format!(
            "parameter '{}.{}' does not match its declared shape",
            node.id, spec.id
          ),
        )
        .node(&node.id),
      );
      continue;
    }

    if matches!(spec.kind, ParamKind::Secret) {
      if let Some(s) = value.as_str() {
        if looks_like_raw_credential(s) {
          report.errors.push(
            ValidationIssue::new(
              IssueKind::RawSecret,
              format!(
                "parameter '{}.{}' looks like a raw credential; supply a secret reference",
                node.id, spec.id
              ),
            )
            .node(&node.id),
          );
        }
      }
    }
  }
}
