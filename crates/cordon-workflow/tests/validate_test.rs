//! Validator tests against a small fixture registry.

use cordon_registry::{
  Capabilities, ComponentDefinition, ComponentRegistry, DataType, ParamKind, ParamSpec, PortSpec,
  PrimitiveType,
};
use cordon_workflow::{validate, EdgeDef, GraphDef, IssueKind, NodeDef, WorkflowDef};
use serde_json::json;

fn registry() -> ComponentRegistry {
  let mut registry = ComponentRegistry::new();

  let mut trigger = ComponentDefinition::inline("core.trigger.manual", "1.0.0");
  trigger.capabilities = Capabilities {
    is_trigger: true,
    ..Capabilities::default()
  };
  trigger.outputs = vec![PortSpec::required(
    "payload",
    DataType::primitive(PrimitiveType::Json),
  )];
  registry.register(trigger).unwrap();

  let mut to_number = ComponentDefinition::inline("test.number.source", "1.0.0");
  to_number.inputs = vec![PortSpec::optional(
    "input",
    DataType::primitive(PrimitiveType::Json),
  )];
  to_number.outputs = vec![PortSpec::required(
    "value",
    DataType::primitive(PrimitiveType::Number),
  )];
  registry.register(to_number).unwrap();

  let mut wants_text = ComponentDefinition::inline("test.text.sink", "1.0.0");
  wants_text.inputs = vec![PortSpec::required(
    "text",
    DataType::primitive(PrimitiveType::Text),
  )];
  wants_text.parameters = vec![
    ParamSpec::new("api_key", "API key", ParamKind::Secret).required(),
  ];
  registry.register(wants_text).unwrap();

  registry.seal();
  registry
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

fn edge(id: &str, source: &str, target: &str) -> EdgeDef {
  EdgeDef {
    id: id.to_string(),
    source: source.to_string(),
    target: target.to_string(),
    source_handle: None,
    target_handle: None,
  }
}

fn workflow(nodes: Vec<NodeDef>, edges: Vec<EdgeDef>) -> WorkflowDef {
  WorkflowDef {
    id: "wf-1".to_string(),
    name: "test".to_string(),
    description: String::new(),
    version: 1,
    graph: GraphDef {
      nodes,
      edges,
      viewport: None,
    },
  }
}

#[test]
fn type_mismatch_is_a_single_error_naming_both_ports() {
  let wf = workflow(
    vec![
      node("start", "core.trigger.manual", json!({"x": 1})),
      node("numbers", "test.number.source", json!({})),
      node("consume", "test.text.sink", json!({"api_key": "prod/key-ref"})),
    ],
    vec![
      edge("e1", "start", "numbers"),
      edge("e2", "numbers", "consume"),
    ],
  );

  let report = validate(&wf, &registry());
  let type_errors: Vec<_> = report
    .errors
    .iter()
    .filter(|i| i.kind == IssueKind::TypeIncompat)
    .collect();

  assert_eq!(type_errors.len(), 1);
  assert_eq!(type_errors[0].source_port.as_deref(), Some("value"));
  assert_eq!(type_errors[0].target_port.as_deref(), Some("text"));
}

#[test]
fn unknown_component_and_missing_trigger() {
  let wf = workflow(vec![node("a", "does.not.exist", json!({}))], vec![]);

  let report = validate(&wf, &registry());
  assert!(report
    .errors
    .iter()
    .any(|i| i.kind == IssueKind::UnknownComponent));
  assert!(report
    .errors
    .iter()
    .any(|i| i.kind == IssueKind::EntrypointMissing));
}

#[test]
fn missing_required_input_is_reported() {
  let wf = workflow(
    vec![
      node("start", "core.trigger.manual", json!({"x": 1})),
      node("consume", "test.text.sink", json!({"api_key": "ref"})),
    ],
    vec![],
  );

  let report = validate(&wf, &registry());
  assert!(report
    .errors
    .iter()
    .any(|i| i.kind == IssueKind::MissingRequiredInput && i.node_ref.as_deref() == Some("consume")));
  // both nodes are disconnected
  assert!(report
    .warnings
    .iter()
    .any(|i| i.kind == IssueKind::OrphanNode));
}

#[test]
fn raw_credential_in_secret_param_is_flagged() {
  let wf = workflow(
    vec![
      node("start", "core.trigger.manual", json!({"x": 1})),
      node("numbers", "test.number.source", json!({})),
      node(
        "consume",
        "test.text.sink",
        json!({"api_key": "sk-proj-abcdef1234567890", "text": "hello"}),
      ),
    ],
    vec![edge("e1", "start", "numbers")],
  );

  let report = validate(&wf, &registry());
  assert!(report.errors.iter().any(|i| i.kind == IssueKind::RawSecret));
}

#[test]
fn cycle_is_an_error() {
  let wf = workflow(
    vec![
      node("start", "core.trigger.manual", json!({"x": 1})),
      node("a", "test.number.source", json!({})),
      node("b", "test.number.source", json!({})),
    ],
    vec![
      edge("e1", "start", "a"),
      edge("e2", "a", "b"),
      edge("e3", "b", "a"),
    ],
  );

  let report = validate(&wf, &registry());
  assert!(report.errors.iter().any(|i| i.kind == IssueKind::Cycle));
}

#[test]
fn two_triggers_are_rejected() {
  let wf = workflow(
    vec![
      node("t1", "core.trigger.manual", json!({"x": 1})),
      node("t2", "core.trigger.manual", json!({"x": 1})),
    ],
    vec![],
  );

  let report = validate(&wf, &registry());
  assert!(report
    .errors
    .iter()
    .any(|i| i.kind == IssueKind::EntrypointMultiple));
}
