//! Compiler tests: determinism, bindings, and signature stability.

use cordon_plan::{compile, CompileError, InputBinding};
use cordon_registry::{
  Capabilities, ComponentDefinition, ComponentRegistry, DataType, PortSpec, PrimitiveType,
};
use cordon_workflow::{EdgeDef, GraphDef, NodeDef, WorkflowDef};
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

  let mut transform = ComponentDefinition::inline("test.transform", "1.0.0");
  transform.inputs = vec![
    PortSpec::required("input", DataType::primitive(PrimitiveType::Json)),
    PortSpec::optional("factor", DataType::primitive(PrimitiveType::Number)),
  ];
  transform.outputs = vec![PortSpec::required(
    "output",
    DataType::primitive(PrimitiveType::Json),
  )];
  registry.register(transform).unwrap();

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

fn edge(id: &str, source: &str, target: &str, target_handle: Option<&str>) -> EdgeDef {
  EdgeDef {
    id: id.to_string(),
    source: source.to_string(),
    target: target.to_string(),
    source_handle: None,
    target_handle: target_handle.map(str::to_string),
  }
}

fn two_node_workflow() -> WorkflowDef {
  WorkflowDef {
    id: "wf-1".to_string(),
    name: "double".to_string(),
    description: String::new(),
    version: 1,
    graph: GraphDef {
      nodes: vec![
        node("start", "core.trigger.manual", json!({"x": 21})),
        node("double", "test.transform", json!({"factor": 2})),
      ],
      edges: vec![edge("e1", "start", "double", Some("input"))],
      viewport: None,
    },
  }
}

#[test]
fn compiles_bindings_for_edges_and_literals() {
  let plan = compile(&two_node_workflow(), &registry()).unwrap();

  assert_eq!(plan.entrypoint_ref, "start");
  assert_eq!(plan.actions.len(), 2);
  assert_eq!(plan.actions[0].node_ref, "start");

  let double = plan.action("double").unwrap();
  assert!(double.input_bindings.iter().any(|b| matches!(
    b,
    InputBinding::Edge { port_id, source_ref, source_port_id }
      if port_id == "input" && source_ref == "start" && source_port_id == "payload"
  )));
  assert!(double.input_bindings.iter().any(|b| matches!(
    b,
    InputBinding::Literal { port_id, value } if port_id == "factor" && value == &json!(2)
  )));
}

#[test]
fn identical_graphs_produce_identical_signatures() {
  let registry = registry();
  let a = compile(&two_node_workflow(), &registry).unwrap();
  let b = compile(&two_node_workflow(), &registry).unwrap();
  assert_eq!(a.signature, b.signature);

  // Changing a literal changes the signature.
  let mut wf = two_node_workflow();
  wf.graph.nodes[1]
    .params
    .insert("factor".to_string(), json!(3));
  let c = compile(&wf, &registry).unwrap();
  assert_ne!(a.signature, c.signature);
}

#[test]
fn conflicting_binding_fails() {
  let mut wf = two_node_workflow();
  // "input" is fed by the edge and by a literal.
  wf.graph.nodes[1]
    .params
    .insert("input".to_string(), json!({"x": 1}));

  let err = compile(&wf, &registry()).unwrap_err();
  assert!(matches!(err, CompileError::ConflictingBinding { .. }));
}

#[test]
fn unbound_required_input_fails() {
  let mut wf = two_node_workflow();
  wf.graph.edges.clear();

  let err = compile(&wf, &registry()).unwrap_err();
  assert!(matches!(err, CompileError::UnboundInput { .. }));
}

#[test]
fn peer_actions_order_by_node_id() {
  let mut wf = two_node_workflow();
  wf.graph.nodes.push(node("alpha", "test.transform", json!({"input": {"y": 1}})));

  let plan = compile(&wf, &registry()).unwrap();
  let refs: Vec<_> = plan.actions.iter().map(|a| a.node_ref.as_str()).collect();
  // "alpha" has no upstream, so it is ready alongside "start" and sorts first.
  assert_eq!(refs, vec!["alpha", "start", "double"]);
}
