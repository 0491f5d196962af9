use std::sync::Arc;

use async_trait::async_trait;
use cordon_registry::{
  Capabilities, ComponentDefinition, DataType, ErrorKind, ParamKind, ParamSpec, PortSpec,
};
use cordon_runner::{ExecutionContext, InlineComponent, Outcome, Success};
use serde_json::{json, Map, Value};

use crate::normalize::FindingBatch;
use crate::sink::FindingsSink;
use crate::SinkError;

/// Definition for the built-in findings sink component.
pub fn findings_sink_def() -> ComponentDefinition {
  let mut def = ComponentDefinition::inline("core.sink.findings", "1.0.0");
  def.capabilities = Capabilities {
    is_sink: true,
    ..Capabilities::default()
  };
  def.inputs = vec![PortSpec {
    id: "findings".to_string(),
    data_type: DataType::List {
      element: Box::new(DataType::contract("finding")),
    },
    required: true,
    allow_any: true,
    connection_type: cordon_registry::ConnectionType::Main,
  }];
  def.outputs = vec![PortSpec::optional(
    "summary",
    DataType::primitive(cordon_registry::PrimitiveType::Json),
  )];
  def.parameters = vec![ParamSpec::new("workflow_id", "Workflow", ParamKind::Text)];
  def
}

/// Inline component wrapping the sink client.
pub struct FindingsSinkComponent {
  sink: Arc<FindingsSink>,
  workflow_id: String,
}

impl FindingsSinkComponent {
  pub fn new(sink: Arc<FindingsSink>, workflow_id: impl Into<String>) -> Self {
    Self {
      sink,
      workflow_id: workflow_id.into(),
    }
  }
}

#[async_trait]
impl InlineComponent for FindingsSinkComponent {
  async fn execute(
    &self,
    inputs: Map<String, Value>,
    params: Map<String, Value>,
    ctx: ExecutionContext,
  ) -> Outcome {
    let items = match inputs.get("findings") {
      Some(Value::Array(items)) => items.clone(),
      Some(single) => vec![single.clone()],
      None => Vec::new(),
    };

    let workflow_id = params
      .get("workflow_id")
      .and_then(Value::as_str)
      .unwrap_or(&self.workflow_id)
      .to_string();

    let batch = FindingBatch {
      tenant_id: ctx.tenant_id.clone(),
      workflow_id,
      run_id: ctx.run_id.clone(),
      node_ref: ctx.node_ref.clone(),
      items,
    };

    match self.sink.index(&batch).await {
      Ok(indexed) => {
        ctx
          .logger
          .info(&format!("indexed {indexed} findings"))
          .await;
        Outcome::Success(Success::single("summary", json!({"indexed": indexed})))
      }
      Err(SinkError::Retryable(message)) => {
        Outcome::failure(ErrorKind::Network, message, true)
      }
      Err(SinkError::Permanent(message)) => {
        Outcome::failure(ErrorKind::Validation, message, false)
      }
    }
  }
}
