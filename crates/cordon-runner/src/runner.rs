use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cordon_registry::ComponentDefinition;
use tracing::{instrument, warn};

use crate::component::InlineComponent;
use crate::context::ExecutionContext;
use crate::outcome::{Failure, Outcome};

/// One attempt at executing one node within a run.
#[derive(Clone)]
pub struct Activation {
  pub run_id: String,
  pub node_ref: String,
  pub component: Arc<ComponentDefinition>,
  pub params: serde_json::Map<String, serde_json::Value>,
  /// One value per satisfied input port.
  pub inputs: serde_json::Map<String, serde_json::Value>,
  pub attempt: u32,
  /// Completion payload when the node is re-activated after a suspension.
  pub resume: Option<serde_json::Value>,
}

/// Executes activations. Implementations: inline (same process) and
/// container (tool servers).
#[async_trait]
pub trait Runner: Send + Sync {
  async fn run(&self, activation: Activation, ctx: ExecutionContext) -> Outcome;
}

/// Runs in-process components registered by id.
///
/// Enforces the activation timeout and cancellation; the component itself
/// only has to be a well-behaved future.
#[derive(Default)]
pub struct InlineRunner {
  components: HashMap<String, Arc<dyn InlineComponent>>,
}

impl InlineRunner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Bind an implementation to a component id.
  pub fn bind(&mut self, component_id: impl Into<String>, component: Arc<dyn InlineComponent>) {
    self.components.insert(component_id.into(), component);
  }

  pub fn has(&self, component_id: &str) -> bool {
    self.components.contains_key(component_id)
  }
}

#[async_trait]
impl Runner for InlineRunner {
  #[instrument(
    name = "inline_run",
    skip(self, activation, ctx),
    fields(
      run_id = %activation.run_id,
      node_ref = %activation.node_ref,
      component_id = %activation.component.id,
      attempt = activation.attempt,
    )
  )]
  async fn run(&self, activation: Activation, ctx: ExecutionContext) -> Outcome {
    let Some(component) = self.components.get(&activation.component.id) else {
      return Outcome::Failure(Failure::new(
        cordon_registry::ErrorKind::Configuration,
        format!("no inline implementation bound for '{}'", activation.component.id),
        false,
      ));
    };

    let timeout = ctx.timeout;
    let cancel = ctx.cancel.clone();
    // `resume` rides in as a reserved input so components see one interface.
    let mut inputs = activation.inputs;
    if let Some(resume) = activation.resume {
      inputs.insert(crate::builtins::RESUME_INPUT.to_string(), resume);
    }

    let execute = component.execute(inputs, activation.params, ctx);

    tokio::select! {
      outcome = tokio::time::timeout(timeout, execute) => match outcome {
        Ok(outcome) => outcome,
        Err(_) => {
          warn!(timeout_ms = timeout.as_millis() as u64, "activation timed out");
          Outcome::Failure(Failure::timeout(format!(
            "activation exceeded {}ms",
            timeout.as_millis()
          )))
        }
      },
      _ = cancel.cancelled() => Outcome::Failure(Failure::cancelled()),
    }
  }
}
