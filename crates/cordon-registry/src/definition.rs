use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::types::{ParamSpec, PortSpec};

/// Pure function computing effective ports from node parameters.
///
/// Components with dynamic ports supply this instead of relying on runtime
/// reflection; the function must be deterministic for identical params.
pub type ResolvePortsFn = fn(&serde_json::Value) -> (Vec<PortSpec>, Vec<PortSpec>);

/// Image reference and default invocation for a container-hosted component.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
  /// Image reference, e.g. `ghcr.io/cordon/tools-nuclei:1.2`.
  pub image: String,
  /// Command exported to the container via `MCP_COMMAND`.
  pub command: String,
  /// Arguments exported via `MCP_ARGS` as a JSON array.
  pub args: Vec<String>,
  /// The tool server cannot service concurrent calls.
  pub non_reentrant: bool,
}

/// Which runtime executes the component.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerKind {
  Inline,
  Container(ContainerSpec),
}

/// Capability flags consulted by the validator and orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
  /// Invoked by agents through the tool gateway, not by the orchestrator.
  pub is_tool_mode: bool,
  /// Entry point of a workflow.
  pub is_trigger: bool,
  /// Terminal consumer of findings.
  pub is_sink: bool,
}

/// Registry entry describing one component, immutable after the seal.
#[derive(Debug, Clone)]
pub struct ComponentDefinition {
  /// Stable reference, e.g. `core.http.request`.
  pub id: String,
  /// Semver version string.
  pub version: String,
  pub inputs: Vec<PortSpec>,
  pub outputs: Vec<PortSpec>,
  pub parameters: Vec<ParamSpec>,
  pub runner: RunnerKind,
  pub retry_policy: RetryPolicy,
  pub capabilities: Capabilities,
  /// Optional dynamic-port resolver.
  pub resolve_ports: Option<ResolvePortsFn>,
  /// Identical plans may reuse cached outputs of deterministic components.
  pub deterministic: bool,
  /// Activation deadline; a per-run override or the engine default applies
  /// when unset.
  pub timeout: Option<Duration>,
}

impl ComponentDefinition {
  /// A minimal inline definition; callers fill in ports and flags.
  pub fn inline(id: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      version: version.into(),
      inputs: Vec::new(),
      outputs: Vec::new(),
      parameters: Vec::new(),
      runner: RunnerKind::Inline,
      retry_policy: RetryPolicy::default(),
      capabilities: Capabilities::default(),
      resolve_ports: None,
      deterministic: false,
      timeout: None,
    }
  }

  /// Effective input/output ports for the given node params.
  ///
  /// Static components return their declared ports; dynamic components run
  /// their resolver.
  pub fn effective_ports(&self, params: &serde_json::Value) -> (Vec<PortSpec>, Vec<PortSpec>) {
    match self.resolve_ports {
      Some(resolve) => resolve(params),
      None => (self.inputs.clone(), self.outputs.clone()),
    }
  }

  /// Look up a declared input port by id against effective ports.
  pub fn find_input<'a>(ports: &'a [PortSpec], id: &str) -> Option<&'a PortSpec> {
    ports.iter().find(|p| p.id == id)
  }
}
