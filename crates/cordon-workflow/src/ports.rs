use cordon_registry::PortSpec;

use crate::workflow::EdgeDef;

/// Resolved port pair for one edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgePorts {
  pub source_port: String,
  pub target_port: String,
}

/// Why an edge's handles could not be resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum PortResolution {
  Resolved(EdgePorts),
  /// Handle names a port the component does not declare.
  UnknownSourcePort(String),
  UnknownTargetPort(String),
  /// Handle omitted but the component declares zero or several candidates.
  AmbiguousSource,
  AmbiguousTarget,
}

/// Resolve an edge's handles against the effective ports of its endpoints.
///
/// A missing handle defaults to the component's single declared port on that
/// side; anything else is ambiguous.
pub fn resolve_edge_ports(
  edge: &EdgeDef,
  source_outputs: &[PortSpec],
  target_inputs: &[PortSpec],
) -> PortResolution {
  let source_port = match &edge.source_handle {
    Some(handle) => {
      if source_outputs.iter().any(|p| &p.id == handle) {
        handle.clone()
      } else {
        return PortResolution::UnknownSourcePort(handle.clone());
      }
    }
    None => match source_outputs {
      [only] => only.id.clone(),
      _ => return PortResolution::AmbiguousSource,
    },
  };

  let target_port = match &edge.target_handle {
    Some(handle) => {
      if target_inputs.iter().any(|p| &p.id == handle) {
        handle.clone()
      } else {
        return PortResolution::UnknownTargetPort(handle.clone());
      }
    }
    None => match target_inputs {
      [only] => only.id.clone(),
      _ => return PortResolution::AmbiguousTarget,
    },
  };

  PortResolution::Resolved(EdgePorts {
    source_port,
    target_port,
  })
}
