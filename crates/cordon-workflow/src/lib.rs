//! Cordon Workflow
//!
//! User-authored workflow graphs: serializable definition types, the
//! adjacency structure used for traversal, and the validator that checks a
//! graph against the component registry before compilation.
//!
//! The validator never fails on user-caused issues; it collects every error
//! and warning into a [`ValidationReport`] and returns them together.

mod graph;
mod ports;
mod secret;
mod validate;
mod workflow;

pub use graph::{Graph, GraphError};
pub use ports::{resolve_edge_ports, EdgePorts, PortResolution};
pub use secret::looks_like_raw_credential;
pub use validate::{validate, IssueKind, ValidationIssue, ValidationReport};
pub use workflow::{EdgeDef, GraphDef, NodeDef, WorkflowDef};
