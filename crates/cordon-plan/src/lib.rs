//! Cordon Plan
//!
//! Compiles a validated workflow graph into an immutable, topologically
//! ordered execution plan. Plans are deterministic: identical graphs produce
//! identical plans, and the plan signature (SHA-256 over canonical JSON)
//! makes that equality observable so cached artifacts can be reused.

mod canonical;
mod compile;
mod plan;

pub use canonical::canonical_json;
pub use compile::{compile, CompileError};
pub use plan::{ExecutionPlan, InputBinding, PlannedAction};
