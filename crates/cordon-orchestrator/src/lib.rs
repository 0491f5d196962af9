//! Cordon Orchestrator
//!
//! Drives runs through their execution plans durably. The orchestrator
//! activates ready nodes under a bounded per-run concurrency, applies retry
//! policies with exponential backoff, parks suspended nodes until their wait
//! token is signalled, records every transition as both an event and a
//! `NodeExecution` update, and recovers in-flight runs after a crash by
//! replaying persisted state.

mod driver;
mod error;
mod orchestrator;

pub use error::OrchestratorError;
pub use orchestrator::{
  NodeIoView, Orchestrator, OrchestratorConfig, RunnerSet,
};
