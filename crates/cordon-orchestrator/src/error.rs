use cordon_workflow::ValidationReport;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
  #[error("workflow not found: {0}")]
  WorkflowNotFound(String),

  #[error("workflow failed validation with {} error(s)", .report.errors.len())]
  Validation { report: ValidationReport },

  #[error(transparent)]
  Compile(#[from] cordon_plan::CompileError),

  #[error("run not found: {0}")]
  RunNotFound(String),

  #[error("run '{0}' is not active")]
  RunNotActive(String),

  #[error("approval token not found")]
  ApprovalNotFound,

  #[error("approval token already used")]
  ApprovalAlreadyDecided,

  #[error("decision does not match the presented token")]
  DecisionMismatch,

  #[error(transparent)]
  Store(#[from] cordon_store::StoreError),

  #[error(transparent)]
  Event(#[from] cordon_events::EventError),

  #[error(transparent)]
  Artifact(#[from] cordon_artifact::ArtifactError),

  #[error("internal orchestrator error: {0}")]
  Internal(String),
}
