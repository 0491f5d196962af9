//! Cordon Trigger
//!
//! The three ways a run starts: a user submits one manually, a cron schedule
//! fires under a leader lease, or a verified webhook delivery arrives. All
//! of them produce the same [`RunRequest`] envelope and hand it to a
//! [`RunSubmitter`]; everything downstream is identical.

mod request;
mod scheduler;
mod webhook;

pub use request::{RunRequest, RunSubmitter, SubmitError, TriggerKind};
pub use scheduler::{CronScheduler, SchedulerConfig};
pub use webhook::{WebhookIntake, WebhookSource};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriggerError {
  #[error("unknown webhook source '{0}'")]
  UnknownSource(String),

  #[error("webhook signature verification failed")]
  InvalidSignature,

  #[error("invalid cron expression '{expression}': {message}")]
  InvalidCron { expression: String, message: String },

  #[error(transparent)]
  Store(#[from] cordon_store::StoreError),

  #[error(transparent)]
  Submit(#[from] SubmitError),
}
