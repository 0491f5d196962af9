//! Cordon Sink
//!
//! Streams structured findings from terminal sink nodes into a tenant-scoped
//! search index. Batches are normalized into documents keyed by
//! `(tenant, workflow, run, asset)` so re-indexing the same finding is an
//! upsert, not a duplicate.
//!
//! Failures are classified for the retry policy: transport and 5xx problems
//! are retryable, schema rejections are permanent.

mod component;
mod normalize;
mod sink;

pub use component::{findings_sink_def, FindingsSinkComponent};
pub use normalize::{normalize_item, FindingBatch};
pub use sink::{FindingsSink, SinkConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
  /// Network or cluster-side transient failure; counts against the
  /// component's retry policy.
  #[error("search cluster unavailable: {0}")]
  Retryable(String),

  /// The cluster rejected the documents; retrying cannot help.
  #[error("documents rejected by the search cluster: {0}")]
  Permanent(String),
}
