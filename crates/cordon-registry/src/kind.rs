use serde::{Deserialize, Serialize};

/// Classification of a component or engine failure.
///
/// The kind decides retry behavior: the orchestrator consults the component's
/// retry policy and the `retryable` flag on the failure itself, and some
/// kinds are never retried regardless of policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
  /// Graph or parameter issue. Never retried; reported to the submitter.
  Validation,
  /// Missing or invalid component configuration.
  Configuration,
  /// Upstream service rejected credentials.
  Authentication,
  /// Activation deadline exceeded.
  Timeout,
  /// Transient network failure.
  Network,
  /// Upstream 5xx response.
  #[serde(rename = "5xx")]
  Upstream5xx,
  /// Upstream throttling; retried with extended backoff.
  RateLimit,
  /// Container failed to become healthy.
  Startup,
  /// Heartbeat missed; the attempt is presumed dead.
  Lost,
  /// Cooperative cancellation.
  Cancel,
  /// The attempt ignored cancellation past the grace period.
  CancelTimeout,
  /// Engine-level defect.
  Internal,
}

impl ErrorKind {
  /// Kinds that terminate the node regardless of the retry policy.
  pub fn terminal(self) -> bool {
    matches!(
      self,
      ErrorKind::Validation
        | ErrorKind::Configuration
        | ErrorKind::Authentication
        | ErrorKind::Cancel
        | ErrorKind::CancelTimeout
        | ErrorKind::Internal
    )
  }

  /// Rate-limit failures back off further than the policy multiplier alone.
  pub fn extended_backoff(self) -> bool {
    matches!(self, ErrorKind::RateLimit)
  }
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      ErrorKind::Validation => "validation",
      ErrorKind::Configuration => "configuration",
      ErrorKind::Authentication => "authentication",
      ErrorKind::Timeout => "timeout",
      ErrorKind::Network => "network",
      ErrorKind::Upstream5xx => "5xx",
      ErrorKind::RateLimit => "rate-limit",
      ErrorKind::Startup => "startup",
      ErrorKind::Lost => "lost",
      ErrorKind::Cancel => "cancel",
      ErrorKind::CancelTimeout => "cancel-timeout",
      ErrorKind::Internal => "internal",
    };
    f.write_str(s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn serializes_kebab_case() {
    assert_eq!(
      serde_json::to_string(&ErrorKind::RateLimit).unwrap(),
      "\"rate-limit\""
    );
    assert_eq!(
      serde_json::to_string(&ErrorKind::Upstream5xx).unwrap(),
      "\"5xx\""
    );
  }

  #[test]
  fn terminal_kinds_are_never_retryable() {
    assert!(ErrorKind::Cancel.terminal());
    assert!(ErrorKind::Internal.terminal());
    assert!(!ErrorKind::Network.terminal());
    assert!(!ErrorKind::Lost.terminal());
  }
}
