use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kind::ErrorKind;

/// Retry policy attached to a component definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
  /// Total attempts, including the first.
  pub max_attempts: u32,
  /// Delay before the second attempt.
  #[serde(with = "duration_millis")]
  pub initial_backoff: Duration,
  /// Upper bound on the computed delay.
  #[serde(with = "duration_millis")]
  pub max_backoff: Duration,
  /// Exponential multiplier applied per attempt.
  pub multiplier: f64,
  /// Kinds that are never retried for this component.
  #[serde(default)]
  pub non_retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_backoff: Duration::from_millis(500),
      max_backoff: Duration::from_secs(60),
      multiplier: 2.0,
      non_retryable_kinds: Vec::new(),
    }
  }
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  /// Whether a failure of `kind` on attempt `attempt` (1-based) may retry.
  pub fn allows_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
    attempt < self.max_attempts && !kind.terminal() && !self.non_retryable_kinds.contains(&kind)
  }

  /// Backoff delay before attempt `attempt + 1`, given `attempt` just failed.
  ///
  /// `min(initial * multiplier^(attempt-1), max_backoff)`; rate-limit
  /// failures take one extra multiplier step.
  pub fn backoff(&self, attempt: u32, kind: ErrorKind) -> Duration {
    let mut exponent = attempt.saturating_sub(1);
    if kind.extended_backoff() {
      exponent += 1;
    }
    let factor = self.multiplier.powi(exponent as i32);
    let delay = self.initial_backoff.mul_f64(factor.max(1.0));
    delay.min(self.max_backoff)
  }
}

mod duration_millis {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let millis = u64::deserialize(d)?;
    Ok(Duration::from_millis(millis))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy() -> RetryPolicy {
    RetryPolicy {
      max_attempts: 5,
      initial_backoff: Duration::from_millis(100),
      max_backoff: Duration::from_millis(1500),
      multiplier: 2.0,
      non_retryable_kinds: vec![ErrorKind::Authentication],
    }
  }

  #[test]
  fn backoff_doubles_then_caps() {
    let p = policy();
    assert_eq!(p.backoff(1, ErrorKind::Network), Duration::from_millis(100));
    assert_eq!(p.backoff(2, ErrorKind::Network), Duration::from_millis(200));
    assert_eq!(p.backoff(3, ErrorKind::Network), Duration::from_millis(400));
    // 100 * 2^5 = 3200 exceeds the cap
    assert_eq!(p.backoff(6, ErrorKind::Network), Duration::from_millis(1500));
  }

  #[test]
  fn rate_limit_takes_an_extra_step() {
    let p = policy();
    assert_eq!(
      p.backoff(1, ErrorKind::RateLimit),
      Duration::from_millis(200)
    );
  }

  #[test]
  fn retry_respects_max_attempts_and_kinds() {
    let p = policy();
    assert!(p.allows_retry(1, ErrorKind::Network));
    assert!(p.allows_retry(4, ErrorKind::Network));
    assert!(!p.allows_retry(5, ErrorKind::Network));
    assert!(!p.allows_retry(1, ErrorKind::Authentication));
    assert!(!p.allows_retry(1, ErrorKind::Cancel));
  }
}
