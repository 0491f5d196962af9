use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Warm-pool key: a container is reusable only for the exact same image,
/// command, and environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
  pub image: String,
  pub command: String,
  pub env_digest: String,
}

impl PoolKey {
  /// Build a key, collapsing the environment (secrets included) to a digest
  /// so the key itself never carries secret material.
  pub fn new(image: &str, command: &str, env: &[String]) -> Self {
    let mut sorted = env.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    for entry in &sorted {
      hasher.update(entry.as_bytes());
      hasher.update([0]);
    }
    Self {
      image: image.to_string(),
      command: command.to_string(),
      env_digest: hex::encode(hasher.finalize()),
    }
  }
}

/// A warm container ready for reuse.
#[derive(Debug, Clone)]
pub struct WarmContainer {
  pub container_id: String,
  pub endpoint: String,
}

/// Per-component warm container cache.
#[derive(Default)]
pub struct WarmPool {
  containers: Mutex<HashMap<PoolKey, Vec<WarmContainer>>>,
}

impl WarmPool {
  pub fn new() -> Self {
    Self::default()
  }

  /// Take a warm container if one is available.
  pub async fn take(&self, key: &PoolKey) -> Option<WarmContainer> {
    self.containers.lock().await.get_mut(key)?.pop()
  }

  /// Return a healthy container to the pool.
  pub async fn put(&self, key: PoolKey, container: WarmContainer) {
    self
      .containers
      .lock()
      .await
      .entry(key)
      .or_default()
      .push(container);
  }

  /// Drain every pooled container (shutdown or run teardown).
  pub async fn drain(&self) -> Vec<WarmContainer> {
    let mut containers = self.containers.lock().await;
    containers.drain().flat_map(|(_, list)| list).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn key_hides_env_but_distinguishes_it() {
    let a = PoolKey::new("img", "cmd", &["A=1".to_string(), "SECRET=x".to_string()]);
    let b = PoolKey::new("img", "cmd", &["SECRET=x".to_string(), "A=1".to_string()]);
    let c = PoolKey::new("img", "cmd", &["SECRET=y".to_string(), "A=1".to_string()]);

    // order-insensitive, value-sensitive
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(!a.env_digest.contains('x'));
  }

  #[tokio::test]
  async fn take_put_round_trip() {
    let pool = WarmPool::new();
    let key = PoolKey::new("img", "cmd", &[]);

    assert!(pool.take(&key).await.is_none());
    pool
      .put(
        key.clone(),
        WarmContainer {
          container_id: "c1".to_string(),
          endpoint: "http://127.0.0.1:9000".to_string(),
        },
      )
      .await;

    let taken = pool.take(&key).await.unwrap();
    assert_eq!(taken.container_id, "c1");
    assert!(pool.take(&key).await.is_none());
  }
}
