use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// SHA-256 content address, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
  /// Wrap an already-computed hex digest.
  pub fn from_hex(hex: impl Into<String>) -> Self {
    Self(hex.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Shard prefix used for filesystem layout, e.g. `ab` of `abcd…`.
  pub fn shard(&self) -> &str {
    &self.0[..2.min(self.0.len())]
  }
}

impl std::fmt::Display for Digest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// Hash bytes into their content address.
pub fn digest_bytes(bytes: &[u8]) -> Digest {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  Digest(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn digest_is_a_pure_function_of_bytes() {
    assert_eq!(digest_bytes(b"hello"), digest_bytes(b"hello"));
    assert_ne!(digest_bytes(b"hello"), digest_bytes(b"world"));
  }

  #[test]
  fn known_vector() {
    assert_eq!(
      digest_bytes(b"").as_str(),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }
}
