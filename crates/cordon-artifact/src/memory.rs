use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::digest::{digest_bytes, Digest};
use crate::{ArtifactError, ArtifactStore, StoredArtifact};

/// In-memory artifact store for tests and embedded runs.
#[derive(Default)]
pub struct MemoryArtifactStore {
  objects: Mutex<HashMap<Digest, (Bytes, String)>>,
}

impl MemoryArtifactStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
  async fn put(&self, bytes: Bytes, media_type: &str) -> Result<StoredArtifact, ArtifactError> {
    let digest = digest_bytes(&bytes);
    let size_bytes = bytes.len() as u64;
    self
      .objects
      .lock()
      .expect("artifact lock")
      .entry(digest.clone())
      .or_insert_with(|| (bytes, media_type.to_string()));
    Ok(StoredArtifact {
      digest,
      media_type: media_type.to_string(),
      size_bytes,
    })
  }

  async fn get(&self, digest: &Digest) -> Result<Bytes, ArtifactError> {
    self
      .objects
      .lock()
      .expect("artifact lock")
      .get(digest)
      .map(|(bytes, _)| bytes.clone())
      .ok_or_else(|| ArtifactError::NotFound(digest.to_string()))
  }

  async fn contains(&self, digest: &Digest) -> Result<bool, ArtifactError> {
    Ok(
      self
        .objects
        .lock()
        .expect("artifact lock")
        .contains_key(digest),
    )
  }
}
