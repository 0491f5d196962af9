//! Cordon Artifact
//!
//! Content-addressed storage for node inputs/outputs, terminal streams, and
//! binary artifacts. Artifacts are keyed by the SHA-256 of their bytes, so
//! identical content stores once and `put` is naturally idempotent; the
//! engine records `(run, node, port) -> digest` linkage separately.

mod digest;
mod fs;
mod memory;
mod stream;

pub use digest::{digest_bytes, Digest};
pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;
pub use stream::{StreamChunk, TerminalStream};

use async_trait::async_trait;
use bytes::Bytes;

/// Error type for artifact storage operations.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
  /// The requested digest was never stored.
  #[error("artifact not found: {0}")]
  NotFound(String),

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Metadata for one stored artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
  pub digest: Digest,
  pub media_type: String,
  pub size_bytes: u64,
}

/// Content-addressed artifact store.
///
/// Implementations provide the backend (filesystem, memory, object storage);
/// addressing and deduplication semantics are uniform: the digest is a pure
/// function of the bytes, and concurrent puts of identical bytes are safe.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
  /// Store bytes, returning their address. Idempotent.
  async fn put(&self, bytes: Bytes, media_type: &str) -> Result<StoredArtifact, ArtifactError>;

  /// Fetch bytes by digest.
  async fn get(&self, digest: &Digest) -> Result<Bytes, ArtifactError>;

  /// Whether a digest is present.
  async fn contains(&self, digest: &Digest) -> Result<bool, ArtifactError>;
}
