use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::digest::{digest_bytes, Digest};
use crate::{ArtifactError, ArtifactStore, StoredArtifact};

/// Filesystem-backed artifact store.
///
/// Layout: `{root}/{shard}/{digest}` where shard is the first two hex chars.
/// Writes land in a temp file first and are renamed into place, so a
/// concurrent `put` of the same bytes is safe and re-puts are free.
pub struct FsArtifactStore {
  root: PathBuf,
}

impl FsArtifactStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn path_for(&self, digest: &Digest) -> PathBuf {
    self.root.join(digest.shard()).join(digest.as_str())
  }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
  async fn put(&self, bytes: Bytes, media_type: &str) -> Result<StoredArtifact, ArtifactError> {
    let digest = digest_bytes(&bytes);
    let path = self.path_for(&digest);

    if fs::try_exists(&path).await? {
      return Ok(StoredArtifact {
        digest,
        media_type: media_type.to_string(),
        size_bytes: bytes.len() as u64,
      });
    }

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    let mut file = File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    drop(file);
    fs::rename(&tmp, &path).await?;

    Ok(StoredArtifact {
      digest,
      media_type: media_type.to_string(),
      size_bytes: bytes.len() as u64,
    })
  }

  async fn get(&self, digest: &Digest) -> Result<Bytes, ArtifactError> {
    let path = self.path_for(digest);
    match fs::read(&path).await {
      Ok(bytes) => Ok(Bytes::from(bytes)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        Err(ArtifactError::NotFound(digest.to_string()))
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn contains(&self, digest: &Digest) -> Result<bool, ArtifactError> {
    Ok(fs::try_exists(self.path_for(digest)).await?)
  }
}
