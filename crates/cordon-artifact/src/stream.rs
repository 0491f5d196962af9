use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Which terminal stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStream {
  Stdout,
  Stderr,
}

impl TerminalStream {
  pub fn as_str(self) -> &'static str {
    match self {
      TerminalStream::Stdout => "stdout",
      TerminalStream::Stderr => "stderr",
    }
  }
}

/// One chunk of a captured terminal stream.
///
/// Chunks are ordinary artifacts; the monotone `index` preserves order when
/// the stream is reassembled for reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
  pub stream: TerminalStream,
  pub index: u64,
  pub digest: Digest,
  pub size_bytes: u64,
}
