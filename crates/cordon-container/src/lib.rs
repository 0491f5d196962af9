//! Cordon Container
//!
//! Runs container-hosted tool servers: creates containers from validated
//! image references, passes the bootstrap environment (`MCP_COMMAND`,
//! `MCP_ARGS`, just-in-time secrets), polls `/health` until ready, proxies
//! JSON-RPC to the server, and streams stdout/stderr into the artifact
//! store as ordered chunks.
//!
//! Warm containers are pooled by `(image, command, env digest)` and reused
//! across attempts; unhealthy containers are torn down instead of returned.

mod image;
mod pool;
mod runner;

pub use image::{validate_container_id, validate_image_ref, ImagePolicy};
pub use pool::{PoolKey, WarmContainer, WarmPool};
pub use runner::{ContainerRunner, ContainerRunnerConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
  #[error("image reference rejected: {0}")]
  ImageRejected(String),

  #[error("container engine error: {0}")]
  Engine(#[from] bollard::errors::Error),

  #[error("container '{container_id}' failed health check: {message}")]
  Unhealthy {
    container_id: String,
    message: String,
  },
}
