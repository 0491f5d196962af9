//! Cordon Gateway
//!
//! Session-scoped mux between AI-agent components and the tool servers they
//! are allowed to reach. The orchestrator opens a [`ToolSession`] when an
//! agent attempt starts; the agent gets an opaque HMAC-signed bearer token
//! bound to `(run, node, session)` and speaks JSON-RPC 2.0 to the gateway
//! (`initialize`, `tools/list`, `tools/call`).
//!
//! Every call is verified three ways before it is forwarded: the token must
//! resolve to a live session, the session must cover the target tool's node,
//! and the arguments must validate against the tool's declared input schema.

mod gateway;
mod rpc;
mod server;
mod session;
mod token;

pub use gateway::{Gateway, ToolResolver};
pub use rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use server::{router, serve};
pub use session::{SessionHandle, ToolRegistration, ToolSession};
pub use token::{random_token, TokenSigner};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
  #[error("bearer token is missing or invalid")]
  InvalidToken,

  #[error("session expired")]
  SessionExpired,

  #[error("session does not permit tool '{tool}'")]
  NotPermitted { tool: String },

  #[error("unknown tool '{tool}'")]
  UnknownTool { tool: String },

  #[error("arguments do not validate: {message}")]
  InvalidArguments { message: String },

  #[error("tool endpoint failed: {message}")]
  Upstream { message: String },

  #[error("tool resolution failed: {message}")]
  Resolution { message: String },
}
