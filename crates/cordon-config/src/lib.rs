//! Cordon Config
//!
//! Engine configuration read once at startup from environment variables.
//! Nothing here is global: the binary parses an [`EngineConfig`] and hands
//! pieces of it to the services it constructs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid value for {key}: {message}")]
  Invalid { key: String, message: String },
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Database connection URL.
  pub database_url: String,
  /// Search cluster for the analytics sink, with optional basic auth.
  pub search_url: Option<String>,
  pub search_username: Option<String>,
  pub search_password: Option<String>,
  /// Container engine socket path or remote endpoint.
  pub docker_endpoint: Option<String>,
  /// How long terminal-run events are kept before pruning.
  pub event_retention: Duration,
  /// Default bound on concurrent activations per run.
  pub max_in_flight: usize,
  /// Interval between activation heartbeats.
  pub heartbeat_interval: Duration,
  /// HMAC secret for gateway bearer tokens; generated per-process if unset.
  pub token_secret: Option<String>,
  /// Bind address for the tool gateway.
  pub gateway_addr: SocketAddr,
  /// Images the container runner may launch without elevated capability.
  pub image_allow_list: Vec<String>,
  /// Data directory for artifacts and the default database.
  pub data_dir: Option<PathBuf>,
}

impl EngineConfig {
  /// Read configuration from the process environment.
  pub fn from_env() -> Result<Self, ConfigError> {
    Ok(Self {
      database_url: var("DATABASE_URL")
        .unwrap_or_else(|| "sqlite://cordon.db?mode=rwc".to_string()),
      search_url: var("CORDON_SEARCH_URL"),
      search_username: var("CORDON_SEARCH_USERNAME"),
      search_password: var("CORDON_SEARCH_PASSWORD"),
      docker_endpoint: var("CORDON_DOCKER_ENDPOINT"),
      event_retention: Duration::from_secs(
        parse("CORDON_EVENT_RETENTION_DAYS", 30u64)? * 24 * 60 * 60,
      ),
      max_in_flight: parse("CORDON_MAX_IN_FLIGHT", 8usize)?,
      heartbeat_interval: Duration::from_secs(parse("CORDON_HEARTBEAT_SECS", 10u64)?),
      token_secret: var("CORDON_TOKEN_SECRET"),
      gateway_addr: parse("CORDON_GATEWAY_ADDR", "127.0.0.1:8474".parse().unwrap())?,
      image_allow_list: var("CORDON_IMAGE_ALLOW_LIST")
        .map(|v| {
          v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
        })
        .unwrap_or_default(),
      data_dir: var("CORDON_DATA_DIR").map(PathBuf::from),
    })
  }
}

fn var(key: &str) -> Option<String> {
  std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
  T: std::str::FromStr,
  T::Err: std::fmt::Display,
{
  match var(key) {
    Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
      key: key.to_string(),
      message: e.to_string(),
    }),
    None => Ok(default),
  }
}
