use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
  Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
  StartContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use cordon_artifact::{ArtifactStore, StreamChunk, TerminalStream};
use cordon_events::{EventKind, StreamHub};
use cordon_gateway::{GatewayError, ToolRegistration, ToolResolver};
use cordon_registry::{ComponentDefinition, ContainerSpec, ErrorKind, RunnerKind};
use cordon_runner::{Activation, ExecutionContext, Failure, Outcome, Runner, Success};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::image::ImagePolicy;
use crate::pool::{PoolKey, WarmContainer, WarmPool};
use crate::ContainerError;

/// Port the tool server must listen on inside the container.
const TOOL_PORT: u16 = 8080;

/// Deadline for a container to become healthy after start.
const HEALTH_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ContainerRunnerConfig {
  pub policy: ImagePolicy,
  /// Tenants with this flag may launch images outside the allow-list.
  pub elevated_tenants: Vec<String>,
}

/// Executes container-hosted components and serves as the tool resolver for
/// agent sessions.
pub struct ContainerRunner {
  docker: Docker,
  pool: WarmPool,
  http: reqwest::Client,
  config: ContainerRunnerConfig,
  artifacts: Arc<dyn ArtifactStore>,
  hub: Arc<StreamHub>,
}

impl ContainerRunner {
  /// Connect to the local container engine (or `endpoint` when given).
  pub fn connect(
    endpoint: Option<&str>,
    config: ContainerRunnerConfig,
    artifacts: Arc<dyn ArtifactStore>,
    hub: Arc<StreamHub>,
  ) -> Result<Self, ContainerError> {
    let docker = match endpoint {
      Some(endpoint) if endpoint.starts_with("http") => {
        Docker::connect_with_http(endpoint, 30, bollard::API_DEFAULT_VERSION)?
      }
      Some(socket) => Docker::connect_with_socket(socket, 30, bollard::API_DEFAULT_VERSION)?,
      None => Docker::connect_with_local_defaults()?,
    };

    Ok(Self {
      docker,
      pool: WarmPool::new(),
      http: reqwest::Client::new(),
      config,
      artifacts,
      hub,
    })
  }

  /// Take a warm container or launch a fresh one.
  async fn acquire(
    &self,
    spec: &ContainerSpec,
    env: Vec<String>,
    elevated: bool,
  ) -> Result<(PoolKey, WarmContainer), ContainerError> {
    if !self.config.policy.permits(&spec.image, elevated) {
      return Err(ContainerError::ImageRejected(spec.image.clone()));
    }

    let key = PoolKey::new(&spec.image, &spec.command, &env);
    while let Some(container) = self.pool.take(&key).await {
      if self.healthy(&container.endpoint).await {
        return Ok((key, container));
      }
      self.remove(&container.container_id).await;
    }

    let container = self.launch(spec, env).await?;
    Ok((key, container))
  }

  async fn launch(
    &self,
    spec: &ContainerSpec,
    mut env: Vec<String>,
  ) -> Result<WarmContainer, ContainerError> {
    let name = format!("cordon-{}", &Uuid::new_v4().simple().to_string()[..12]);
    let exposed = format!("{TOOL_PORT}/tcp");

    env.push(format!("MCP_COMMAND={}", spec.command));
    env.push(format!(
      "MCP_ARGS={}",
      serde_json::to_string(&spec.args).unwrap_or_else(|_| "[]".to_string())
    ));

    let host_config = HostConfig {
      port_bindings: Some(HashMap::from([(
        exposed.clone(),
        Some(vec![PortBinding {
          host_ip: Some("127.0.0.1".to_string()),
          // 0 asks the engine for a free host port
          host_port: Some("0".to_string()),
        }]),
      )])),
      auto_remove: Some(true),
      ..Default::default()
    };

    self
      .docker
      .create_container(
        Some(CreateContainerOptions {
          name: name.as_str(),
          platform: None,
        }),
        Config {
          image: Some(spec.image.clone()),
          env: Some(env),
          exposed_ports: Some(HashMap::from([(exposed.clone(), HashMap::new())])),
          host_config: Some(host_config),
          ..Default::default()
        },
      )
      .await?;

    self
      .docker
      .start_container(&name, None::<StartContainerOptions<String>>)
      .await?;

    let endpoint = match self.mapped_endpoint(&name, &exposed).await {
      Ok(endpoint) => endpoint,
      Err(e) => {
        self.remove(&name).await;
        return Err(e);
      }
    };

    // Poll /health until the server reports ready or the deadline passes.
    let deadline = tokio::time::Instant::now() + HEALTH_DEADLINE;
    loop {
      if self.healthy(&endpoint).await {
        break;
      }
      if tokio::time::Instant::now() >= deadline {
        self.remove(&name).await;
        return Err(ContainerError::Unhealthy {
          container_id: name,
          message: format!("not ready within {}s", HEALTH_DEADLINE.as_secs()),
        });
      }
      tokio::time::sleep(Duration::from_millis(500)).await;
    }

    info!(container = %name, endpoint = %endpoint, image = %spec.image, "tool server ready");
    Ok(WarmContainer {
      container_id: name,
      endpoint,
    })
  }

  async fn mapped_endpoint(&self, name: &str, exposed: &str) -> Result<String, ContainerError> {
    let inspect = self.docker.inspect_container(name, None).await?;
    let host_port = inspect
      .network_settings
      .and_then(|ns| ns.ports)
      .and_then(|ports| ports.get(exposed).cloned().flatten())
      .and_then(|bindings| bindings.into_iter().next())
      .and_then(|binding| binding.host_port)
      .ok_or_else(|| ContainerError::Unhealthy {
        container_id: name.to_string(),
        message: "no host port bound".to_string(),
      })?;
    Ok(format!("http://127.0.0.1:{host_port}"))
  }

  async fn healthy(&self, endpoint: &str) -> bool {
    match self
      .http
      .get(format!("{endpoint}/health"))
      .timeout(Duration::from_secs(2))
      .send()
      .await
    {
      Ok(response) if response.status().is_success() => response
        .json::<Value>()
        .await
        .map(|body| health_ready(&body))
        .unwrap_or(false),
      _ => false,
    }
  }

  async fn remove(&self, container_id: &str) {
    if let Err(e) = self
      .docker
      .remove_container(
        container_id,
        Some(RemoveContainerOptions {
          force: true,
          ..Default::default()
        }),
      )
      .await
    {
      warn!(container = container_id, error = %e, "failed to remove container");
    }
  }

  /// Return a container to the pool when still healthy, tear it down
  /// otherwise.
  async fn release(&self, key: PoolKey, container: WarmContainer) {
    if self.healthy(&container.endpoint).await {
      self.pool.put(key, container).await;
    } else {
      self.remove(&container.container_id).await;
    }
  }

  /// Tear down every pooled container (shutdown or run teardown).
  pub async fn teardown(&self) {
    for container in self.pool.drain().await {
      self.remove(&container.container_id).await;
    }
  }

  /// Stream the container's stdout/stderr into the artifact store, emitting
  /// an ordered `stream.chunk` event per chunk.
  fn capture_logs(
    &self,
    run_id: String,
    node_ref: String,
    container_id: String,
  ) -> tokio::task::JoinHandle<()> {
    let docker = self.docker.clone();
    let artifacts = self.artifacts.clone();
    let hub = self.hub.clone();

    tokio::spawn(async move {
      let mut stream = docker.logs(
        &container_id,
        Some(LogsOptions::<String> {
          follow: true,
          stdout: true,
          stderr: true,
          ..Default::default()
        }),
      );

      let mut stdout_index = 0u64;
      let mut stderr_index = 0u64;
      while let Some(item) = stream.next().await {
        let (terminal, message) = match item {
          Ok(LogOutput::StdOut { message }) => (TerminalStream::Stdout, message),
          Ok(LogOutput::StdErr { message }) => (TerminalStream::Stderr, message),
          Ok(_) => continue,
          Err(_) => break,
        };
        if message.is_empty() {
          continue;
        }

        let index = match terminal {
          TerminalStream::Stdout => {
            stdout_index += 1;
            stdout_index
          }
          TerminalStream::Stderr => {
            stderr_index += 1;
            stderr_index
          }
        };

        let stored = match artifacts.put(Bytes::from(message.to_vec()), "text/plain").await {
          Ok(stored) => stored,
          Err(e) => {
            warn!(error = %e, "failed to store terminal chunk");
            continue;
          }
        };
        let chunk = StreamChunk {
          stream: terminal,
          index,
          digest: stored.digest,
          size_bytes: stored.size_bytes,
        };
        if let Err(e) = hub
          .append(
            &run_id,
            Some(&node_ref),
            EventKind::StreamChunk,
            serde_json::to_value(&chunk).unwrap_or(Value::Null),
          )
          .await
        {
          warn!(error = %e, "failed to append stream.chunk event");
        }
      }
    })
  }

  /// Secrets in the component env arrive as `secret:NAME` references and are
  /// resolved from the worker environment just-in-time. Values never land in
  /// params, logs, or pool keys.
  fn resolve_env(params: &serde_json::Map<String, Value>) -> Vec<String> {
    params
      .get("env")
      .and_then(Value::as_object)
      .map(|env| {
        env
          .iter()
          .filter_map(|(key, value)| {
            let raw = value.as_str()?;
            let resolved = match raw.strip_prefix("secret:") {
              Some(reference) => std::env::var(reference).ok()?,
              None => raw.to_string(),
            };
            Some(format!("{key}={resolved}"))
          })
          .collect()
      })
      .unwrap_or_default()
  }

  async fn invoke(
    &self,
    endpoint: &str,
    activation: &Activation,
    ctx: &ExecutionContext,
  ) -> Result<Value, Failure> {
    let request = json!({
      "jsonrpc": "2.0",
      "id": ctx.idempotency_key,
      "method": "invoke",
      "params": {
        "inputs": activation.inputs,
        "params": activation.params,
        "idempotency_key": ctx.idempotency_key,
      },
    });

    let response = self
      .http
      .post(format!("{endpoint}/rpc"))
      .timeout(ctx.timeout)
      .json(&request)
      .send()
      .await
      .map_err(|e| {
        if e.is_timeout() {
          Failure::timeout(e.to_string())
        } else {
          Failure::new(ErrorKind::Network, e.to_string(), true)
        }
      })?;

    let body: Value = response
      .json()
      .await
      .map_err(|e| Failure::new(ErrorKind::Network, e.to_string(), true))?;

    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
      return Err(Failure::new(
        ErrorKind::Upstream5xx,
        format!("tool server error: {error}"),
        true,
      ));
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
  }
}

/// Parse the bootstrap health shape: `{status:"ok", servers:[{ready}]}`.
fn health_ready(body: &Value) -> bool {
  if body.get("status").and_then(Value::as_str) != Some("ok") {
    return false;
  }
  match body.get("servers").and_then(Value::as_array) {
    Some(servers) => servers
      .iter()
      .all(|s| s.get("ready").and_then(Value::as_bool).unwrap_or(false)),
    None => true,
  }
}

#[async_trait]
impl Runner for ContainerRunner {
  #[instrument(
    name = "container_run",
    skip(self, activation, ctx),
    fields(
      run_id = %activation.run_id,
      node_ref = %activation.node_ref,
      component_id = %activation.component.id,
      attempt = activation.attempt,
    )
  )]
  async fn run(&self, activation: Activation, ctx: ExecutionContext) -> Outcome {
    let RunnerKind::Container(spec) = &activation.component.runner else {
      return Outcome::failure(
        ErrorKind::Configuration,
        format!("component '{}' is not container-hosted", activation.component.id),
        false,
      );
    };

    let env = Self::resolve_env(&activation.params);
    let elevated = self
      .config
      .elevated_tenants
      .iter()
      .any(|t| t == &ctx.tenant_id);

    let (key, container) = match self.acquire(spec, env, elevated).await {
      Ok(acquired) => acquired,
      Err(ContainerError::ImageRejected(image)) => {
        return Outcome::failure(
          ErrorKind::Configuration,
          format!("image '{image}' is not on the allow-list"),
          false,
        );
      }
      Err(e) => {
        return Outcome::failure(ErrorKind::Startup, e.to_string(), true);
      }
    };

    let logs = self.capture_logs(
      activation.run_id.clone(),
      activation.node_ref.clone(),
      container.container_id.clone(),
    );

    let outcome = tokio::select! {
      result = self.invoke(&container.endpoint, &activation, &ctx) => match result {
        Ok(result) => {
          let outputs = result
            .as_object()
            .cloned()
            .unwrap_or_else(|| {
              let mut map = serde_json::Map::new();
              map.insert("output".to_string(), result);
              map
            });
          Outcome::Success(Success { outputs })
        }
        Err(failure) => Outcome::Failure(failure),
      },
      _ = ctx.cancel.cancelled() => {
        // Signal the container so the in-flight RPC stops doing work.
        if let Err(e) = self.docker.stop_container(&container.container_id, None).await {
          warn!(error = %e, "failed to stop container on cancel");
        }
        Outcome::Failure(Failure::cancelled())
      }
    };

    logs.abort();
    self.release(key, container).await;
    outcome
  }
}

#[async_trait]
impl ToolResolver for ContainerRunner {
  /// Start (or reuse) the tool server behind a tool node and list the tools
  /// it serves. Tool names are prefixed with the node ref so several servers
  /// can coexist in one run.
  async fn resolve(
    &self,
    _run_id: &str,
    node_ref: &str,
    component: &ComponentDefinition,
    params: &serde_json::Map<String, Value>,
  ) -> Result<Vec<ToolRegistration>, GatewayError> {
    let RunnerKind::Container(spec) = &component.runner else {
      return Err(GatewayError::Resolution {
        message: format!("component '{}' is not container-hosted", component.id),
      });
    };

    let env = Self::resolve_env(params);
    let (key, container) =
      self
        .acquire(spec, env, false)
        .await
        .map_err(|e| GatewayError::Resolution {
          message: e.to_string(),
        })?;

    let request = json!({
      "jsonrpc": "2.0",
      "id": 1,
      "method": "tools/list",
      "params": {},
    });
    let response: Value = self
      .http
      .post(format!("{}/rpc", container.endpoint))
      .json(&request)
      .send()
      .await
      .map_err(|e| GatewayError::Resolution {
        message: e.to_string(),
      })?
      .json()
      .await
      .map_err(|e| GatewayError::Resolution {
        message: e.to_string(),
      })?;

    let tools = response
      .get("result")
      .and_then(|r| r.get("tools"))
      .and_then(Value::as_array)
      .cloned()
      .unwrap_or_default();

    let registrations = tools
      .iter()
      .filter_map(|tool| {
        let name = tool.get("name").and_then(Value::as_str)?;
        Some(ToolRegistration {
          tool_name: format!("{node_ref}.{name}"),
          node_ref: node_ref.to_string(),
          endpoint: format!("{}/rpc", container.endpoint),
          container_id: Some(container.container_id.clone()),
          input_schema: tool.get("inputSchema").cloned().unwrap_or(Value::Null),
          non_reentrant: spec.non_reentrant,
        })
      })
      .collect();

    self.release(key, container).await;
    Ok(registrations)
  }
}
