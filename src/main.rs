use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cordon_artifact::FsArtifactStore;
use cordon_config::EngineConfig;
use cordon_container::{ContainerRunner, ContainerRunnerConfig, ImagePolicy};
use cordon_events::{EventStore, StreamHub};
use cordon_gateway::{Gateway, TokenSigner};
use cordon_orchestrator::{Orchestrator, OrchestratorConfig, RunnerSet};
use cordon_registry::ComponentRegistry;
use cordon_runner::{builtins, InlineRunner};
use cordon_sink::{findings_sink_def, FindingsSink, FindingsSinkComponent, SinkConfig};
use cordon_store::SqliteStore;
use cordon_trigger::{CronScheduler, RunRequest, SchedulerConfig};
use cordon_workflow::{validate, WorkflowDef};

/// Cordon - a graph workflow engine for security automation
#[derive(Parser)]
#[command(name = "cordon")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.cordon)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Start the engine: orchestrator, tool gateway, scheduler
  Serve,

  /// Execute a workflow once, reading the trigger payload from stdin
  Run {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,
  },

  /// Validate a workflow file against the component registry
  Validate {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
    .init();

  let cli = Cli::parse();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".cordon")
  });

  let rt = tokio::runtime::Runtime::new()?;
  match cli.command {
    Some(Commands::Serve) => rt.block_on(serve(data_dir)),
    Some(Commands::Run { workflow_file }) => rt.block_on(run_workflow(workflow_file, data_dir)),
    Some(Commands::Validate { workflow_file }) => rt.block_on(validate_workflow(workflow_file)),
    None => {
      println!("cordon - use --help to see available commands");
      Ok(())
    }
  }
}

async fn serve(data_dir: PathBuf) -> Result<()> {
  let mut config = EngineConfig::from_env().context("failed to read configuration")?;
  if config.data_dir.is_none() {
    config.data_dir = Some(data_dir);
  }
  let data_dir = config.data_dir.clone().expect("data dir set above");
  tokio::fs::create_dir_all(&data_dir)
    .await
    .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

  // Storage: one SQLite database for runs, events, and the rest.
  let pool = sqlx::sqlite::SqlitePoolOptions::new()
    .max_connections(8)
    .connect(&config.database_url)
    .await
    .with_context(|| format!("failed to open database {}", config.database_url))?;
  let store = Arc::new(SqliteStore::new(pool));
  store.migrate().await.context("migrations failed")?;

  let event_store: Arc<dyn EventStore> = store.clone();
  let hub = Arc::new(StreamHub::new(event_store));
  let artifacts = Arc::new(FsArtifactStore::new(data_dir.join("artifacts")));

  let (registry, inline) = build_components(&config)?;
  let registry = Arc::new(registry);

  let cancel = CancellationToken::new();

  // Tool gateway with an HMAC token signer.
  let signer = match &config.token_secret {
    Some(secret) => TokenSigner::new(secret.as_bytes().to_vec()),
    None => {
      tracing::warn!("CORDON_TOKEN_SECRET unset; using an ephemeral process-local secret");
      TokenSigner::ephemeral()
    }
  };
  let gateway = Arc::new(Gateway::new(signer, hub.clone()));
  let gateway_endpoint = format!("http://{}/rpc", config.gateway_addr);
  {
    let gateway = gateway.clone();
    let addr = config.gateway_addr;
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if let Err(e) = cordon_gateway::serve(gateway, addr, cancel).await {
        tracing::error!(error = %e, "tool gateway exited");
      }
    });
  }

  // Container runner doubles as the tool resolver for agent sessions.
  let container = ContainerRunner::connect(
    config.docker_endpoint.as_deref(),
    ContainerRunnerConfig {
      policy: ImagePolicy::new(config.image_allow_list.clone()),
      elevated_tenants: Vec::new(),
    },
    artifacts.clone(),
    hub.clone(),
  )
  .map(Arc::new);
  let (container_runner, tool_resolver) = match container {
    Ok(runner) => (
      Some(runner.clone() as Arc<dyn cordon_runner::Runner>),
      Some(runner as Arc<dyn cordon_gateway::ToolResolver>),
    ),
    Err(e) => {
      tracing::warn!(error = %e, "container engine unavailable; container components disabled");
      (None, None)
    }
  };

  let orchestrator = Orchestrator::new(
    registry,
    store.clone(),
    hub,
    artifacts,
    RunnerSet {
      inline: Arc::new(inline),
      container: container_runner,
    },
    Some(gateway),
    tool_resolver,
    OrchestratorConfig {
      max_in_flight: config.max_in_flight,
      heartbeat_interval: config.heartbeat_interval,
      gateway_endpoint: Some(gateway_endpoint),
      ..OrchestratorConfig::default()
    },
  );

  let recovered = orchestrator
    .recover()
    .await
    .map_err(|e| anyhow::anyhow!("recovery failed: {e}"))?;
  if recovered > 0 {
    tracing::info!(recovered, "recovered in-flight runs");
  }

  let maintenance = orchestrator.spawn_maintenance(config.event_retention, cancel.clone());

  let scheduler = CronScheduler::new(
    store,
    Arc::new(orchestrator.clone()),
    SchedulerConfig::default(),
  );
  let scheduler_task = {
    let cancel = cancel.clone();
    tokio::spawn(async move { scheduler.run(cancel).await })
  };

  tracing::info!("cordon engine running; ctrl-c to stop");
  tokio::signal::ctrl_c().await?;
  cancel.cancel();
  let _ = scheduler_task.await;
  maintenance.abort();
  Ok(())
}

async fn run_workflow(workflow_file: PathBuf, data_dir: PathBuf) -> Result<()> {
  let config = EngineConfig::from_env().context("failed to read configuration")?;
  let workflow = read_workflow(&workflow_file).await?;
  eprintln!("Loaded workflow: {}", workflow.name);

  let payload = read_payload_from_stdin()?;
  eprintln!("Payload: {}", payload);

  // One-shot engine: in-memory database, local artifacts, inline runner.
  let pool = sqlx::sqlite::SqlitePoolOptions::new()
    .max_connections(1)
    .connect("sqlite::memory:")
    .await?;
  let store = Arc::new(SqliteStore::new(pool));
  store.migrate().await.context("migrations failed")?;

  let event_store: Arc<dyn EventStore> = store.clone();
  let hub = Arc::new(StreamHub::new(event_store));
  let artifacts = Arc::new(FsArtifactStore::new(data_dir.join("artifacts")));

  let (registry, inline) = build_components(&config)?;

  let orchestrator = Orchestrator::new(
    Arc::new(registry),
    store,
    hub.clone(),
    artifacts,
    RunnerSet {
      inline: Arc::new(inline),
      container: None,
    },
    None,
    None,
    OrchestratorConfig::default(),
  );

  orchestrator
    .register_workflow(&workflow, "local")
    .await
    .map_err(|e| anyhow::anyhow!("failed to store workflow: {e}"))?;
  let run_id = orchestrator
    .submit(RunRequest::manual(&workflow.id, "local", payload))
    .await
    .map_err(|e| anyhow::anyhow!("submission failed: {e}"))?;
  eprintln!("Run: {run_id}");

  // Tail events until the run terminates.
  let mut stream = orchestrator
    .subscribe_events(&run_id, 0)
    .await
    .map_err(|e| anyhow::anyhow!("subscription failed: {e}"))?;
  while let Some(message) = stream.next().await {
    match message {
      cordon_events::StreamMessage::Event(event) => {
        eprintln!(
          "[{}] {} {}",
          event.sequence,
          event.kind,
          event.node_ref.as_deref().unwrap_or("-")
        );
        if event.kind.is_run_terminal() {
          println!("{}", serde_json::to_string_pretty(&event.payload)?);
          break;
        }
      }
      cordon_events::StreamMessage::Overrun => {
        eprintln!("event stream overrun");
        break;
      }
    }
  }

  Ok(())
}

async fn validate_workflow(workflow_file: PathBuf) -> Result<()> {
  let config = EngineConfig::from_env().context("failed to read configuration")?;
  let workflow = read_workflow(&workflow_file).await?;

  let (registry, _) = build_components(&config)?;

  let report = validate(&workflow, &registry);
  println!("{}", serde_json::to_string_pretty(&report)?);
  if !report.is_valid() {
    std::process::exit(1);
  }
  Ok(())
}

/// Built-in components, with matching definitions and bindings.
///
/// The findings sink joins the registry only when a search cluster is
/// configured: a component the runner cannot execute must not validate, it
/// surfaces as an unknown component when the workflow is checked.
fn build_components(config: &EngineConfig) -> Result<(ComponentRegistry, InlineRunner)> {
  let mut registry = ComponentRegistry::new();
  for def in builtins::definitions() {
    registry.register(def).map_err(anyhow::Error::from)?;
  }
  let mut inline = InlineRunner::new();
  builtins::bind_all(&mut inline);

  if let Some(url) = &config.search_url {
    let sink = FindingsSink::connect(&SinkConfig {
      url: url.clone(),
      username: config.search_username.clone(),
      password: config.search_password.clone(),
      index_prefix: "cordon-findings".to_string(),
    })
    .map_err(|e| anyhow::anyhow!("search cluster setup failed: {e}"))?;
    registry
      .register(findings_sink_def())
      .map_err(anyhow::Error::from)?;
    inline.bind(
      "core.sink.findings",
      Arc::new(FindingsSinkComponent::new(Arc::new(sink), "")),
    );
  }

  registry.seal();
  Ok((registry, inline))
}

async fn read_workflow(path: &PathBuf) -> Result<WorkflowDef> {
  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read workflow file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse workflow file: {}", path.display()))
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  if io::stdin().is_terminal() {
    return Ok(serde_json::json!({}));
  }
  let mut buffer = String::new();
  io::stdin()
    .read_to_string(&mut buffer)
    .context("failed to read payload from stdin")?;
  if buffer.trim().is_empty() {
    return Ok(serde_json::json!({}));
  }
  serde_json::from_str(buffer.trim()).context("payload is not valid JSON")
}
