use opensearch::auth::Credentials;
use opensearch::http::request::JsonBody;
use opensearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use opensearch::{BulkParts, OpenSearch};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::normalize::{normalize_item, FindingBatch};
use crate::SinkError;

#[derive(Debug, Clone)]
pub struct SinkConfig {
  pub url: String,
  pub username: Option<String>,
  pub password: Option<String>,
  /// Indices are named `{prefix}-{tenant_id}`.
  pub index_prefix: String,
}

/// Client for the external search cluster.
pub struct FindingsSink {
  client: OpenSearch,
  index_prefix: String,
}

impl FindingsSink {
  pub fn connect(config: &SinkConfig) -> Result<Self, SinkError> {
    let url = config
      .url
      .parse()
      .map_err(|e| SinkError::Permanent(format!("invalid search url: {e}")))?;

    let mut builder = TransportBuilder::new(SingleNodeConnectionPool::new(url));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
      builder = builder.auth(Credentials::Basic(username.clone(), password.clone()));
    }
    let transport = builder
      .build()
      .map_err(|e| SinkError::Permanent(format!("failed to build transport: {e}")))?;

    Ok(Self {
      client: OpenSearch::new(transport),
      index_prefix: config.index_prefix.clone(),
    })
  }

  fn index_for(&self, tenant_id: &str) -> String {
    format!("{}-{}", self.index_prefix, tenant_id)
  }

  /// Bulk-index one batch. Returns the number of documents indexed.
  #[instrument(
    name = "sink_index",
    skip(self, batch),
    fields(
      run_id = %batch.run_id,
      node_ref = %batch.node_ref,
      items = batch.items.len(),
    )
  )]
  pub async fn index(&self, batch: &FindingBatch) -> Result<usize, SinkError> {
    if batch.items.is_empty() {
      return Ok(0);
    }

    let index = self.index_for(&batch.tenant_id);
    let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(batch.items.len() * 2);
    for item in &batch.items {
      let (id, document) = normalize_item(batch, item);
      body.push(json!({"index": {"_id": id}}).into());
      body.push(document.into());
    }

    let response = self
      .client
      .bulk(BulkParts::Index(&index))
      .body(body)
      .send()
      .await
      .map_err(|e| SinkError::Retryable(e.to_string()))?;

    let status = response.status_code();
    if status.is_server_error() {
      return Err(SinkError::Retryable(format!("cluster returned {status}")));
    }
    if !status.is_success() {
      return Err(SinkError::Permanent(format!("cluster returned {status}")));
    }

    let body: Value = response
      .json()
      .await
      .map_err(|e| SinkError::Retryable(e.to_string()))?;
    if let Some(message) = bulk_rejection(&body) {
      return Err(SinkError::Permanent(message));
    }

    info!(index = %index, indexed = batch.items.len(), "findings indexed");
    Ok(batch.items.len())
  }
}

/// Extract the first per-item rejection from a bulk response, if any.
fn bulk_rejection(body: &Value) -> Option<String> {
  if !body.get("errors").and_then(Value::as_bool).unwrap_or(false) {
    return None;
  }
  let first = body
    .get("items")
    .and_then(Value::as_array)?
    .iter()
    .find_map(|item| item.get("index").and_then(|op| op.get("error")).filter(|e| !e.is_null()));
  Some(
    first
      .map(|e| e.to_string())
      .unwrap_or_else(|| "bulk response flagged errors".to_string()),
  )
}
