use chrono::Utc;
use cordon_artifact::digest_bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A batch of findings emitted by one sink node activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingBatch {
  pub tenant_id: String,
  pub workflow_id: String,
  pub run_id: String,
  pub node_ref: String,
  pub items: Vec<Value>,
}

/// Normalize one finding into an indexable document.
///
/// Returns `(document_id, document)`. The id is stable for the same
/// `(tenant, workflow, run, asset)` so repeated indexing upserts. Items
/// without an `asset_key` get one derived from their content.
pub fn normalize_item(batch: &FindingBatch, item: &Value) -> (String, Value) {
  let asset_key = item
    .get("asset_key")
    .and_then(Value::as_str)
    .map(str::to_string)
    .unwrap_or_else(|| {
      let bytes = serde_json::to_vec(item).unwrap_or_default();
      format!("content:{}", &digest_bytes(&bytes).as_str()[..16])
    });

  let id = format!(
    "{}:{}:{}:{}",
    batch.tenant_id, batch.workflow_id, batch.run_id, asset_key
  );

  let mut document = json!({
    "tenant_id": batch.tenant_id,
    "workflow_id": batch.workflow_id,
    "run_id": batch.run_id,
    "node_ref": batch.node_ref,
    "asset_key": asset_key,
    "@timestamp": Utc::now(),
  });
  if let (Some(doc), Some(fields)) = (document.as_object_mut(), item.as_object()) {
    for (key, value) in fields {
      doc.entry(key.clone()).or_insert_with(|| value.clone());
    }
  } else if let Some(doc) = document.as_object_mut() {
    doc.insert("value".to_string(), item.clone());
  }

  (id, document)
}
