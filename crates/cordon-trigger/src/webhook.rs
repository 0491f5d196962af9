use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use cordon_store::Store;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::request::{RunRequest, RunSubmitter, TriggerKind};
use crate::TriggerError;

type HmacSha256 = Hmac<Sha256>;

/// A configured webhook source: who may call, how deliveries are signed, and
/// which workflow they start.
#[derive(Debug, Clone)]
pub struct WebhookSource {
  pub name: String,
  /// Shared HMAC secret the sender signs bodies with.
  pub secret: Vec<u8>,
  pub workflow_id: String,
  pub tenant_id: String,
}

/// Normalizes verified external events into run requests.
///
/// Duplicate deliveries are dropped on `(source, delivery_id, signature
/// head)` within the retention window.
pub struct WebhookIntake {
  store: Arc<dyn Store>,
  submitter: Arc<dyn RunSubmitter>,
  sources: HashMap<String, WebhookSource>,
}

impl WebhookIntake {
  pub fn new(
    store: Arc<dyn Store>,
    submitter: Arc<dyn RunSubmitter>,
    sources: Vec<WebhookSource>,
  ) -> Self {
    Self {
      store,
      submitter,
      sources: sources.into_iter().map(|s| (s.name.clone(), s)).collect(),
    }
  }

  /// Handle one delivery. Returns the run id, or `None` for a duplicate.
  pub async fn handle(
    &self,
    source_name: &str,
    delivery_id: &str,
    signature: &str,
    body: &[u8],
  ) -> Result<Option<String>, TriggerError> {
    let source = self
      .sources
      .get(source_name)
      .ok_or_else(|| TriggerError::UnknownSource(source_name.to_string()))?;

    if !verify_signature(&source.secret, body, signature) {
      return Err(TriggerError::InvalidSignature);
    }

    // Signature head disambiguates replayed delivery ids with new content.
    let head = signature_head(signature);
    let fresh = self
      .store
      .record_webhook_delivery(source_name, delivery_id, &head, Utc::now())
      .await?;
    if !fresh {
      info!(source = source_name, delivery_id, "duplicate webhook delivery dropped");
      return Ok(None);
    }

    let payload: serde_json::Value =
      serde_json::from_slice(body).unwrap_or(serde_json::Value::Null);
    let request = RunRequest {
      workflow_id: source.workflow_id.clone(),
      tenant_id: source.tenant_id.clone(),
      kind: TriggerKind::Webhook,
      payload: serde_json::json!({
        "source": source_name,
        "delivery_id": delivery_id,
        "body": payload,
      }),
      idempotency_key: Some(format!("webhook:{source_name}:{delivery_id}:{head}")),
      max_in_flight: None,
      timeout_override: None,
    };

    let run_id = self.submitter.submit(request).await?;
    Ok(Some(run_id))
  }
}

/// Constant-time HMAC-SHA256 verification. Accepts an optional `sha256=`
/// prefix, the convention most webhook senders use.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
  let presented = signature.strip_prefix("sha256=").unwrap_or(signature);
  let Ok(presented) = hex::decode(presented) else {
    return false;
  };

  let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
  mac.update(body);
  let expected = mac.finalize().into_bytes();

  presented.ct_eq(expected.as_slice()).into()
}

fn signature_head(signature: &str) -> String {
  let trimmed = signature.strip_prefix("sha256=").unwrap_or(signature);
  trimmed.chars().take(16).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
  }

  #[test]
  fn valid_signatures_verify() {
    let secret = b"webhook-secret";
    let body = br#"{"event": "scan.finished"}"#;
    let signature = sign(secret, body);

    assert!(verify_signature(secret, body, &signature));
    // without the prefix too
    assert!(verify_signature(
      secret,
      body,
      signature.strip_prefix("sha256=").unwrap()
    ));
  }

  #[test]
  fn tampered_bodies_fail() {
    let secret = b"webhook-secret";
    let signature = sign(secret, b"original");

    assert!(!verify_signature(secret, b"tampered", &signature));
    assert!(!verify_signature(b"wrong-secret", b"original", &signature));
    assert!(!verify_signature(secret, b"original", "sha256=nothex"));
  }
}
