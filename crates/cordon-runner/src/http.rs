use std::time::Duration;

use cordon_registry::ErrorKind;
use reqwest::StatusCode;
use url::Url;

use crate::outcome::Failure;

/// Why an HTTP fetch failed, pre-classified for the retry policy.
#[derive(Debug)]
pub struct HttpFailure {
  pub kind: ErrorKind,
  pub message: String,
}

impl From<HttpFailure> for Failure {
  fn from(f: HttpFailure) -> Self {
    let retryable = !f.kind.terminal();
    Failure::new(f.kind, f.message, retryable)
  }
}

/// Tenant-scoped HTTP fetch helper.
///
/// Components never hold a raw client: requests carry the tenant tag for
/// audit and failures come back classified (timeout, network, 5xx,
/// rate-limit, authentication) so the orchestrator can apply policy.
#[derive(Clone)]
pub struct ScopedHttp {
  client: reqwest::Client,
  tenant_id: String,
}

impl ScopedHttp {
  pub fn new(tenant_id: impl Into<String>) -> Self {
    Self {
      client: reqwest::Client::new(),
      tenant_id: tenant_id.into(),
    }
  }

  pub fn with_client(client: reqwest::Client, tenant_id: impl Into<String>) -> Self {
    Self {
      client,
      tenant_id: tenant_id.into(),
    }
  }

  pub fn tenant_id(&self) -> &str {
    &self.tenant_id
  }

  /// Perform a JSON request and return `(status, body)`.
  pub async fn fetch_json(
    &self,
    method: &str,
    url: &str,
    headers: &serde_json::Map<String, serde_json::Value>,
    body: Option<&serde_json::Value>,
    timeout: Duration,
  ) -> Result<(u16, serde_json::Value), HttpFailure> {
    let url = Url::parse(url).map_err(|e| HttpFailure {
      kind: ErrorKind::Configuration,
      message: format!("invalid url: {e}"),
    })?;

    let method: reqwest::Method = method.parse().map_err(|_| HttpFailure {
      kind: ErrorKind::Configuration,
      message: format!("invalid method: {method}"),
    })?;

    let mut request = self
      .client
      .request(method, url)
      .timeout(timeout)
      .header("x-cordon-tenant", &self.tenant_id);

    for (name, value) in headers {
      if let Some(value) = value.as_str() {
        request = request.header(name, value);
      }
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await.map_err(|e| {
      if e.is_timeout() {
        HttpFailure {
          kind: ErrorKind::Timeout,
          message: e.to_string(),
        }
      } else {
        HttpFailure {
          kind: ErrorKind::Network,
          message: e.to_string(),
        }
      }
    })?;

    let status = response.status();
    if let Some(failure) = classify_status(status) {
      return Err(failure);
    }

    let status_code = status.as_u16();
    let body = response
      .json::<serde_json::Value>()
      .await
      .unwrap_or(serde_json::Value::Null);

    Ok((status_code, body))
  }
}

fn classify_status(status: StatusCode) -> Option<HttpFailure> {
  if status == StatusCode::TOO_MANY_REQUESTS {
    return Some(HttpFailure {
      kind: ErrorKind::RateLimit,
      message: "upstream throttled the request".to_string(),
    });
  }
  if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
    return Some(HttpFailure {
      kind: ErrorKind::Authentication,
      message: format!("upstream rejected credentials ({status})"),
    });
  }
  if status.is_server_error() {
    return Some(HttpFailure {
      kind: ErrorKind::Upstream5xx,
      message: format!("upstream returned {status}"),
    });
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_classification() {
    assert!(classify_status(StatusCode::OK).is_none());
    assert!(classify_status(StatusCode::NOT_FOUND).is_none());
    assert_eq!(
      classify_status(StatusCode::TOO_MANY_REQUESTS).unwrap().kind,
      ErrorKind::RateLimit
    );
    assert_eq!(
      classify_status(StatusCode::BAD_GATEWAY).unwrap().kind,
      ErrorKind::Upstream5xx
    );
    assert_eq!(
      classify_status(StatusCode::UNAUTHORIZED).unwrap().kind,
      ErrorKind::Authentication
    );
  }
}
