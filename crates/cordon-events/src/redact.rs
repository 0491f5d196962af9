use serde_json::Value;

/// Keys whose values are always scrubbed. Matched by whole-key equality
/// (case-insensitive): the engine's own `approve_token` / `reject_token` /
/// `wait_token` fields are functional handles delivered through the event
/// stream and must pass through intact.
const SENSITIVE_KEYS: &[&str] = &[
  "password",
  "passphrase",
  "secret",
  "client_secret",
  "token",
  "access_token",
  "refresh_token",
  "session_token",
  "api_key",
  "apikey",
  "authorization",
  "credential",
  "credentials",
  "private_key",
];

const CREDENTIAL_PREFIXES: &[&str] = &[
  "sk-", "sk_live_", "ghp_", "github_pat_", "xoxb-", "xoxp-", "glpat-", "AKIA", "Bearer ",
];

/// Scrub credentials from an event payload before it is appended.
///
/// Object keys with sensitive names are replaced wholesale; string values
/// that carry recognizable key material are masked. Applied to every payload
/// by the hub, so nothing downstream (stores, subscribers, logs) sees raw
/// secrets.
pub fn redact(value: Value) -> Value {
  match value {
    Value::Object(map) => Value::Object(
      map
        .into_iter()
        .map(|(k, v)| {
          if is_sensitive_key(&k) {
            (k, Value::String("[redacted]".to_string()))
          } else {
            (k, redact(v))
          }
        })
        .collect(),
    ),
    Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
    Value::String(s) => {
      if CREDENTIAL_PREFIXES.iter().any(|p| s.starts_with(p)) {
        Value::String("[redacted]".to_string())
      } else {
        Value::String(s)
      }
    }
    other => other,
  }
}

fn is_sensitive_key(key: &str) -> bool {
  let lower = key.to_ascii_lowercase();
  SENSITIVE_KEYS.iter().any(|k| lower == *k)
}
