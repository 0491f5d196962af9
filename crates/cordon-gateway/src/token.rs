use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies session bearer tokens.
///
/// Token format: `{session_id}.{hex(hmac_sha256(secret, session_id))}`.
/// The token is opaque to agents; verification is constant-time.
#[derive(Clone)]
pub struct TokenSigner {
  secret: Vec<u8>,
}

impl TokenSigner {
  pub fn new(secret: impl Into<Vec<u8>>) -> Self {
    Self {
      secret: secret.into(),
    }
  }

  /// A signer with a process-local random secret; tokens die with the
  /// process.
  pub fn ephemeral() -> Self {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    Self {
      secret: secret.to_vec(),
    }
  }

  pub fn sign(&self, session_id: &str) -> String {
    format!("{}.{}", session_id, hex::encode(self.mac(session_id)))
  }

  /// Verify a bearer token, returning the session id it binds.
  pub fn verify(&self, token: &str) -> Option<String> {
    let (session_id, signature) = token.split_once('.')?;
    let presented = hex::decode(signature).ok()?;
    let expected = self.mac(session_id);
    if presented.ct_eq(&expected).into() {
      Some(session_id.to_string())
    } else {
      None
    }
  }

  fn mac(&self, session_id: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
    mac.update(session_id.as_bytes());
    mac.finalize().into_bytes().to_vec()
  }
}

/// A fresh 32-byte random token, hex-encoded. Used for approval decision
/// tokens and wait tokens.
pub fn random_token() -> String {
  let mut bytes = [0u8; 32];
  rand::thread_rng().fill_bytes(&mut bytes);
  hex::encode(bytes)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sign_verify_round_trip() {
    let signer = TokenSigner::new(b"test-secret".to_vec());
    let token = signer.sign("sess-1");
    assert_eq!(signer.verify(&token).as_deref(), Some("sess-1"));
  }

  #[test]
  fn tampered_tokens_fail() {
    let signer = TokenSigner::new(b"test-secret".to_vec());
    let token = signer.sign("sess-1");

    let tampered = token.replace("sess-1", "sess-2");
    assert!(signer.verify(&tampered).is_none());
    assert!(signer.verify("garbage").is_none());
    assert!(signer.verify("sess-1.deadbeef").is_none());
  }

  #[test]
  fn different_secrets_reject_each_other() {
    let a = TokenSigner::new(b"secret-a".to_vec());
    let b = TokenSigner::new(b"secret-b".to_vec());
    let token = a.sign("sess-1");
    assert!(b.verify(&token).is_none());
  }
}
