//! Image reference and container id validation.
//!
//! References are interpolated into container-engine calls, so anything that
//! does not match the strict grammar is rejected outright before the engine
//! sees it.

/// Allow-list policy for launchable images.
#[derive(Debug, Clone, Default)]
pub struct ImagePolicy {
  /// Exact references or `prefix/*` patterns. Empty list allows nothing
  /// without elevation.
  pub allow_list: Vec<String>,
}

impl ImagePolicy {
  pub fn new(allow_list: Vec<String>) -> Self {
    Self { allow_list }
  }

  /// Whether a tenant may launch the image. Elevated tenants bypass the
  /// allow-list but never the syntax check.
  pub fn permits(&self, image: &str, elevated: bool) -> bool {
    if !validate_image_ref(image) {
      return false;
    }
    if elevated {
      return true;
    }
    self.allow_list.iter().any(|entry| {
      if let Some(prefix) = entry.strip_suffix("/*") {
        image.starts_with(prefix) && image.len() > prefix.len()
      } else {
        entry == image
      }
    })
  }
}

/// Strict image reference check: `[registry[:port]/]path[:tag][@sha256:hex]`.
///
/// Path segments are lowercase alphanumerics with `._-` separators; tags are
/// word characters with `._-`. Anything else (spaces, shell metacharacters,
/// unicode) fails.
pub fn validate_image_ref(image: &str) -> bool {
  if image.is_empty() || image.len() > 255 {
    return false;
  }

  let (body, digest) = match image.split_once('@') {
    Some((body, digest)) => (body, Some(digest)),
    None => (image, None),
  };
  if let Some(digest) = digest {
    let Some(hex) = digest.strip_prefix("sha256:") else {
      return false;
    };
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
      return false;
    }
  }

  // Split a trailing tag off the last segment only; earlier colons belong to
  // a registry port.
  let (path, tag) = match body.rsplit_once(':') {
    Some((path, tag)) if !tag.contains('/') => (path, Some(tag)),
    _ => (body, None),
  };
  if let Some(tag) = tag {
    if tag.is_empty()
      || tag.len() > 128
      || !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
      return false;
    }
  }

  if path.is_empty() {
    return false;
  }
  path.split('/').all(|segment| {
    !segment.is_empty()
      && segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
  })
}

/// Container ids and generated names: word characters only.
pub fn validate_container_id(id: &str) -> bool {
  !id.is_empty()
    && id.len() <= 128
    && id
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accepts_common_references() {
    assert!(validate_image_ref("alpine"));
    assert!(validate_image_ref("ghcr.io/cordon/tools-nuclei:1.2.0"));
    assert!(validate_image_ref("registry.local:5000/scanners/nmap:latest"));
    assert!(validate_image_ref(
      "alpine@sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    ));
  }

  #[test]
  fn rejects_injection_shapes() {
    assert!(!validate_image_ref("alpine; rm -rf /"));
    assert!(!validate_image_ref("alpine && curl evil"));
    assert!(!validate_image_ref("alpine$(whoami)"));
    assert!(!validate_image_ref(""));
    assert!(!validate_image_ref("Alpine")); // uppercase path
    assert!(!validate_image_ref("alpine@sha256:short"));
  }

  #[test]
  fn allow_list_prefixes() {
    let policy = ImagePolicy::new(vec![
      "ghcr.io/cordon/*".to_string(),
      "alpine".to_string(),
    ]);
    assert!(policy.permits("ghcr.io/cordon/tools-nmap:1.0", false));
    assert!(policy.permits("alpine", false));
    assert!(!policy.permits("evil.io/x", false));
    // Elevation bypasses the list, not the syntax.
    assert!(policy.permits("evil.io/x", true));
    assert!(!policy.permits("evil.io/x; rm", true));
  }

  #[test]
  fn container_ids() {
    assert!(validate_container_id("cordon-nuclei-ab12cd34"));
    assert!(!validate_container_id("bad id"));
    assert!(!validate_container_id("bad;id"));
  }
}
