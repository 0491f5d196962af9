use std::collections::HashMap;
use std::sync::Arc;

use crate::definition::ComponentDefinition;
use crate::error::RegistryError;

/// Process-wide component catalog.
///
/// Seeded at startup, then sealed. After [`ComponentRegistry::seal`] the
/// registry is read-only and safe to share without locking.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
  components: HashMap<String, Arc<ComponentDefinition>>,
  sealed: bool,
}

impl ComponentRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a definition. Fails on duplicate ids and after the seal.
  pub fn register(&mut self, def: ComponentDefinition) -> Result<(), RegistryError> {
    if self.sealed {
      return Err(RegistryError::Sealed { id: def.id });
    }
    if self.components.contains_key(&def.id) {
      return Err(RegistryError::DuplicateComponent { id: def.id });
    }
    self.components.insert(def.id.clone(), Arc::new(def));
    Ok(())
  }

  /// Forbid further registration.
  pub fn seal(&mut self) {
    self.sealed = true;
  }

  /// Look up a definition by component id.
  pub fn get(&self, id: &str) -> Option<Arc<ComponentDefinition>> {
    self.components.get(id).cloned()
  }

  /// All registered definitions, unordered.
  pub fn list(&self) -> Vec<Arc<ComponentDefinition>> {
    self.components.values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.components.len()
  }

  pub fn is_empty(&self) -> bool {
    self.components.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn register_and_get() {
    let mut registry = ComponentRegistry::new();
    registry
      .register(ComponentDefinition::inline("core.http.request", "1.0.0"))
      .unwrap();

    let def = registry.get("core.http.request").unwrap();
    assert_eq!(def.version, "1.0.0");
    assert!(registry.get("core.missing").is_none());
  }

  #[test]
  fn duplicate_registration_fails() {
    let mut registry = ComponentRegistry::new();
    registry
      .register(ComponentDefinition::inline("core.http.request", "1.0.0"))
      .unwrap();

    let err = registry
      .register(ComponentDefinition::inline("core.http.request", "1.1.0"))
      .unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateComponent { .. }));
  }

  #[test]
  fn sealed_registry_rejects_registration() {
    let mut registry = ComponentRegistry::new();
    registry.seal();

    let err = registry
      .register(ComponentDefinition::inline("core.http.request", "1.0.0"))
      .unwrap_err();
    assert!(matches!(err, RegistryError::Sealed { .. }));
  }
}
