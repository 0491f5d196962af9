use thiserror::Error;

/// Errors raised by registry configuration.
#[derive(Debug, Error)]
pub enum RegistryError {
  /// A component id was registered twice.
  #[error("component already registered: {id}")]
  DuplicateComponent { id: String },

  /// The registry was mutated after the startup seal.
  #[error("registry is sealed; cannot register {id}")]
  Sealed { id: String },
}
