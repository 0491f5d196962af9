use serde::{Deserialize, Serialize};

/// Primitive port data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveType {
  Text,
  Number,
  Boolean,
  Json,
  Secret,
}

/// The type carried by a port.
///
/// Compatibility rules: identical kinds match, `Any` matches anything, and
/// `Contract` matches only a contract with the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataType {
  Primitive { name: PrimitiveType },
  List { element: Box<DataType> },
  Map { value: Box<DataType> },
  Contract { name: String },
  Any,
}

impl DataType {
  /// Shorthand for a primitive type.
  pub fn primitive(name: PrimitiveType) -> Self {
    DataType::Primitive { name }
  }

  /// Shorthand for a named contract type.
  pub fn contract(name: impl Into<String>) -> Self {
    DataType::Contract { name: name.into() }
  }

  /// Whether a value of `self` can flow into a port of type `target`.
  pub fn compatible_with(&self, target: &DataType) -> bool {
    match (self, target) {
      (DataType::Any, _) | (_, DataType::Any) => true,
      (DataType::Primitive { name: a }, DataType::Primitive { name: b }) => a == b,
      (DataType::List { element: a }, DataType::List { element: b }) => a.compatible_with(b),
      (DataType::Map { value: a }, DataType::Map { value: b }) => a.compatible_with(b),
      (DataType::Contract { name: a }, DataType::Contract { name: b }) => a == b,
      _ => false,
    }
  }
}

/// How a port participates in the graph.
///
/// `Main` ports carry data along ordinary edges. `Tool` ports connect an
/// agent node to the tool servers it may call through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
  Main,
  Tool,
}

/// A declared input or output port on a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
  /// Stable port identifier, unique within the component side.
  pub id: String,
  pub data_type: DataType,
  /// Required input ports must be satisfied by an edge or a literal.
  pub required: bool,
  /// Accept any upstream type regardless of `data_type`.
  pub allow_any: bool,
  pub connection_type: ConnectionType,
}

impl PortSpec {
  /// A required `Main` input/output port of the given type.
  pub fn required(id: impl Into<String>, data_type: DataType) -> Self {
    Self {
      id: id.into(),
      data_type,
      required: true,
      allow_any: false,
      connection_type: ConnectionType::Main,
    }
  }

  /// An optional `Main` port of the given type.
  pub fn optional(id: impl Into<String>, data_type: DataType) -> Self {
    Self {
      id: id.into(),
      data_type,
      required: false,
      allow_any: false,
      connection_type: ConnectionType::Main,
    }
  }

  /// A tool-connection port.
  pub fn tool(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      data_type: DataType::Any,
      required: false,
      allow_any: true,
      connection_type: ConnectionType::Tool,
    }
  }
}

/// Editor hint for a configuration parameter.
///
/// The core treats parameter semantics opaquely; the validator only enforces
/// presence, JSON shape, and the secret-reference rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
  Text,
  Number,
  Boolean,
  Json,
  /// Must hold a secret *reference* (identifier), never a raw credential.
  Secret,
  Select { options: Vec<String> },
}

/// A declared configuration parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
  pub id: String,
  pub label: String,
  #[serde(flatten)]
  pub kind: ParamKind,
  pub required: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub default: Option<serde_json::Value>,
}

impl ParamSpec {
  pub fn new(id: impl Into<String>, label: impl Into<String>, kind: ParamKind) -> Self {
    Self {
      id: id.into(),
      label: label.into(),
      kind,
      required: false,
      default: None,
    }
  }

  pub fn required(mut self) -> Self {
    self.required = true;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn any_matches_everything() {
    let any = DataType::Any;
    let text = DataType::primitive(PrimitiveType::Text);
    assert!(any.compatible_with(&text));
    assert!(text.compatible_with(&any));
  }

  #[test]
  fn primitives_match_by_name() {
    let text = DataType::primitive(PrimitiveType::Text);
    let number = DataType::primitive(PrimitiveType::Number);
    assert!(text.compatible_with(&text));
    assert!(!number.compatible_with(&text));
  }

  #[test]
  fn contracts_match_by_name_only() {
    let finding = DataType::contract("finding");
    let asset = DataType::contract("asset");
    assert!(finding.compatible_with(&DataType::contract("finding")));
    assert!(!finding.compatible_with(&asset));
    assert!(!finding.compatible_with(&DataType::primitive(PrimitiveType::Json)));
  }

  #[test]
  fn nested_lists_recurse() {
    let list_text = DataType::List {
      element: Box::new(DataType::primitive(PrimitiveType::Text)),
    };
    let list_number = DataType::List {
      element: Box::new(DataType::primitive(PrimitiveType::Number)),
    };
    assert!(list_text.compatible_with(&list_text.clone()));
    assert!(!list_text.compatible_with(&list_number));
  }
}
