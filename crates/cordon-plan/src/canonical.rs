use serde_json::Value;

/// Serialize a JSON value with object keys sorted recursively.
///
/// `HashMap` iteration order must never leak into the plan signature, so the
/// canonical form rebuilds every object over a sorted key list.
pub fn canonical_json(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, key) in keys.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&serde_json::to_string(key).expect("string serializes"));
        out.push(':');
        write_canonical(&map[*key], out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    other => {
      out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn keys_are_sorted_recursively() {
    let a = json!({"b": {"z": 1, "a": 2}, "a": [3, {"y": 4, "x": 5}]});
    assert_eq!(
      canonical_json(&a),
      r#"{"a":[3,{"x":5,"y":4}],"b":{"a":2,"z":1}}"#
    );
  }

  #[test]
  fn equal_values_share_a_canonical_form() {
    let a = json!({"x": 1, "y": 2});
    let b = json!({"y": 2, "x": 1});
    assert_eq!(canonical_json(&a), canonical_json(&b));
  }
}
