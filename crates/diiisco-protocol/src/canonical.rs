//! Canonical JSON encoding for envelope signing.
//!
//! Signatures are computed over a deterministic JSON rendering of the
//! envelope with the `signature` field removed:
//!
//! - object keys sorted lexicographically at every depth,
//! - arrays encoded in source order,
//! - no insignificant whitespace,
//! - standard JSON escaping and number formatting,
//! - UTF-8 output.
//!
//! Two envelopes that differ only in map key order therefore produce
//! identical canonical bytes, so re-encoding a received envelope never
//! invalidates its signature.

use serde_json::Value;

use diiisco_types::{DiiiscoError, Result};

/// Renders a JSON value into its canonical byte encoding.
pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_value(&mut out, value)?;
    Ok(out)
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        // serde_json's own formatting is used for numbers and strings
        // so canonical output matches what any JSON reader round-trips.
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_escaped(out, s)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_escaped(out, key)?;
                out.push(b':');
                // Key membership is guaranteed by the iteration above.
                if let Some(v) = map.get(*key) {
                    write_value(out, v)?;
                }
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_escaped(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let quoted =
        serde_json::to_string(s).map_err(|e| DiiiscoError::ProtocolError {
            reason: format!("failed to escape JSON string: {e}"),
        })?;
    out.extend_from_slice(quoted.as_bytes());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canon(value: &Value) -> String {
        String::from_utf8(canonical_json_bytes(value).unwrap()).unwrap()
    }

    #[test]
    fn keys_sorted_at_every_depth() {
        let value = json!({
            "zebra": { "b": 1, "a": 2 },
            "alpha": [ { "y": 1, "x": 2 } ]
        });
        assert_eq!(
            canon(&value),
            r#"{"alpha":[{"x":2,"y":1}],"zebra":{"a":2,"b":1}}"#
        );
    }

    #[test]
    fn arrays_keep_source_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(canon(&value), "[3,1,2]");
    }

    #[test]
    fn key_order_does_not_change_output() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(
            canonical_json_bytes(&a).unwrap(),
            canonical_json_bytes(&b).unwrap()
        );
    }

    #[test]
    fn strings_escaped_like_serde_json() {
        let value = json!({ "msg": "line\n\"quoted\"" });
        assert_eq!(canon(&value), r#"{"msg":"line\n\"quoted\""}"#);
    }

    #[test]
    fn numbers_match_serde_json_formatting() {
        let value = json!({ "int": 42, "float": 0.017, "neg": -3 });
        assert_eq!(canon(&value), r#"{"float":0.017,"int":42,"neg":-3}"#);
    }

    #[test]
    fn null_and_bool_literals() {
        assert_eq!(canon(&json!(null)), "null");
        assert_eq!(canon(&json!(true)), "true");
        assert_eq!(canon(&json!(false)), "false");
    }

    #[test]
    fn encoding_is_deterministic() {
        let value = json!({ "a": [1, 2, { "k": "v" }], "b": 0.5 });
        let first = canonical_json_bytes(&value).unwrap();
        let second = canonical_json_bytes(&value).unwrap();
        assert_eq!(first, second);
    }
}
