//! Conversion between JSON parameter maps and CEL values.

use std::collections::HashMap;

use cel_interpreter::objects::Key;
use cel_interpreter::Value as CelValue;
use serde_json::Value as JsonValue;

use crate::schema::CaveatParameterType;

/// Converts a JSON value into the corresponding CEL value.
///
/// Numbers convert in priority order i64, u64, f64, so large positive
/// integers keep their precision instead of degrading to floats.
pub fn json_to_cel(value: &JsonValue) -> CelValue {
    match value {
        JsonValue::Null => CelValue::Null,
        JsonValue::Bool(b) => CelValue::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                CelValue::UInt(u)
            } else if let Some(f) = n.as_f64() {
                CelValue::Float(f)
            } else {
                CelValue::Null
            }
        }
        JsonValue::String(s) => CelValue::String(s.clone().into()),
        JsonValue::Array(items) => {
            CelValue::List(items.iter().map(json_to_cel).collect::<Vec<_>>().into())
        }
        JsonValue::Object(fields) => {
            let converted: HashMap<Key, CelValue> = fields
                .iter()
                .map(|(k, v)| (Key::String(k.clone().into()), json_to_cel(v)))
                .collect();
            CelValue::Map(converted.into())
        }
    }
}

/// Whether a JSON value is acceptable for a declared parameter type.
pub fn value_matches_type(value: &JsonValue, expected: CaveatParameterType) -> bool {
    match expected {
        CaveatParameterType::String => value.is_string(),
        CaveatParameterType::Int => value.as_i64().is_some(),
        CaveatParameterType::Uint => value.as_u64().is_some(),
        CaveatParameterType::Double => value.is_number(),
        CaveatParameterType::Bool => value.is_boolean(),
        CaveatParameterType::List => value.is_array(),
        CaveatParameterType::Map => value.is_object(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_prefer_signed_integers() {
        assert!(matches!(json_to_cel(&json!(5)), CelValue::Int(5)));
        assert!(matches!(
            json_to_cel(&json!(u64::MAX)),
            CelValue::UInt(u64::MAX)
        ));
        assert!(matches!(json_to_cel(&json!(1.5)), CelValue::Float(_)));
    }

    #[test]
    fn type_checks_follow_declarations() {
        assert!(value_matches_type(&json!("a"), CaveatParameterType::String));
        assert!(value_matches_type(&json!(1), CaveatParameterType::Int));
        assert!(value_matches_type(&json!(1), CaveatParameterType::Double));
        assert!(!value_matches_type(&json!("a"), CaveatParameterType::Int));
        assert!(!value_matches_type(&json!(-1), CaveatParameterType::Uint));
        assert!(value_matches_type(&json!([1]), CaveatParameterType::List));
        assert!(value_matches_type(&json!({"k": 1}), CaveatParameterType::Map));
    }
}
