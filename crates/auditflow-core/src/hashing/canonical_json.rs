//! Canonical JSON estilo RFC 8785.
//!
//! Notas:
//! - Ordena claves de objetos (BTreeMap) y mantiene el orden de arrays.
//! - Usa la representación por defecto de serde_json para números; los
//!   números no finitos no son representables en JSON y se rechazan en la
//!   frontera con `finite_number`.

use serde_json::{Number, Value};
use std::collections::BTreeMap;

use crate::errors::EngineError;

/// Serializa un `Value` a su forma canónica.
///
/// `serde_json::Number` no puede contener NaN/±∞ en la configuración por
/// defecto, así que la recursión es total; el chequeo de finitud queda en
/// `finite_number`, la única puerta de entrada para floats crudos.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut tree = BTreeMap::new();
            for (k, v) in map {
                tree.insert(k, to_canonical_json(v));
            }
            let items: Vec<String> = tree.into_iter()
                                         .map(|(k, v)| format!("{}:{}", serde_json::to_string(&k).unwrap_or_default(), v))
                                         .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// Convierte un f64 a `Value` rechazando NaN y ±∞.
///
/// Es la única vía soportada para introducir floats crudos en payloads
/// canónicos; un número no finito jamás debe llegar al landscape.
pub fn finite_number(f: f64) -> Result<Value, EngineError> {
    if !f.is_finite() {
        return Err(EngineError::NonCanonical(format!("non-finite number not allowed in canonical JSON: {f}")));
    }
    Number::from_f64(f).map(Value::Number)
                       .ok_or_else(|| EngineError::NonCanonical(format!("number not representable in JSON: {f}")))
}
