//! Fingerprinting de secretos en options de plugins.
//!
//! Detección por patrón de nombre (nombres exactos y sufijos). El valor se
//! reemplaza por un fingerprint keyed ANTES de que las options entren al
//! landscape: el hash permite correlacionar configuraciones sin exponer el
//! secreto. Sin clave de fingerprint y con secretos presentes, la carga
//! falla salvo que se permitan secretos crudos explícitamente (modo dev).

use serde_json::Value;
use sha2::{Digest, Sha256};

const SECRET_FIELD_NAMES: &[&str] = &["api_key", "token", "password", "secret", "credential"];
const SECRET_FIELD_SUFFIXES: &[&str] = &["_secret", "_key", "_token", "_password", "_credential"];

pub const FINGERPRINT_KEY_ENV: &str = "AUDITFLOW_FINGERPRINT_KEY";
pub const ALLOW_RAW_ENV: &str = "AUDITFLOW_ALLOW_RAW_SECRETS";

fn is_secret_field(name: &str) -> bool {
    SECRET_FIELD_NAMES.contains(&name) || SECRET_FIELD_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn fingerprint(key: &str, field: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b"\x00");
    hasher.update(field.as_bytes());
    hasher.update(b"\x00");
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for b in digest.iter().take(8) {
        hex.push_str(&format!("{:02x}", b));
    }
    format!("fingerprint:{hex}")
}

/// Resultado del barrido de secretos de un bloque de options.
pub struct SecretScan {
    pub options: Value,
    /// Campos que se reemplazaron (o se habrían reemplazado).
    pub secret_fields: Vec<String>,
}

/// Reemplaza recursivamente campos secretos por sus fingerprints.
///
/// - Con clave: reemplazo por fingerprint keyed.
/// - Sin clave y `allow_raw`: los valores quedan crudos (modo dev).
/// - Sin clave y sin `allow_raw`: el llamador debe fallar con la lista de
///   campos ofensores.
pub fn fingerprint_secrets(options: &Value, key: Option<&str>, allow_raw: bool) -> SecretScan {
    let mut secret_fields = Vec::new();
    let rewritten = walk(options, key, allow_raw, &mut secret_fields, "");
    SecretScan { options: rewritten,
                 secret_fields }
}

fn walk(value: &Value, key: Option<&str>, allow_raw: bool, found: &mut Vec<String>, path: &str) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (name, v) in map {
                let child_path = if path.is_empty() { name.clone() } else { format!("{path}.{name}") };
                if is_secret_field(name) && v.is_string() {
                    found.push(child_path.clone());
                    let replaced = match key {
                        Some(k) => Value::String(fingerprint(k, name, v.as_str().unwrap_or_default())),
                        None if allow_raw => v.clone(),
                        None => v.clone(), // el llamador falla; el valor no se usa
                    };
                    out.insert(name.clone(), replaced);
                } else {
                    out.insert(name.clone(), walk(v, key, allow_raw, found, &child_path));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| walk(v, key, allow_raw, found, path)).collect())
        }
        other => other.clone(),
    }
}
