//! Expansión de variables de entorno en valores del YAML.
//!
//! Sintaxis soportada: `${VAR}` y `${VAR:-default}`. Sin variable y sin
//! default, el patrón se conserva tal cual (el error aflorará después con
//! contexto mejor).

use serde_yaml::Value;

fn expand_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(close) = input[i + 2..].find('}') {
                let inner = &input[i + 2..i + 2 + close];
                let (name, default) = match inner.split_once(":-") {
                    Some((name, default)) => (name, Some(default)),
                    None => (inner, None),
                };
                let valid_name = !name.is_empty()
                                 && name.chars().next().map(|c| c.is_ascii_uppercase() || c == '_').unwrap_or(false)
                                 && name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
                if valid_name {
                    match std::env::var(name) {
                        Ok(value) => out.push_str(&value),
                        Err(_) => match default {
                            Some(default) => out.push_str(default),
                            None => out.push_str(&input[i..i + 3 + close]),
                        },
                    }
                    i += 3 + close;
                    continue;
                }
            }
        }
        let ch = input[i..].chars().next().expect("char boundary");
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Expande recursivamente todas las strings de un árbol YAML.
pub fn expand_env_vars(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(expand_string(&s)),
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(expand_env_vars).collect()),
        Value::Mapping(map) => Value::Mapping(map.into_iter().map(|(k, v)| (k, expand_env_vars(v))).collect()),
        other => other,
    }
}
