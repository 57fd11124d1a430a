//! Campos de contrato: tipo declarado, nombre normalizado y procedencia.
//!
//! Un `FieldContract` describe un campo individual dentro de un
//! `SchemaContract`. El nombre normalizado es la clave efectiva dentro de la
//! fila; el nombre original preserva la forma exacta con la que el campo fue
//! declarado u observado (cabecera CSV, clave YAML, etc.).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Tipos planos soportados por el sistema de contratos.
///
/// `Any` acepta cualquier valor JSON; se usa para campos anidados producidos
/// por merges `nested` y para campos inferidos sin tipo estable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Float,
    Str,
    Bool,
    Any,
}

impl FieldType {
    /// Nombre estable usado en la forma canónica del contrato.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Str => "str",
            FieldType::Bool => "bool",
            FieldType::Any => "any",
        }
    }

    /// Parsea el nombre estable. Desconocidos son error del llamador.
    pub fn parse(s: &str) -> Option<FieldType> {
        match s {
            "int" => Some(FieldType::Int),
            "float" => Some(FieldType::Float),
            "str" => Some(FieldType::Str),
            "bool" => Some(FieldType::Bool),
            "any" => Some(FieldType::Any),
            _ => None,
        }
    }

    /// Compatibilidad del valor JSON con el tipo declarado.
    ///
    /// `Int` acepta enteros exactos; `Float` acepta cualquier número JSON.
    /// `null` se considera compatible: la obligatoriedad se valida aparte
    /// mediante el flag `required`.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::Int => matches!(value, Value::Null) || value.as_i64().is_some() || value.as_u64().is_some(),
            FieldType::Float => matches!(value, Value::Null | Value::Number(_)),
            FieldType::Str => matches!(value, Value::Null | Value::String(_)),
            FieldType::Bool => matches!(value, Value::Null | Value::Bool(_)),
        }
    }

    /// Tipo inferido de un valor observado.
    pub fn infer(value: &Value) -> FieldType {
        match value {
            Value::Bool(_) => FieldType::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => FieldType::Int,
            Value::Number(_) => FieldType::Float,
            Value::String(_) => FieldType::Str,
            _ => FieldType::Any,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Procedencia de un campo: declarado en configuración u observado en datos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    Declared,
    Inferred,
}

impl FieldSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldSource::Declared => "declared",
            FieldSource::Inferred => "inferred",
        }
    }
}

/// Campo individual de un contrato.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldContract {
    pub normalized_name: String,
    pub original_name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub source: FieldSource,
}

impl FieldContract {
    /// Campo declarado (requerido por defecto).
    pub fn declared(name: &str, field_type: FieldType, required: bool) -> Self {
        Self { normalized_name: name.to_string(),
               original_name: name.to_string(),
               field_type,
               required,
               source: FieldSource::Declared }
    }

    /// Campo inferido a partir de un valor observado. Nunca es requerido:
    /// la observación de un valor no implica garantía de presencia.
    pub fn inferred(name: &str, value: &Value) -> Self {
        Self { normalized_name: name.to_string(),
               original_name: name.to_string(),
               field_type: FieldType::infer(value),
               required: false,
               source: FieldSource::Inferred }
    }
}
