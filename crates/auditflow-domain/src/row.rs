//! Fila en memoria: mapeo ordenado + contrato compartido.
//!
//! Invariante de frontera: el par (datos, contrato) NUNCA cruza hacia
//! colaboradores externos (sinks, recorder). En esas fronteras se extrae un
//! mapeo plano con `to_dict()`. Dentro del motor la fila viaja completa para
//! que los executors puedan reconstruir contratos al expandir lotes.

use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

use crate::contract::SchemaContract;
use crate::errors::DomainError;

/// Fila de pipeline: datos + contrato.
///
/// El mapeo es `IndexMap` para preservar orden de inserción: los campos
/// declarados del contrato conservan prioridad de orden frente a extras
/// permitidos por el modo `Flexible`.
#[derive(Debug, Clone)]
pub struct PipelineRow {
    data: IndexMap<String, Value>,
    contract: Arc<SchemaContract>,
}

impl PipelineRow {
    /// Construye una fila validando los datos contra el contrato.
    pub fn new(data: IndexMap<String, Value>, contract: Arc<SchemaContract>) -> Result<Self, DomainError> {
        contract.validate(data.iter())?;
        Ok(Self { data, contract })
    }

    /// Construye sin validar. Reservado para reconstrucciones desde el
    /// recorder, donde los datos ya pasaron la validación al escribirse.
    pub fn from_trusted(data: IndexMap<String, Value>, contract: Arc<SchemaContract>) -> Self {
        Self { data, contract }
    }

    pub fn contract(&self) -> &Arc<SchemaContract> {
        &self.contract
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    /// Extracción explícita a mapeo plano para fronteras de auditoría.
    pub fn to_dict(&self) -> IndexMap<String, Value> {
        self.data.clone()
    }

    /// Mapeo plano como `serde_json::Value` (entrada de hashes canónicos).
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (k, v) in &self.data {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }

    /// Fila nueva con los mismos datos y otro contrato.
    pub fn with_contract(&self, contract: Arc<SchemaContract>) -> Result<Self, DomainError> {
        PipelineRow::new(self.data.clone(), contract)
    }

    /// Fila nueva con otros datos y el mismo contrato.
    pub fn with_data(&self, data: IndexMap<String, Value>) -> Result<Self, DomainError> {
        PipelineRow::new(data, Arc::clone(&self.contract))
    }
}

/// Convierte un `Value::Object` en el mapeo ordenado de una fila.
/// Cualquier otra variante es un error: las filas siempre son objetos.
pub fn value_to_map(value: &Value) -> Result<IndexMap<String, Value>, DomainError> {
    match value {
        Value::Object(map) => {
            let mut out = IndexMap::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), v.clone());
            }
            Ok(out)
        }
        other => Err(DomainError::ValidationError(format!("una fila debe ser un objeto JSON, llegó: {other}"))),
    }
}
