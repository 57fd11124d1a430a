//! Payload store: blobs direccionados por contenido.
//!
//! El landscape guarda hashes; los payloads completos (request/response de
//! llamadas, razones de ruteo, datos fuente) van a un store aparte mapeado
//! por referencia. La referencia ES el hash canónico del payload: escribir
//! dos veces el mismo contenido deduplica solo.

use dashmap::DashMap;
use serde_json::Value;
use std::path::PathBuf;

use crate::errors::EngineError;
use crate::hashing::{hash_value, to_canonical_json};

/// Store de payloads direccionado por contenido.
pub trait PayloadStore: Send + Sync {
    /// Persiste el payload y devuelve su referencia (hash canónico).
    fn put(&self, payload: &Value) -> Result<String, EngineError>;

    /// Recupera un payload por referencia; `None` si nunca se guardó.
    fn get(&self, reference: &str) -> Result<Option<Value>, EngineError>;
}

/// Backend en memoria (tests, corridas efímeras).
#[derive(Default)]
pub struct InMemoryPayloadStore {
    blobs: DashMap<String, Value>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadStore for InMemoryPayloadStore {
    fn put(&self, payload: &Value) -> Result<String, EngineError> {
        let reference = hash_value(payload);
        self.blobs.insert(reference.clone(), payload.clone());
        Ok(reference)
    }

    fn get(&self, reference: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.blobs.get(reference).map(|b| b.clone()))
    }
}

/// Backend de filesystem: un archivo por hash bajo `base_path`, con los dos
/// primeros caracteres del hash como subdirectorio (evita directorios
/// gigantes).
pub struct FilesystemPayloadStore {
    base_path: PathBuf,
}

impl FilesystemPayloadStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into() }
    }

    fn path_for(&self, reference: &str) -> PathBuf {
        let shard = if reference.len() >= 2 { &reference[..2] } else { "xx" };
        self.base_path.join(shard).join(format!("{reference}.json"))
    }
}

impl PayloadStore for FilesystemPayloadStore {
    fn put(&self, payload: &Value) -> Result<String, EngineError> {
        let reference = hash_value(payload);
        let path = self.path_for(&reference);
        if path.exists() {
            return Ok(reference);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Transient(format!("payload store mkdir: {e}")))?;
        }
        std::fs::write(&path, to_canonical_json(payload))
            .map_err(|e| EngineError::Transient(format!("payload store write: {e}")))?;
        Ok(reference)
    }

    fn get(&self, reference: &str) -> Result<Option<Value>, EngineError> {
        let path = self.path_for(reference);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(|e| EngineError::Transient(format!("payload store read: {e}")))?;
        let value = serde_json::from_str(&text)
            .map_err(|e| EngineError::Corruption(format!("payload {reference} is not valid JSON: {e}")))?;
        Ok(Some(value))
    }
}
