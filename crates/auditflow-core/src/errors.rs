//! Errores semánticos del core, agrupados por política de propagación.
//!
//! - Errores de configuración se levantan al compilar el grafo y nunca se
//!   recuperan.
//! - Violaciones de integridad de auditoría son fatales: continuar dejaría un
//!   landscape incompleto.
//! - Errores de procesamiento de plugin NO viven acá: fluyen como variante
//!   `error` de `TransformResult` para seguir siendo configurables.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    #[error("configuration error: {0}")] Config(String),

    #[error("no edge registered from node {node_id} with label '{label}'; audit trail would be incomplete")]
    MissingEdge { node_id: String, label: String },

    #[error("audit integrity violation: {0}")] AuditIntegrity(String),

    #[error("corrupt audit record: {0}")] Corruption(String),

    #[error("plugin '{plugin}' violated its contract: {message}")]
    PluginContract { plugin: String, message: String },

    #[error("capacity error from external service (status {status})")] Capacity { status: u16 },

    #[error("transient error: {0}")] Transient(String),

    #[error("coalesce '{name}' timed out waiting for branches: {missing:?}")]
    CoalesceTimeout { name: String, missing: Vec<String> },

    #[error("checkpoint version mismatch: found {found}, expected {expected}")]
    CheckpointVersionMismatch { found: u32, expected: u32 },

    #[error("checkpoint payload too large: {size} bytes (cap {cap})")]
    CheckpointTooLarge { size: usize, cap: usize },

    #[error("non-canonical value: {0}")] NonCanonical(String),

    #[error("internal: {0}")] Internal(String),
}

impl From<auditflow_domain::DomainError> for EngineError {
    fn from(e: auditflow_domain::DomainError) -> Self {
        EngineError::Config(e.to_string())
    }
}

/// Clasificación gruesa para la capa de persistencia y los reportes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Runtime,
    Transient,
    Permanent,
}

/// Clasifica un error del motor para persistencia/reintentos.
pub fn classify_error(e: &EngineError) -> ErrorClass {
    match e {
        EngineError::Config(_) | EngineError::NonCanonical(_) => ErrorClass::Validation,
        EngineError::Capacity { .. } | EngineError::Transient(_) => ErrorClass::Transient,
        EngineError::MissingEdge { .. }
        | EngineError::AuditIntegrity(_)
        | EngineError::Corruption(_)
        | EngineError::PluginContract { .. }
        | EngineError::CheckpointVersionMismatch { .. }
        | EngineError::CheckpointTooLarge { .. } => ErrorClass::Permanent,
        EngineError::CoalesceTimeout { .. } | EngineError::Internal(_) => ErrorClass::Runtime,
    }
}
