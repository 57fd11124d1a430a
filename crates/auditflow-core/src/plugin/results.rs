//! Resultados de plugin como uniones etiquetadas.
//!
//! `TransformResult` y `GateResult` llevan campos de auditoría que POPULA EL
//! EXECUTOR (input_hash, output_hash, duration_ms); los plugins no los tocan.
//! La variante `Error` de `TransformResult` es un fallo de procesamiento
//! legítimo (ruta configurable), no una excepción.

use auditflow_domain::SchemaContract;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::model::RoutingAction;

/// Señales y fallos no-de-negocio de un plugin.
///
/// - `BatchPending`: señal de control de flujo, no un error. El lote fue
///   enviado a un sistema remoto y aún no hay resultado; el estado del nodo
///   se cierra PENDING y el buffer NO se resetea.
/// - `Capacity`: HTTP 429/503/529 o equivalentes; el pool reintenta con
///   backoff.
/// - `Fatal`: bug del plugin; se graba el fallo y se propaga.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PluginError {
    #[error("batch submitted but not yet complete")] BatchPending,
    #[error("capacity error (status {status})")] Capacity { status: u16 },
    #[error("plugin failure: {0}")] Fatal(String),
}

/// Campos de auditoría compartidos por los resultados.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFields {
    pub input_hash: Option<String>,
    pub output_hash: Option<String>,
    pub duration_ms: Option<f64>,
}

/// Resultado de un transform (fila única o lote).
#[derive(Debug, Clone)]
pub enum TransformResult {
    /// Una fila de salida. `contract` opcional: si falta, el executor reutiliza
    /// el contrato del token de entrada.
    Success {
        row: IndexMap<String, Value>,
        contract: Option<Arc<SchemaContract>>,
        audit: AuditFields,
    },
    /// Varias filas de salida: el orchestrator expande tokens. La fila del
    /// token de entrada queda intacta.
    SuccessMulti {
        rows: Vec<IndexMap<String, Value>>,
        contract: Option<Arc<SchemaContract>>,
        audit: AuditFields,
    },
    /// Fallo de procesamiento legítimo, ruteable vía on_error.
    Error {
        reason: Value,
        retryable: bool,
        audit: AuditFields,
    },
}

impl TransformResult {
    pub fn success(row: IndexMap<String, Value>) -> Self {
        TransformResult::Success { row,
                                   contract: None,
                                   audit: AuditFields::default() }
    }

    pub fn success_with_contract(row: IndexMap<String, Value>, contract: Arc<SchemaContract>) -> Self {
        TransformResult::Success { row,
                                   contract: Some(contract),
                                   audit: AuditFields::default() }
    }

    pub fn success_multi(rows: Vec<IndexMap<String, Value>>) -> Self {
        TransformResult::SuccessMulti { rows,
                                        contract: None,
                                        audit: AuditFields::default() }
    }

    pub fn error(reason: Value) -> Self {
        TransformResult::Error { reason,
                                 retryable: false,
                                 audit: AuditFields::default() }
    }

    pub fn error_retryable(reason: Value) -> Self {
        TransformResult::Error { reason,
                                 retryable: true,
                                 audit: AuditFields::default() }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, TransformResult::Error { .. })
    }

    pub fn audit_mut(&mut self) -> &mut AuditFields {
        match self {
            TransformResult::Success { audit, .. }
            | TransformResult::SuccessMulti { audit, .. }
            | TransformResult::Error { audit, .. } => audit,
        }
    }

    pub fn audit(&self) -> &AuditFields {
        match self {
            TransformResult::Success { audit, .. }
            | TransformResult::SuccessMulti { audit, .. }
            | TransformResult::Error { audit, .. } => audit,
        }
    }
}

/// Resultado de un gate: fila (posiblemente anotada) + acción de ruteo.
#[derive(Debug, Clone)]
pub struct GateResult {
    pub row: IndexMap<String, Value>,
    pub action: RoutingAction,
    pub contract: Option<Arc<SchemaContract>>,
    pub audit: AuditFields,
}

impl GateResult {
    pub fn new(row: IndexMap<String, Value>, action: RoutingAction) -> Self {
        Self { row,
               action,
               contract: None,
               audit: AuditFields::default() }
    }
}

/// Descriptor devuelto por un sink tras escribir.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDescriptor {
    pub artifact_type: String,
    pub path_or_uri: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub idempotency_key: Option<String>,
}
