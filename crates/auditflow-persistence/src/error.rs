//! Errores de la capa de persistencia y su clasificación.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("serialization conflict")] SerializationConflict,
    #[error("transient io: {0}")] TransientIo(String),
    #[error("constraint violation: {0}")] Constraint(String),
    #[error("unknown: {0}")] Unknown(String),
}

impl From<diesel::result::Error> for PersistenceError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};
        match e {
            Error::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
                let _ = info;
                PersistenceError::SerializationConflict
            }
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                PersistenceError::Constraint(info.message().to_string())
            }
            other => PersistenceError::Unknown(other.to_string()),
        }
    }
}

impl From<PersistenceError> for auditflow_core::EngineError {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::SerializationConflict | PersistenceError::TransientIo(_) => {
                auditflow_core::EngineError::Transient(e.to_string())
            }
            PersistenceError::Constraint(msg) => auditflow_core::EngineError::AuditIntegrity(msg),
            PersistenceError::Unknown(msg) => auditflow_core::EngineError::Internal(msg),
        }
    }
}

/// Errores transitorios recomendados para retry con backoff.
pub fn is_retryable(e: &PersistenceError) -> bool {
    match e {
        PersistenceError::SerializationConflict => true,
        PersistenceError::TransientIo(_) => true,
        // Mensajes comunes de desconexión/timeout detectados por texto
        // (best-effort, sin acoplar a SQLSTATE).
        PersistenceError::Unknown(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
            || m.contains("could not serialize access due to concurrent update")
            || m.contains("terminating connection due to administrator command")
            || m.contains("connection closed")
            || m.contains("connection refused")
            || m.contains("timeout")
        }
        PersistenceError::Constraint(_) => false,
    }
}
