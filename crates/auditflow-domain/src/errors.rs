// errors.rs
use thiserror::Error;

/// Error del dominio de contratos y filas.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Error de validación: {0}")]
    ValidationError(String),

    #[error("Contrato bloqueado: {0}")]
    ContractLocked(String),

    #[error("Campo desconocido '{field}' en contrato de modo fixed")]
    UnknownField { field: String },

    #[error("Campo requerido ausente: '{field}'")]
    MissingField { field: String },

    #[error("Tipo incompatible en campo '{field}': se esperaba {expected}, llegó {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Error de serialización: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::SerializationError(e.to_string())
    }
}
