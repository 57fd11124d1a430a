//! Tokens: el handle de ejecución por fila.
//!
//! Una fila puede tener varios tokens después de fork/expand. El token
//! persistido es inmutable salvo por su registro de outcome; el handle en
//! vuelo (`TokenInfo`) lleva además la fila con su contrato.

use auditflow_domain::PipelineRow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token persistido en el landscape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub token_id: Uuid,
    pub row_id: Uuid,
    pub fork_group_id: Option<Uuid>,
    pub join_group_id: Option<Uuid>,
    pub expand_group_id: Option<Uuid>,
    pub branch_name: Option<String>,
    pub step_in_pipeline: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Relación padre/hijo entre tokens.
///
/// Existe por dos motivos: fork (un padre, varios hijos) y coalesce (varios
/// padres, un hijo). `ordinal` preserva el orden de las ramas/padres.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenParent {
    pub child_token_id: Uuid,
    pub parent_token_id: Uuid,
    pub ordinal: u32,
}

/// Handle en vuelo: identidad + fila con contrato.
///
/// Nunca cruza fronteras externas con su contrato; los executors extraen el
/// mapeo plano en cada punto de grabación.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token_id: Uuid,
    pub row_id: Uuid,
    pub row: PipelineRow,
    pub branch_name: Option<String>,
}

impl TokenInfo {
    pub fn new(token_id: Uuid, row_id: Uuid, row: PipelineRow) -> Self {
        Self { token_id,
               row_id,
               row,
               branch_name: None }
    }

    /// Handle con la misma identidad y otra fila (post-transform).
    pub fn with_row(&self, row: PipelineRow) -> Self {
        Self { token_id: self.token_id,
               row_id: self.row_id,
               row,
               branch_name: self.branch_name.clone() }
    }
}
