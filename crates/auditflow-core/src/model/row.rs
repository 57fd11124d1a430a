//! Registro de fila fuente.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fila persistida del source. `row_index` es monotónico por source dentro
/// del run; `source_data_ref` apunta al payload completo en el payload store
/// cuando se configuró uno.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowRecord {
    pub row_id: Uuid,
    pub run_id: Uuid,
    pub source_node_id: String,
    pub row_index: u64,
    pub source_data_hash: String,
    pub source_data_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}
