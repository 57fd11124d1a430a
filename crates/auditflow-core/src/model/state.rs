//! Estados de nodo: una unión discriminada por status.
//!
//! Cada variante fija qué columnas de completitud deben existir. La capa de
//! repositorios construye estas variantes desde filas crudas y rechaza
//! combinaciones imposibles (leer una fila inconsistente es corrupción, no
//! un valor por defecto).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Columnas comunes a todas las variantes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStateCommon {
    pub state_id: Uuid,
    pub token_id: Uuid,
    pub node_id: String,
    pub step_index: u32,
    pub attempt: u32,
    pub input_hash: String,
    pub started_at: DateTime<Utc>,
    pub context_before: Option<Value>,
    pub context_after: Option<Value>,
}

/// Estado de nodo con invariantes por variante.
///
/// - `Open`: el resto de columnas de completitud DEBEN ser null.
/// - `Pending`: completed_at y duration_ms presentes; output_hash null. Se usa
///   cuando un plugin entregó trabajo a un sistema externo y aún no hay
///   resultado (lotes remotos).
/// - `Completed`: completed_at, duration_ms y output_hash presentes.
/// - `Failed`: completed_at y duration_ms presentes; output_hash opcional;
///   error JSON opcional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeState {
    Open {
        #[serde(flatten)]
        common: NodeStateCommon,
    },
    Pending {
        #[serde(flatten)]
        common: NodeStateCommon,
        completed_at: DateTime<Utc>,
        duration_ms: f64,
    },
    Completed {
        #[serde(flatten)]
        common: NodeStateCommon,
        completed_at: DateTime<Utc>,
        duration_ms: f64,
        output_hash: String,
    },
    Failed {
        #[serde(flatten)]
        common: NodeStateCommon,
        completed_at: DateTime<Utc>,
        duration_ms: f64,
        output_hash: Option<String>,
        error: Option<Value>,
    },
}

impl NodeState {
    pub fn common(&self) -> &NodeStateCommon {
        match self {
            NodeState::Open { common }
            | NodeState::Pending { common, .. }
            | NodeState::Completed { common, .. }
            | NodeState::Failed { common, .. } => common,
        }
    }

    pub fn state_id(&self) -> Uuid {
        self.common().state_id
    }

    pub fn status_str(&self) -> &'static str {
        match self {
            NodeState::Open { .. } => "open",
            NodeState::Pending { .. } => "pending",
            NodeState::Completed { .. } => "completed",
            NodeState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Completed { .. } | NodeState::Failed { .. })
    }

    pub fn output_hash(&self) -> Option<&str> {
        match self {
            NodeState::Completed { output_hash, .. } => Some(output_hash),
            NodeState::Failed { output_hash, .. } => output_hash.as_deref(),
            _ => None,
        }
    }
}
