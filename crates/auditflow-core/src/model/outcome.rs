//! Outcomes de token: clasificación terminal (o explicativa) por token.
//!
//! Reglas de completitud de fila:
//! - Una fila está completa sii TODOS sus tokens tienen outcome terminal y
//!   ese outcome completa fila.
//! - `Forked` y `Expanded` son marcadores de delegación: terminales para el
//!   token padre pero NUNCA completan fila por sí solos (los hijos deben
//!   terminar).
//! - `Buffered` es el único marcador no terminal: el token espera dentro de
//!   un buffer de agregación o de un join.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    Completed,
    Routed,
    Forked,
    Failed,
    Quarantined,
    ConsumedInBatch,
    Coalesced,
    Expanded,
    Buffered,
    DroppedAtCoalesce,
}

impl RowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOutcome::Completed => "completed",
            RowOutcome::Routed => "routed",
            RowOutcome::Forked => "forked",
            RowOutcome::Failed => "failed",
            RowOutcome::Quarantined => "quarantined",
            RowOutcome::ConsumedInBatch => "consumed_in_batch",
            RowOutcome::Coalesced => "coalesced",
            RowOutcome::Expanded => "expanded",
            RowOutcome::Buffered => "buffered",
            RowOutcome::DroppedAtCoalesce => "dropped_at_coalesce",
        }
    }

    pub fn parse(s: &str) -> Option<RowOutcome> {
        match s {
            "completed" => Some(RowOutcome::Completed),
            "routed" => Some(RowOutcome::Routed),
            "forked" => Some(RowOutcome::Forked),
            "failed" => Some(RowOutcome::Failed),
            "quarantined" => Some(RowOutcome::Quarantined),
            "consumed_in_batch" => Some(RowOutcome::ConsumedInBatch),
            "coalesced" => Some(RowOutcome::Coalesced),
            "expanded" => Some(RowOutcome::Expanded),
            "buffered" => Some(RowOutcome::Buffered),
            "dropped_at_coalesce" => Some(RowOutcome::DroppedAtCoalesce),
            _ => None,
        }
    }

    /// Terminalidad estática del outcome. El flag persistido `is_terminal`
    /// DEBE coincidir; la discrepancia es corrupción.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RowOutcome::Buffered)
    }

    /// Si el outcome cuenta para la completitud de la fila. Los marcadores de
    /// delegación no: los hijos son quienes completan.
    pub fn is_row_completing(&self) -> bool {
        self.is_terminal() && !matches!(self, RowOutcome::Forked | RowOutcome::Expanded)
    }
}

/// Outcome persistido de un token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenOutcome {
    pub outcome_id: Uuid,
    pub run_id: Uuid,
    pub token_id: Uuid,
    pub outcome: RowOutcome,
    pub is_terminal: bool,
    pub recorded_at: DateTime<Utc>,
    pub sink_name: Option<String>,
    pub batch_id: Option<Uuid>,
    pub fork_group_id: Option<Uuid>,
    pub join_group_id: Option<Uuid>,
    pub expand_group_id: Option<Uuid>,
    pub error_hash: Option<String>,
    pub context: Option<Value>,
    pub expected_branches: Option<Value>,
}
