//! Lotes de agregación y disparadores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Draft,
    Executing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Draft => "draft",
            BatchStatus::Executing => "executing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<BatchStatus> {
        match s {
            "draft" => Some(BatchStatus::Draft),
            "executing" => Some(BatchStatus::Executing),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

/// Qué disparó el flush de un lote. `EndOfSource` es implícito: siempre se
/// chequea cuando el source se agota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Count,
    Timeout,
    Condition,
    EndOfSource,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Count => "count",
            TriggerType::Timeout => "timeout",
            TriggerType::Condition => "condition",
            TriggerType::EndOfSource => "end_of_source",
        }
    }

    pub fn parse(s: &str) -> Option<TriggerType> {
        match s {
            "count" => Some(TriggerType::Count),
            "timeout" => Some(TriggerType::Timeout),
            "condition" => Some(TriggerType::Condition),
            "end_of_source" => Some(TriggerType::EndOfSource),
            _ => None,
        }
    }
}

/// Lote de agregación.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub run_id: Uuid,
    pub aggregation_node_id: String,
    pub attempt: u32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    /// Estado de nodo que completó/falló el lote.
    pub state_id: Option<Uuid>,
    pub trigger_type: Option<TriggerType>,
    pub trigger_reason: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Una fila por token consumido en un lote; `ordinal` es el orden de accept
/// y se preserva al restaurar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMember {
    pub batch_id: Uuid,
    pub token_id: Uuid,
    pub ordinal: u32,
}
