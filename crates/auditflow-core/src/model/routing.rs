//! Eventos y acciones de ruteo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::edge::RoutingMode;

/// Evento de ruteo persistido: una decisión de un gate/nodo sobre un edge
/// registrado. El orden global dentro de un run es
/// (step_index, attempt, ordinal), nunca el orden lexicográfico de state_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEvent {
    pub event_id: Uuid,
    pub state_id: Uuid,
    pub edge_id: String,
    /// Agrupa los eventos de una misma acción multi-destino (fork).
    pub routing_group_id: Uuid,
    /// Posición dentro del grupo, ascendente.
    pub ordinal: u32,
    pub mode: RoutingMode,
    pub reason_hash: Option<String>,
    pub reason_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Decisión emitida por un gate.
///
/// Unión etiquetada: el executor ramifica por variante, nunca sondea campos.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingAction {
    /// Seguir al único destino de procesamiento del nodo. Con más de un
    /// destino posible el executor falla cerrado.
    Continue { reason: Option<Value> },
    /// Rutear por etiqueta declarada en la configuración del gate.
    Route {
        label: String,
        mode: RoutingMode,
        reason: Option<Value>,
    },
    /// Bifurcar hacia varias ramas; un evento de ruteo por destino bajo el
    /// mismo routing_group_id.
    ForkToPaths { branches: Vec<String>, reason: Option<Value> },
}

impl RoutingAction {
    pub fn continue_() -> Self {
        RoutingAction::Continue { reason: None }
    }

    pub fn route(label: &str) -> Self {
        RoutingAction::Route { label: label.to_string(),
                               mode: RoutingMode::Move,
                               reason: None }
    }

    pub fn route_with_reason(label: &str, reason: Value) -> Self {
        RoutingAction::Route { label: label.to_string(),
                               mode: RoutingMode::Move,
                               reason: Some(reason) }
    }

    pub fn fork_to_paths(branches: Vec<String>) -> Self {
        RoutingAction::ForkToPaths { branches, reason: None }
    }

    pub fn reason(&self) -> Option<&Value> {
        match self {
            RoutingAction::Continue { reason }
            | RoutingAction::Route { reason, .. }
            | RoutingAction::ForkToPaths { reason, .. } => reason.as_ref(),
        }
    }
}
