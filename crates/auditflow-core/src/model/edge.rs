//! Edges dirigidos con etiqueta y modo de ruteo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Modo de ruteo de un edge o evento de ruteo.
///
/// - `Move`: el token se consume en el destino.
/// - `Copy`: el token se duplica (ramas de fork).
/// - `Divert`: edge estructural; existe para alcanzabilidad de auditoría
///   (cuarentena, errores de transform) y no se recorre en procesamiento
///   normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoutingMode {
    Move,
    Copy,
    Divert,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Move => "MOVE",
            RoutingMode::Copy => "COPY",
            RoutingMode::Divert => "DIVERT",
        }
    }

    pub fn parse(s: &str) -> Option<RoutingMode> {
        match s {
            "MOVE" => Some(RoutingMode::Move),
            "COPY" => Some(RoutingMode::Copy),
            "DIVERT" => Some(RoutingMode::Divert),
            _ => None,
        }
    }
}

/// Edge registrado en el landscape. El par (from_node, label) es único por
/// run: `edge_id` se deriva determinísticamente de su contenido para que
/// sea estable entre corridas (requisito de recuperación).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub edge_id: String,
    pub run_id: Uuid,
    pub from_node: String,
    pub to_node: String,
    pub label: String,
    pub mode: RoutingMode,
    pub created_at: DateTime<Utc>,
}
