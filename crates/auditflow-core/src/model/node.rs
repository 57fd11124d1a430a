//! Nodo del DAG: identidad determinista + clase de determinismo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Tipo de vértice del pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    Transform,
    Gate,
    Aggregation,
    Coalesce,
    Sink,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::Transform => "transform",
            NodeKind::Gate => "gate",
            NodeKind::Aggregation => "aggregation",
            NodeKind::Coalesce => "coalesce",
            NodeKind::Sink => "sink",
        }
    }

    pub fn parse(s: &str) -> Option<NodeKind> {
        match s {
            "source" => Some(NodeKind::Source),
            "transform" => Some(NodeKind::Transform),
            "gate" => Some(NodeKind::Gate),
            "aggregation" => Some(NodeKind::Aggregation),
            "coalesce" => Some(NodeKind::Coalesce),
            "sink" => Some(NodeKind::Sink),
            _ => None,
        }
    }
}

/// Clase de determinismo declarada por el plugin del nodo.
///
/// Participa del grado de reproducibilidad del run: un pipeline con llamadas
/// externas nunca puede reclamar reproducibilidad total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    Deterministic,
    Seeded,
    IoRead,
    IoWrite,
    ExternalCall,
    NonDeterministic,
}

impl Determinism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Determinism::Deterministic => "deterministic",
            Determinism::Seeded => "seeded",
            Determinism::IoRead => "io_read",
            Determinism::IoWrite => "io_write",
            Determinism::ExternalCall => "external_call",
            Determinism::NonDeterministic => "non_deterministic",
        }
    }

    pub fn parse(s: &str) -> Option<Determinism> {
        match s {
            "deterministic" => Some(Determinism::Deterministic),
            "seeded" => Some(Determinism::Seeded),
            "io_read" => Some(Determinism::IoRead),
            "io_write" => Some(Determinism::IoWrite),
            "external_call" => Some(Determinism::ExternalCall),
            "non_deterministic" => Some(Determinism::NonDeterministic),
            _ => None,
        }
    }
}

/// Registro de nodo en el landscape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub run_id: Uuid,
    pub kind: NodeKind,
    pub plugin_name: String,
    pub plugin_version: String,
    pub config_json: Value,
    pub config_hash: String,
    pub determinism: Determinism,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    /// Posición en el pipeline; null para nodos no secuenciados (sinks,
    /// coalesce). El desempate de orden es (registered_at, node_id).
    pub sequence: Option<u32>,
    pub registered_at: DateTime<Utc>,
}
