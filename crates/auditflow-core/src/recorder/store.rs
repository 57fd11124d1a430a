//! Almacén de auditoría: trait append-only + implementación en memoria.
//!
//! El trait opera sobre filas CRUDAS (enums como strings, booleans como 0/1,
//! ids como texto): la misma forma que devuelve un backend relacional. La
//! capa de repositorios (`repos`) re-parsea estas filas a valores estrictos
//! del dominio; así el backend en memoria y el backend Postgres comparten el
//! mismo contrato de carga estricta.
//!
//! Concurrencia:
//! - Todas las operaciones toman `&self`; el recorder comparte el store entre
//!   orchestrator y executors vía `Arc`.
//! - La implementación en memoria usa `DashMap` (lock por entrada) y
//!   contadores atómicos para `call_index`: escrituras serializables por
//!   padre sin lock global del llamador.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::errors::EngineError;

// ===== Filas crudas (forma relacional) =====

#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub config_hash: String,
    pub settings_json: Value,
    pub canonical_version: String,
    pub status: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub reproducibility: String,
    pub export_status: Option<String>,
    pub export_metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NodeRow {
    pub node_id: String,
    pub run_id: String,
    pub kind: String,
    pub plugin_name: String,
    pub plugin_version: String,
    pub config_json: Value,
    pub config_hash: String,
    pub determinism: String,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub sequence: Option<i64>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub edge_id: String,
    pub run_id: String,
    pub from_node: String,
    pub to_node: String,
    pub label: String,
    pub mode: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RowRow {
    pub row_id: String,
    pub run_id: String,
    pub source_node_id: String,
    pub row_index: i64,
    pub source_data_hash: String,
    pub source_data_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenRow {
    pub token_id: String,
    pub row_id: String,
    pub fork_group_id: Option<String>,
    pub join_group_id: Option<String>,
    pub expand_group_id: Option<String>,
    pub branch_name: Option<String>,
    pub step_in_pipeline: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenParentRow {
    pub child_token_id: String,
    pub parent_token_id: String,
    pub ordinal: i64,
}

#[derive(Debug, Clone)]
pub struct NodeStateRow {
    pub state_id: String,
    pub token_id: String,
    pub node_id: String,
    pub step_index: i64,
    pub attempt: i64,
    pub status: String,
    pub input_hash: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    pub output_hash: Option<String>,
    pub error_json: Option<Value>,
    pub context_before: Option<Value>,
    pub context_after: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RoutingEventRow {
    pub event_id: String,
    pub state_id: String,
    pub edge_id: String,
    pub routing_group_id: String,
    pub ordinal: i64,
    pub mode: String,
    pub reason_hash: Option<String>,
    pub reason_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CallRow {
    pub call_id: String,
    pub state_id: String,
    pub call_index: i64,
    pub call_type: String,
    pub status: String,
    pub request_hash: String,
    pub request_ref: Option<String>,
    pub response_hash: Option<String>,
    pub response_ref: Option<String>,
    pub error_json: Option<Value>,
    pub latency_ms: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BatchRow {
    pub batch_id: String,
    pub run_id: String,
    pub aggregation_node_id: String,
    pub attempt: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub state_id: Option<String>,
    pub trigger_type: Option<String>,
    pub trigger_reason: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct BatchMemberRow {
    pub batch_id: String,
    pub token_id: String,
    pub ordinal: i64,
}

#[derive(Debug, Clone)]
pub struct TokenOutcomeRow {
    pub outcome_id: String,
    pub run_id: String,
    pub token_id: String,
    pub outcome: String,
    /// Entero 0/1; la carga estricta exige exactamente esos valores.
    pub is_terminal: i32,
    pub recorded_at: DateTime<Utc>,
    pub sink_name: Option<String>,
    pub batch_id: Option<String>,
    pub fork_group_id: Option<String>,
    pub join_group_id: Option<String>,
    pub expand_group_id: Option<String>,
    pub error_hash: Option<String>,
    pub context_json: Option<Value>,
    pub expected_branches_json: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ArtifactRow {
    pub artifact_id: String,
    pub run_id: String,
    pub produced_by_state_id: String,
    pub sink_node_id: String,
    pub artifact_type: String,
    pub path_or_uri: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub checkpoint_id: String,
    pub run_id: String,
    pub token_id: String,
    pub node_id: String,
    pub sequence_number: i64,
    pub payload_json: String,
    pub created_at: DateTime<Utc>,
}

// ===== Trait =====

/// Almacén append-only del landscape.
///
/// Contrato:
/// - Inserciones nunca sobrescriben; un id duplicado es violación de
///   integridad.
/// - Las únicas mutaciones permitidas son las transiciones de columnas de
///   status definidas por el modelo (run, node_state, batch).
/// - Los listados no garantizan orden salvo que se indique; el recorder
///   aplica el orden documentado tras el parseo.
pub trait AuditStore: Send + Sync {
    fn insert_run(&self, row: RunRow) -> Result<(), EngineError>;
    fn update_run(&self, row: RunRow) -> Result<(), EngineError>;
    fn get_run(&self, run_id: &str) -> Result<Option<RunRow>, EngineError>;

    fn insert_node(&self, row: NodeRow) -> Result<(), EngineError>;
    fn update_node_output_schema(&self, node_id: &str, run_id: &str, output_schema: Value) -> Result<(), EngineError>;
    fn get_node(&self, run_id: &str, node_id: &str) -> Result<Option<NodeRow>, EngineError>;
    fn list_nodes(&self, run_id: &str) -> Result<Vec<NodeRow>, EngineError>;

    fn insert_edge(&self, row: EdgeRow) -> Result<(), EngineError>;
    fn list_edges(&self, run_id: &str) -> Result<Vec<EdgeRow>, EngineError>;

    fn insert_row(&self, row: RowRow) -> Result<(), EngineError>;
    fn get_row(&self, row_id: &str) -> Result<Option<RowRow>, EngineError>;
    fn list_rows(&self, run_id: &str) -> Result<Vec<RowRow>, EngineError>;

    fn insert_token(&self, row: TokenRow) -> Result<(), EngineError>;
    fn get_token(&self, token_id: &str) -> Result<Option<TokenRow>, EngineError>;
    fn list_tokens_for_row(&self, row_id: &str) -> Result<Vec<TokenRow>, EngineError>;
    fn list_tokens_for_run(&self, run_id: &str) -> Result<Vec<TokenRow>, EngineError>;

    fn insert_token_parent(&self, row: TokenParentRow) -> Result<(), EngineError>;
    fn list_token_parents(&self, child_token_id: &str) -> Result<Vec<TokenParentRow>, EngineError>;
    fn list_token_parents_for_run(&self, run_id: &str) -> Result<Vec<TokenParentRow>, EngineError>;

    fn insert_node_state(&self, row: NodeStateRow) -> Result<(), EngineError>;
    fn update_node_state(&self, row: NodeStateRow) -> Result<(), EngineError>;
    fn get_node_state(&self, state_id: &str) -> Result<Option<NodeStateRow>, EngineError>;
    fn list_states_for_token(&self, token_id: &str) -> Result<Vec<NodeStateRow>, EngineError>;
    fn list_states_for_run(&self, run_id: &str) -> Result<Vec<NodeStateRow>, EngineError>;

    fn insert_routing_event(&self, row: RoutingEventRow) -> Result<(), EngineError>;
    fn list_routing_events_for_state(&self, state_id: &str) -> Result<Vec<RoutingEventRow>, EngineError>;
    fn list_routing_events_for_run(&self, run_id: &str) -> Result<Vec<RoutingEventRow>, EngineError>;

    fn insert_call(&self, row: CallRow) -> Result<(), EngineError>;
    fn list_calls_for_state(&self, state_id: &str) -> Result<Vec<CallRow>, EngineError>;
    fn list_calls_for_run(&self, run_id: &str) -> Result<Vec<CallRow>, EngineError>;
    /// Asigna el próximo call_index del padre de forma atómica.
    fn next_call_index(&self, state_id: &str) -> Result<i64, EngineError>;

    fn insert_batch(&self, row: BatchRow) -> Result<(), EngineError>;
    fn update_batch(&self, row: BatchRow) -> Result<(), EngineError>;
    fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRow>, EngineError>;
    fn list_batches(&self, run_id: &str) -> Result<Vec<BatchRow>, EngineError>;

    fn insert_batch_member(&self, row: BatchMemberRow) -> Result<(), EngineError>;
    fn list_batch_members(&self, batch_id: &str) -> Result<Vec<BatchMemberRow>, EngineError>;

    fn insert_token_outcome(&self, row: TokenOutcomeRow) -> Result<(), EngineError>;
    fn list_outcomes_for_token(&self, token_id: &str) -> Result<Vec<TokenOutcomeRow>, EngineError>;
    fn list_outcomes_for_run(&self, run_id: &str) -> Result<Vec<TokenOutcomeRow>, EngineError>;

    fn insert_artifact(&self, row: ArtifactRow) -> Result<(), EngineError>;
    fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRow>, EngineError>;

    fn insert_checkpoint(&self, row: CheckpointRow) -> Result<(), EngineError>;
    fn latest_checkpoint(&self, run_id: &str) -> Result<Option<CheckpointRow>, EngineError>;
}

// ===== Implementación en memoria =====

/// Backend en memoria del `AuditStore`.
///
/// - Volátil: para tests y corridas efímeras.
/// - Thread-safe: DashMap por tabla + Mutex por vector de apéndice.
#[derive(Default)]
pub struct InMemoryAuditStore {
    runs: DashMap<String, RunRow>,
    nodes: DashMap<String, NodeRow>, // key: run_id|node_id
    edges: Mutex<Vec<EdgeRow>>,
    rows: DashMap<String, RowRow>,
    tokens: DashMap<String, TokenRow>,
    token_parents: Mutex<Vec<TokenParentRow>>,
    states: DashMap<String, NodeStateRow>,
    routing_events: Mutex<Vec<RoutingEventRow>>,
    calls: Mutex<Vec<CallRow>>,
    call_indices: DashMap<String, AtomicU32>,
    batches: DashMap<String, BatchRow>,
    batch_members: Mutex<Vec<BatchMemberRow>>,
    outcomes: Mutex<Vec<TokenOutcomeRow>>,
    artifacts: Mutex<Vec<ArtifactRow>>,
    checkpoints: Mutex<Vec<CheckpointRow>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn node_key(run_id: &str, node_id: &str) -> String {
        format!("{run_id}|{node_id}")
    }

    fn locked<'a, T>(m: &'a Mutex<Vec<T>>) -> Result<std::sync::MutexGuard<'a, Vec<T>>, EngineError> {
        m.lock().map_err(|_| EngineError::Internal("audit store lock poisoned".to_string()))
    }
}

impl AuditStore for InMemoryAuditStore {
    fn insert_run(&self, row: RunRow) -> Result<(), EngineError> {
        if self.runs.contains_key(&row.run_id) {
            return Err(EngineError::AuditIntegrity(format!("duplicate run_id: {}", row.run_id)));
        }
        self.runs.insert(row.run_id.clone(), row);
        Ok(())
    }

    fn update_run(&self, row: RunRow) -> Result<(), EngineError> {
        match self.runs.get_mut(&row.run_id) {
            Some(mut entry) => {
                *entry = row;
                Ok(())
            }
            None => Err(EngineError::AuditIntegrity(format!("update of unknown run: {}", row.run_id))),
        }
    }

    fn get_run(&self, run_id: &str) -> Result<Option<RunRow>, EngineError> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    fn insert_node(&self, row: NodeRow) -> Result<(), EngineError> {
        let key = Self::node_key(&row.run_id, &row.node_id);
        if self.nodes.contains_key(&key) {
            return Err(EngineError::AuditIntegrity(format!("duplicate node_id in run: {}", row.node_id)));
        }
        self.nodes.insert(key, row);
        Ok(())
    }

    fn update_node_output_schema(&self, node_id: &str, run_id: &str, output_schema: Value) -> Result<(), EngineError> {
        let key = Self::node_key(run_id, node_id);
        match self.nodes.get_mut(&key) {
            Some(mut entry) => {
                entry.output_schema = Some(output_schema);
                Ok(())
            }
            None => Err(EngineError::AuditIntegrity(format!("update of unknown node: {node_id}"))),
        }
    }

    fn get_node(&self, run_id: &str, node_id: &str) -> Result<Option<NodeRow>, EngineError> {
        Ok(self.nodes.get(&Self::node_key(run_id, node_id)).map(|n| n.value().clone()))
    }

    fn list_nodes(&self, run_id: &str) -> Result<Vec<NodeRow>, EngineError> {
        Ok(self.nodes.iter().filter(|n| n.run_id == run_id).map(|n| n.value().clone()).collect())
    }

    fn insert_edge(&self, row: EdgeRow) -> Result<(), EngineError> {
        let mut edges = Self::locked(&self.edges)?;
        if edges.iter().any(|e| e.edge_id == row.edge_id && e.run_id == row.run_id) {
            return Err(EngineError::AuditIntegrity(format!("duplicate edge_id in run: {}", row.edge_id)));
        }
        edges.push(row);
        Ok(())
    }

    fn list_edges(&self, run_id: &str) -> Result<Vec<EdgeRow>, EngineError> {
        Ok(Self::locked(&self.edges)?.iter().filter(|e| e.run_id == run_id).cloned().collect())
    }

    fn insert_row(&self, row: RowRow) -> Result<(), EngineError> {
        if self.rows.contains_key(&row.row_id) {
            return Err(EngineError::AuditIntegrity(format!("duplicate row_id: {}", row.row_id)));
        }
        self.rows.insert(row.row_id.clone(), row);
        Ok(())
    }

    fn get_row(&self, row_id: &str) -> Result<Option<RowRow>, EngineError> {
        Ok(self.rows.get(row_id).map(|r| r.value().clone()))
    }

    fn list_rows(&self, run_id: &str) -> Result<Vec<RowRow>, EngineError> {
        Ok(self.rows.iter().filter(|r| r.run_id == run_id).map(|r| r.value().clone()).collect())
    }

    fn insert_token(&self, row: TokenRow) -> Result<(), EngineError> {
        if self.tokens.contains_key(&row.token_id) {
            return Err(EngineError::AuditIntegrity(format!("duplicate token_id: {}", row.token_id)));
        }
        self.tokens.insert(row.token_id.clone(), row);
        Ok(())
    }

    fn get_token(&self, token_id: &str) -> Result<Option<TokenRow>, EngineError> {
        Ok(self.tokens.get(token_id).map(|t| t.value().clone()))
    }

    fn list_tokens_for_row(&self, row_id: &str) -> Result<Vec<TokenRow>, EngineError> {
        Ok(self.tokens.iter().filter(|t| t.row_id == row_id).map(|t| t.value().clone()).collect())
    }

    fn list_tokens_for_run(&self, run_id: &str) -> Result<Vec<TokenRow>, EngineError> {
        let row_ids: std::collections::HashSet<String> =
            self.rows.iter().filter(|r| r.run_id == run_id).map(|r| r.row_id.clone()).collect();
        Ok(self.tokens.iter().filter(|t| row_ids.contains(&t.row_id)).map(|t| t.value().clone()).collect())
    }

    fn insert_token_parent(&self, row: TokenParentRow) -> Result<(), EngineError> {
        Self::locked(&self.token_parents)?.push(row);
        Ok(())
    }

    fn list_token_parents(&self, child_token_id: &str) -> Result<Vec<TokenParentRow>, EngineError> {
        let mut parents: Vec<TokenParentRow> = Self::locked(&self.token_parents)?.iter()
                                                                                 .filter(|p| p.child_token_id == child_token_id)
                                                                                 .cloned()
                                                                                 .collect();
        parents.sort_by_key(|p| p.ordinal);
        Ok(parents)
    }

    fn list_token_parents_for_run(&self, run_id: &str) -> Result<Vec<TokenParentRow>, EngineError> {
        let token_ids: std::collections::HashSet<String> =
            self.list_tokens_for_run(run_id)?.into_iter().map(|t| t.token_id).collect();
        Ok(Self::locked(&self.token_parents)?.iter()
                                             .filter(|p| token_ids.contains(&p.child_token_id))
                                             .cloned()
                                             .collect())
    }

    fn insert_node_state(&self, row: NodeStateRow) -> Result<(), EngineError> {
        if self.states.contains_key(&row.state_id) {
            return Err(EngineError::AuditIntegrity(format!("duplicate state_id: {}", row.state_id)));
        }
        self.states.insert(row.state_id.clone(), row);
        Ok(())
    }

    fn update_node_state(&self, row: NodeStateRow) -> Result<(), EngineError> {
        match self.states.get_mut(&row.state_id) {
            Some(mut entry) => {
                *entry = row;
                Ok(())
            }
            None => Err(EngineError::AuditIntegrity(format!("update of unknown state: {}", row.state_id))),
        }
    }

    fn get_node_state(&self, state_id: &str) -> Result<Option<NodeStateRow>, EngineError> {
        Ok(self.states.get(state_id).map(|s| s.value().clone()))
    }

    fn list_states_for_token(&self, token_id: &str) -> Result<Vec<NodeStateRow>, EngineError> {
        Ok(self.states.iter().filter(|s| s.token_id == token_id).map(|s| s.value().clone()).collect())
    }

    fn list_states_for_run(&self, run_id: &str) -> Result<Vec<NodeStateRow>, EngineError> {
        let token_ids: std::collections::HashSet<String> =
            self.list_tokens_for_run(run_id)?.into_iter().map(|t| t.token_id).collect();
        Ok(self.states.iter().filter(|s| token_ids.contains(&s.token_id)).map(|s| s.value().clone()).collect())
    }

    fn insert_routing_event(&self, row: RoutingEventRow) -> Result<(), EngineError> {
        Self::locked(&self.routing_events)?.push(row);
        Ok(())
    }

    fn list_routing_events_for_state(&self, state_id: &str) -> Result<Vec<RoutingEventRow>, EngineError> {
        let mut events: Vec<RoutingEventRow> = Self::locked(&self.routing_events)?.iter()
                                                                                  .filter(|e| e.state_id == state_id)
                                                                                  .cloned()
                                                                                  .collect();
        events.sort_by_key(|e| e.ordinal);
        Ok(events)
    }

    fn list_routing_events_for_run(&self, run_id: &str) -> Result<Vec<RoutingEventRow>, EngineError> {
        let state_ids: std::collections::HashSet<String> =
            self.list_states_for_run(run_id)?.into_iter().map(|s| s.state_id).collect();
        Ok(Self::locked(&self.routing_events)?.iter()
                                              .filter(|e| state_ids.contains(&e.state_id))
                                              .cloned()
                                              .collect())
    }

    fn insert_call(&self, row: CallRow) -> Result<(), EngineError> {
        Self::locked(&self.calls)?.push(row);
        Ok(())
    }

    fn list_calls_for_state(&self, state_id: &str) -> Result<Vec<CallRow>, EngineError> {
        let mut calls: Vec<CallRow> = Self::locked(&self.calls)?.iter()
                                                                .filter(|c| c.state_id == state_id)
                                                                .cloned()
                                                                .collect();
        calls.sort_by_key(|c| c.call_index);
        Ok(calls)
    }

    fn list_calls_for_run(&self, run_id: &str) -> Result<Vec<CallRow>, EngineError> {
        let state_ids: std::collections::HashSet<String> =
            self.list_states_for_run(run_id)?.into_iter().map(|s| s.state_id).collect();
        Ok(Self::locked(&self.calls)?.iter().filter(|c| state_ids.contains(&c.state_id)).cloned().collect())
    }

    fn next_call_index(&self, state_id: &str) -> Result<i64, EngineError> {
        let counter = self.call_indices.entry(state_id.to_string()).or_insert_with(|| AtomicU32::new(0));
        Ok(counter.fetch_add(1, Ordering::SeqCst) as i64)
    }

    fn insert_batch(&self, row: BatchRow) -> Result<(), EngineError> {
        if self.batches.contains_key(&row.batch_id) {
            return Err(EngineError::AuditIntegrity(format!("duplicate batch_id: {}", row.batch_id)));
        }
        self.batches.insert(row.batch_id.clone(), row);
        Ok(())
    }

    fn update_batch(&self, row: BatchRow) -> Result<(), EngineError> {
        match self.batches.get_mut(&row.batch_id) {
            Some(mut entry) => {
                *entry = row;
                Ok(())
            }
            None => Err(EngineError::AuditIntegrity(format!("update of unknown batch: {}", row.batch_id))),
        }
    }

    fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRow>, EngineError> {
        Ok(self.batches.get(batch_id).map(|b| b.value().clone()))
    }

    fn list_batches(&self, run_id: &str) -> Result<Vec<BatchRow>, EngineError> {
        Ok(self.batches.iter().filter(|b| b.run_id == run_id).map(|b| b.value().clone()).collect())
    }

    fn insert_batch_member(&self, row: BatchMemberRow) -> Result<(), EngineError> {
        Self::locked(&self.batch_members)?.push(row);
        Ok(())
    }

    fn list_batch_members(&self, batch_id: &str) -> Result<Vec<BatchMemberRow>, EngineError> {
        let mut members: Vec<BatchMemberRow> = Self::locked(&self.batch_members)?.iter()
                                                                                 .filter(|m| m.batch_id == batch_id)
                                                                                 .cloned()
                                                                                 .collect();
        members.sort_by_key(|m| m.ordinal);
        Ok(members)
    }

    fn insert_token_outcome(&self, row: TokenOutcomeRow) -> Result<(), EngineError> {
        Self::locked(&self.outcomes)?.push(row);
        Ok(())
    }

    fn list_outcomes_for_token(&self, token_id: &str) -> Result<Vec<TokenOutcomeRow>, EngineError> {
        Ok(Self::locked(&self.outcomes)?.iter().filter(|o| o.token_id == token_id).cloned().collect())
    }

    fn list_outcomes_for_run(&self, run_id: &str) -> Result<Vec<TokenOutcomeRow>, EngineError> {
        Ok(Self::locked(&self.outcomes)?.iter().filter(|o| o.run_id == run_id).cloned().collect())
    }

    fn insert_artifact(&self, row: ArtifactRow) -> Result<(), EngineError> {
        Self::locked(&self.artifacts)?.push(row);
        Ok(())
    }

    fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRow>, EngineError> {
        Ok(Self::locked(&self.artifacts)?.iter().filter(|a| a.run_id == run_id).cloned().collect())
    }

    fn insert_checkpoint(&self, row: CheckpointRow) -> Result<(), EngineError> {
        Self::locked(&self.checkpoints)?.push(row);
        Ok(())
    }

    fn latest_checkpoint(&self, run_id: &str) -> Result<Option<CheckpointRow>, EngineError> {
        Ok(Self::locked(&self.checkpoints)?.iter()
                                           .filter(|c| c.run_id == run_id)
                                           .max_by_key(|c| c.sequence_number)
                                           .cloned())
    }
}
