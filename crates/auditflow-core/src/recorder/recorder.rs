//! LandscapeRecorder: creadores tipados sobre el `AuditStore`.
//!
//! El recorder es dato confiable Tier-1: valida en la frontera de escritura
//! (edges citados existen, terminalidad consistente, ids dentro de límites) y
//! re-parsea estricto en la frontera de lectura (vía `repos`). Un lookup que
//! no resuelve no degrada: corta la corrida, porque el landscape quedaría
//! incompleto.
//!
//! Orden garantizado en lecturas:
//! - estados por token: (step_index, attempt) ascendente.
//! - eventos de ruteo por run: (step_index, attempt, ordinal) ascendente,
//!   NUNCA orden lexicográfico de state_id.
//! - nodos: sequence asc con nulls al final; desempate (registered_at,
//!   node_id).

use chrono::Utc;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::constants::{CANONICAL_VERSION, NODE_ID_MAX_LENGTH};
use crate::errors::EngineError;
use crate::hashing::{hash_str, hash_value, to_canonical_json};
use crate::model::{
    ArtifactRecord, Batch, BatchMember, BatchStatus, CallRecord, CallStatus, CallType, Determinism, Edge, NodeKind,
    NodeRecord, NodeState, NodeStateCommon, ReproducibilityGrade, RoutingEvent, RoutingMode, RowOutcome, RowRecord,
    RunRecord, RunStatus, Token, TokenOutcome, TokenParent,
};
use crate::plugin::ArtifactDescriptor;

use super::payload::PayloadStore;
use super::repos;
use super::store::{
    ArtifactRow, AuditStore, BatchMemberRow, BatchRow, CallRow, EdgeRow, NodeRow, NodeStateRow, RoutingEventRow, RowRow,
    RunRow, TokenOutcomeRow, TokenParentRow, TokenRow,
};

/// Cierre de un estado de nodo. La variante fija qué columnas se escriben.
#[derive(Debug, Clone)]
pub enum StateCompletion {
    Completed { output_data: Value, duration_ms: f64 },
    Pending { duration_ms: f64 },
    Failed {
        error: Option<Value>,
        duration_ms: f64,
        output_hash: Option<String>,
    },
}

/// Especificación de ruta para eventos multi-destino.
#[derive(Debug, Clone)]
pub struct RoutingSpec {
    pub edge_id: String,
    pub mode: RoutingMode,
}

pub struct LandscapeRecorder {
    store: Arc<dyn AuditStore>,
    payloads: Option<Arc<dyn PayloadStore>>,
}

impl LandscapeRecorder {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store, payloads: None }
    }

    pub fn with_payload_store(store: Arc<dyn AuditStore>, payloads: Arc<dyn PayloadStore>) -> Self {
        Self { store,
               payloads: Some(payloads) }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    fn stash_payload(&self, payload: &Value) -> Option<String> {
        self.payloads.as_ref().and_then(|p| p.put(payload).ok())
    }

    // ===== Run =====

    pub fn begin_run(&self, config_hash: &str, settings_json: Value) -> Result<RunRecord, EngineError> {
        let run = RunRecord { run_id: Uuid::new_v4(),
                              started_at: Utc::now(),
                              config_hash: config_hash.to_string(),
                              settings_json,
                              canonical_version: CANONICAL_VERSION.to_string(),
                              status: RunStatus::Running,
                              completed_at: None,
                              reproducibility: ReproducibilityGrade::Full,
                              export_status: None,
                              export_metadata: None };
        self.store.insert_run(run_to_row(&run))?;
        debug!("begin_run run_id={}", run.run_id);
        Ok(run)
    }

    /// Cierra el run recalculando el grado de reproducibilidad desde las
    /// clases de determinismo registradas.
    pub fn complete_run(&self, run_id: Uuid, status: RunStatus) -> Result<RunRecord, EngineError> {
        let row = self.store
                      .get_run(&run_id.to_string())?
                      .ok_or_else(|| EngineError::AuditIntegrity(format!("complete_run: unknown run {run_id}")))?;
        let mut run = repos::parse_run(&row)?;
        run.status = status;
        run.completed_at = Some(Utc::now());
        run.reproducibility = self.compute_reproducibility(run_id)?;
        self.store.update_run(run_to_row(&run))?;
        debug!("complete_run run_id={run_id} status={}", status.as_str());
        Ok(run)
    }

    fn compute_reproducibility(&self, run_id: Uuid) -> Result<ReproducibilityGrade, EngineError> {
        let nodes = self.get_nodes(run_id)?;
        let mut grade = ReproducibilityGrade::Full;
        for node in &nodes {
            match node.determinism {
                Determinism::NonDeterministic => return Ok(ReproducibilityGrade::NonReproducible),
                Determinism::ExternalCall => grade = ReproducibilityGrade::Partial,
                _ => {}
            }
        }
        Ok(grade)
    }

    pub fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, EngineError> {
        match self.store.get_run(&run_id.to_string())? {
            Some(row) => Ok(Some(repos::parse_run(&row)?)),
            None => Ok(None),
        }
    }

    // ===== Grafo =====

    #[allow(clippy::too_many_arguments)]
    pub fn register_node(&self,
                         run_id: Uuid,
                         node_id: &str,
                         kind: NodeKind,
                         plugin_name: &str,
                         plugin_version: &str,
                         config_json: Value,
                         determinism: Determinism,
                         input_schema: Option<Value>,
                         output_schema: Option<Value>,
                         sequence: Option<u32>)
                         -> Result<NodeRecord, EngineError> {
        if node_id.len() > NODE_ID_MAX_LENGTH {
            return Err(EngineError::AuditIntegrity(format!("node_id exceeds {NODE_ID_MAX_LENGTH} chars: '{node_id}'")));
        }
        let config_hash = hash_value(&config_json);
        let node = NodeRecord { node_id: node_id.to_string(),
                                run_id,
                                kind,
                                plugin_name: plugin_name.to_string(),
                                plugin_version: plugin_version.to_string(),
                                config_json,
                                config_hash,
                                determinism,
                                input_schema,
                                output_schema,
                                sequence,
                                registered_at: Utc::now() };
        self.store.insert_node(node_to_row(&node))?;
        Ok(node)
    }

    /// Actualiza el esquema de salida de un nodo ya registrado (contratos
    /// observados que se fijan después de ver datos).
    pub fn update_node_output_contract(&self, run_id: Uuid, node_id: &str, output_schema: Value) -> Result<(), EngineError> {
        self.store.update_node_output_schema(node_id, &run_id.to_string(), output_schema)
    }

    pub fn register_edge(&self,
                         run_id: Uuid,
                         from_node: &str,
                         to_node: &str,
                         label: &str,
                         mode: RoutingMode)
                         -> Result<Edge, EngineError> {
        // edge_id determinista: estable entre corridas para el mismo grafo.
        let identity = serde_json::json!({
            "from": from_node, "to": to_node, "label": label, "mode": mode.as_str(),
        });
        let edge_id = format!("edge_{}", &hash_str(&to_canonical_json(&identity))[..12]);
        let edge = Edge { edge_id,
                          run_id,
                          from_node: from_node.to_string(),
                          to_node: to_node.to_string(),
                          label: label.to_string(),
                          mode,
                          created_at: Utc::now() };
        self.store.insert_edge(edge_to_row(&edge))?;
        Ok(edge)
    }

    pub fn get_node(&self, run_id: Uuid, node_id: &str) -> Result<NodeRecord, EngineError> {
        let row = self.store
                      .get_node(&run_id.to_string(), node_id)?
                      .ok_or_else(|| EngineError::AuditIntegrity(format!("unknown node: {node_id}")))?;
        repos::parse_node(&row)
    }

    /// Nodos del run en orden de pipeline: sequence asc (nulls al final),
    /// desempate por (registered_at, node_id).
    pub fn get_nodes(&self, run_id: Uuid) -> Result<Vec<NodeRecord>, EngineError> {
        let mut nodes = self.store
                            .list_nodes(&run_id.to_string())?
                            .iter()
                            .map(repos::parse_node)
                            .collect::<Result<Vec<_>, _>>()?;
        nodes.sort_by(|a, b| {
                 match (a.sequence, b.sequence) {
                     (Some(x), Some(y)) => x.cmp(&y),
                     (Some(_), None) => std::cmp::Ordering::Less,
                     (None, Some(_)) => std::cmp::Ordering::Greater,
                     (None, None) => (a.registered_at, &a.node_id).cmp(&(b.registered_at, &b.node_id)),
                 }
             });
        Ok(nodes)
    }

    pub fn get_edges(&self, run_id: Uuid) -> Result<Vec<Edge>, EngineError> {
        self.store.list_edges(&run_id.to_string())?.iter().map(repos::parse_edge).collect()
    }

    pub fn get_edge(&self, run_id: Uuid, edge_id: &str) -> Result<Edge, EngineError> {
        self.get_edges(run_id)?
            .into_iter()
            .find(|e| e.edge_id == edge_id)
            .ok_or_else(|| EngineError::AuditIntegrity(format!("unknown edge: {edge_id}")))
    }

    /// Mapa (from_node, label) → edge_id del run.
    pub fn get_edge_map(&self, run_id: Uuid) -> Result<HashMap<(String, String), String>, EngineError> {
        let mut map = HashMap::new();
        for edge in self.get_edges(run_id)? {
            map.insert((edge.from_node.clone(), edge.label.clone()), edge.edge_id.clone());
        }
        Ok(map)
    }

    // ===== Filas y tokens =====

    pub fn create_row(&self,
                      run_id: Uuid,
                      source_node_id: &str,
                      row_index: u64,
                      data: &Value)
                      -> Result<RowRecord, EngineError> {
        let row = RowRecord { row_id: Uuid::new_v4(),
                              run_id,
                              source_node_id: source_node_id.to_string(),
                              row_index,
                              source_data_hash: hash_value(data),
                              source_data_ref: self.stash_payload(data),
                              created_at: Utc::now() };
        self.store.insert_row(row_record_to_row(&row))?;
        Ok(row)
    }

    pub fn get_row(&self, row_id: Uuid) -> Result<Option<RowRecord>, EngineError> {
        match self.store.get_row(&row_id.to_string())? {
            Some(row) => Ok(Some(repos::parse_row_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Payload fuente completo si el run corre con payload store.
    pub fn get_row_data(&self, row_id: Uuid) -> Result<Option<Value>, EngineError> {
        let record = match self.get_row(row_id)? {
            Some(r) => r,
            None => return Ok(None),
        };
        match (record.source_data_ref, &self.payloads) {
            (Some(reference), Some(payloads)) => payloads.get(&reference),
            _ => Ok(None),
        }
    }

    pub fn get_rows(&self, run_id: Uuid) -> Result<Vec<RowRecord>, EngineError> {
        let mut rows = self.store
                           .list_rows(&run_id.to_string())?
                           .iter()
                           .map(repos::parse_row_record)
                           .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by_key(|r| r.row_index);
        Ok(rows)
    }

    pub fn insert_token(&self, token: &Token) -> Result<(), EngineError> {
        self.store.insert_token(token_to_row(token))
    }

    pub fn insert_token_parent(&self, parent: &TokenParent) -> Result<(), EngineError> {
        self.store.insert_token_parent(TokenParentRow { child_token_id: parent.child_token_id.to_string(),
                                                        parent_token_id: parent.parent_token_id.to_string(),
                                                        ordinal: parent.ordinal as i64 })
    }

    pub fn get_token(&self, token_id: Uuid) -> Result<Option<Token>, EngineError> {
        match self.store.get_token(&token_id.to_string())? {
            Some(row) => Ok(Some(repos::parse_token(&row)?)),
            None => Ok(None),
        }
    }

    pub fn get_tokens(&self, row_id: Uuid) -> Result<Vec<Token>, EngineError> {
        let mut tokens = self.store
                             .list_tokens_for_row(&row_id.to_string())?
                             .iter()
                             .map(repos::parse_token)
                             .collect::<Result<Vec<_>, _>>()?;
        tokens.sort_by_key(|t| t.created_at);
        Ok(tokens)
    }

    pub fn get_all_tokens_for_run(&self, run_id: Uuid) -> Result<Vec<Token>, EngineError> {
        self.store.list_tokens_for_run(&run_id.to_string())?.iter().map(repos::parse_token).collect()
    }

    pub fn get_token_parents(&self, child_token_id: Uuid) -> Result<Vec<TokenParent>, EngineError> {
        self.store
            .list_token_parents(&child_token_id.to_string())?
            .iter()
            .map(repos::parse_token_parent)
            .collect()
    }

    pub fn get_all_token_parents_for_run(&self, run_id: Uuid) -> Result<Vec<TokenParent>, EngineError> {
        self.store
            .list_token_parents_for_run(&run_id.to_string())?
            .iter()
            .map(repos::parse_token_parent)
            .collect()
    }

    // ===== Estados de nodo =====

    pub fn begin_node_state(&self,
                            token_id: Uuid,
                            node_id: &str,
                            step_index: u32,
                            attempt: u32,
                            input_data: &Value)
                            -> Result<NodeState, EngineError> {
        let common = NodeStateCommon { state_id: Uuid::new_v4(),
                                       token_id,
                                       node_id: node_id.to_string(),
                                       step_index,
                                       attempt,
                                       input_hash: hash_value(input_data),
                                       started_at: Utc::now(),
                                       context_before: None,
                                       context_after: None };
        let state = NodeState::Open { common };
        self.store.insert_node_state(state_to_row(&state))?;
        Ok(state)
    }

    /// Transición de cierre. Sólo open→{pending,completed,failed} y
    /// pending→{completed,failed} (reanudación de lotes remotos) son
    /// válidas; el resto es violación de integridad.
    pub fn complete_node_state(&self, state_id: Uuid, completion: StateCompletion) -> Result<NodeState, EngineError> {
        let row = self.store
                      .get_node_state(&state_id.to_string())?
                      .ok_or_else(|| EngineError::AuditIntegrity(format!("complete of unknown state: {state_id}")))?;
        let current = repos::parse_node_state(&row)?;
        let resumable = matches!(current, NodeState::Open { .. } | NodeState::Pending { .. });
        if !resumable {
            return Err(EngineError::AuditIntegrity(format!("state {state_id} is already terminal ({})",
                                                           current.status_str())));
        }
        let common = current.common().clone();
        let now = Utc::now();
        let next = match completion {
            StateCompletion::Completed { output_data, duration_ms } => NodeState::Completed { common,
                                                                                             completed_at: now,
                                                                                             duration_ms,
                                                                                             output_hash:
                                                                                                 hash_value(&output_data) },
            StateCompletion::Pending { duration_ms } => {
                if matches!(current, NodeState::Pending { .. }) {
                    return Err(EngineError::AuditIntegrity(format!("state {state_id} is already pending")));
                }
                NodeState::Pending { common,
                                     completed_at: now,
                                     duration_ms }
            }
            StateCompletion::Failed { error, duration_ms, output_hash } => NodeState::Failed { common,
                                                                                               completed_at: now,
                                                                                               duration_ms,
                                                                                               output_hash,
                                                                                               error },
        };
        self.store.update_node_state(state_to_row(&next))?;
        Ok(next)
    }

    pub fn get_node_state(&self, state_id: Uuid) -> Result<NodeState, EngineError> {
        let row = self.store
                      .get_node_state(&state_id.to_string())?
                      .ok_or_else(|| EngineError::AuditIntegrity(format!("unknown state: {state_id}")))?;
        repos::parse_node_state(&row)
    }

    /// Estados de un token ordenados por (step_index, attempt).
    pub fn get_node_states_for_token(&self, token_id: Uuid) -> Result<Vec<NodeState>, EngineError> {
        let mut states = self.store
                             .list_states_for_token(&token_id.to_string())?
                             .iter()
                             .map(repos::parse_node_state)
                             .collect::<Result<Vec<_>, _>>()?;
        states.sort_by_key(|s| (s.common().step_index, s.common().attempt));
        Ok(states)
    }

    pub fn get_all_node_states_for_run(&self, run_id: Uuid) -> Result<Vec<NodeState>, EngineError> {
        let mut states = self.store
                             .list_states_for_run(&run_id.to_string())?
                             .iter()
                             .map(repos::parse_node_state)
                             .collect::<Result<Vec<_>, _>>()?;
        states.sort_by_key(|s| (s.common().step_index, s.common().attempt));
        Ok(states)
    }

    // ===== Eventos de ruteo =====

    pub fn record_routing_event(&self,
                                state_id: Uuid,
                                edge_id: &str,
                                mode: RoutingMode,
                                reason: Option<&Value>)
                                -> Result<RoutingEvent, EngineError> {
        let events = self.record_routing_events(state_id,
                                                &[RoutingSpec { edge_id: edge_id.to_string(), mode }],
                                                reason)?;
        Ok(events.into_iter().next().expect("single routing event"))
    }

    /// Eventos multi-destino bajo un routing_group_id compartido, ordinales
    /// en el orden de grabación. Cada edge citado debe estar registrado en
    /// el run del estado: un edge desconocido corta la corrida.
    pub fn record_routing_events(&self,
                                 state_id: Uuid,
                                 routes: &[RoutingSpec],
                                 reason: Option<&Value>)
                                 -> Result<Vec<RoutingEvent>, EngineError> {
        let run_id = self.run_id_for_state(state_id)?;
        let known: std::collections::HashSet<String> =
            self.get_edges(run_id)?.into_iter().map(|e| e.edge_id).collect();
        for route in routes {
            if !known.contains(&route.edge_id) {
                return Err(EngineError::AuditIntegrity(format!("routing event cites unregistered edge '{}' in run {run_id}",
                                                               route.edge_id)));
            }
        }
        let reason_hash = reason.map(hash_value);
        let reason_ref = reason.and_then(|r| self.stash_payload(r));
        let group_id = Uuid::new_v4();
        let mut events = Vec::with_capacity(routes.len());
        for (ordinal, route) in routes.iter().enumerate() {
            let event = RoutingEvent { event_id: Uuid::new_v4(),
                                       state_id,
                                       edge_id: route.edge_id.clone(),
                                       routing_group_id: group_id,
                                       ordinal: ordinal as u32,
                                       mode: route.mode,
                                       reason_hash: reason_hash.clone(),
                                       reason_ref: reason_ref.clone(),
                                       created_at: Utc::now() };
            self.store.insert_routing_event(routing_event_to_row(&event))?;
            events.push(event);
        }
        Ok(events)
    }

    pub fn get_routing_events(&self, state_id: Uuid) -> Result<Vec<RoutingEvent>, EngineError> {
        self.store
            .list_routing_events_for_state(&state_id.to_string())?
            .iter()
            .map(repos::parse_routing_event)
            .collect()
    }

    /// Eventos del run ordenados por (step_index, attempt, ordinal). El
    /// orden lexicográfico de state_id NO participa.
    pub fn get_all_routing_events_for_run(&self, run_id: Uuid) -> Result<Vec<RoutingEvent>, EngineError> {
        let states: HashMap<String, (u32, u32)> =
            self.store
                .list_states_for_run(&run_id.to_string())?
                .iter()
                .map(|s| (s.state_id.clone(), (s.step_index as u32, s.attempt as u32)))
                .collect();
        let mut events = self.store
                             .list_routing_events_for_run(&run_id.to_string())?
                             .iter()
                             .map(repos::parse_routing_event)
                             .collect::<Result<Vec<_>, _>>()?;
        events.sort_by_key(|e| {
                  let (step, attempt) = states.get(&e.state_id.to_string()).copied().unwrap_or((u32::MAX, u32::MAX));
                  (step, attempt, e.ordinal)
              });
        Ok(events)
    }

    /// Variante por lote de estados, mismo orden global.
    pub fn get_routing_events_for_states(&self, run_id: Uuid, state_ids: &[Uuid]) -> Result<Vec<RoutingEvent>, EngineError> {
        let wanted: std::collections::HashSet<Uuid> = state_ids.iter().copied().collect();
        Ok(self.get_all_routing_events_for_run(run_id)?
               .into_iter()
               .filter(|e| wanted.contains(&e.state_id))
               .collect())
    }

    // ===== Llamadas externas =====

    #[allow(clippy::too_many_arguments)]
    pub fn record_call(&self,
                       state_id: Uuid,
                       call_type: CallType,
                       status: CallStatus,
                       request: &Value,
                       response: Option<&Value>,
                       error: Option<Value>,
                       latency_ms: f64)
                       -> Result<CallRecord, EngineError> {
        let call_index = self.store.next_call_index(&state_id.to_string())?;
        let call = CallRecord { call_id: Uuid::new_v4(),
                                state_id,
                                call_index: call_index as u32,
                                call_type,
                                status,
                                request_hash: hash_value(request),
                                request_ref: self.stash_payload(request),
                                response_hash: response.map(hash_value),
                                response_ref: response.and_then(|r| self.stash_payload(r)),
                                error,
                                latency_ms,
                                created_at: Utc::now() };
        self.store.insert_call(call_to_row(&call))?;
        Ok(call)
    }

    pub fn get_calls(&self, state_id: Uuid) -> Result<Vec<CallRecord>, EngineError> {
        self.store.list_calls_for_state(&state_id.to_string())?.iter().map(repos::parse_call).collect()
    }

    /// Llamadas del run ordenadas por (step_index, attempt, call_index).
    pub fn get_all_calls_for_run(&self, run_id: Uuid) -> Result<Vec<CallRecord>, EngineError> {
        let states: HashMap<String, (u32, u32)> =
            self.store
                .list_states_for_run(&run_id.to_string())?
                .iter()
                .map(|s| (s.state_id.clone(), (s.step_index as u32, s.attempt as u32)))
                .collect();
        let mut calls = self.store
                            .list_calls_for_run(&run_id.to_string())?
                            .iter()
                            .map(repos::parse_call)
                            .collect::<Result<Vec<_>, _>>()?;
        calls.sort_by_key(|c| {
                 let (step, attempt) = states.get(&c.state_id.to_string()).copied().unwrap_or((u32::MAX, u32::MAX));
                 (step, attempt, c.call_index)
             });
        Ok(calls)
    }

    pub fn get_calls_for_states(&self, run_id: Uuid, state_ids: &[Uuid]) -> Result<Vec<CallRecord>, EngineError> {
        let wanted: std::collections::HashSet<Uuid> = state_ids.iter().copied().collect();
        Ok(self.get_all_calls_for_run(run_id)?
               .into_iter()
               .filter(|c| wanted.contains(&c.state_id))
               .collect())
    }

    // ===== Lotes =====

    pub fn create_batch(&self, run_id: Uuid, aggregation_node_id: &str, attempt: u32) -> Result<Batch, EngineError> {
        let batch = Batch { batch_id: Uuid::new_v4(),
                            run_id,
                            aggregation_node_id: aggregation_node_id.to_string(),
                            attempt,
                            status: BatchStatus::Draft,
                            created_at: Utc::now(),
                            state_id: None,
                            trigger_type: None,
                            trigger_reason: None,
                            completed_at: None };
        self.store.insert_batch(batch_to_row(&batch))?;
        Ok(batch)
    }

    pub fn add_batch_member(&self, batch_id: Uuid, token_id: Uuid, ordinal: u32) -> Result<BatchMember, EngineError> {
        let member = BatchMember { batch_id, token_id, ordinal };
        self.store.insert_batch_member(BatchMemberRow { batch_id: batch_id.to_string(),
                                                        token_id: token_id.to_string(),
                                                        ordinal: ordinal as i64 })?;
        Ok(member)
    }

    pub fn update_batch_status(&self,
                               batch_id: Uuid,
                               status: BatchStatus,
                               trigger_type: Option<crate::model::TriggerType>)
                               -> Result<Batch, EngineError> {
        let mut batch = self.require_batch(batch_id)?;
        batch.status = status;
        if trigger_type.is_some() {
            batch.trigger_type = trigger_type;
        }
        self.store.update_batch(batch_to_row(&batch))?;
        Ok(batch)
    }

    pub fn complete_batch(&self,
                          batch_id: Uuid,
                          status: BatchStatus,
                          trigger_type: Option<crate::model::TriggerType>,
                          state_id: Option<Uuid>)
                          -> Result<Batch, EngineError> {
        if !matches!(status, BatchStatus::Completed | BatchStatus::Failed) {
            return Err(EngineError::AuditIntegrity(format!("complete_batch with non-terminal status {}",
                                                           status.as_str())));
        }
        let mut batch = self.require_batch(batch_id)?;
        batch.status = status;
        batch.trigger_type = trigger_type.or(batch.trigger_type);
        batch.state_id = state_id.or(batch.state_id);
        batch.completed_at = Some(Utc::now());
        self.store.update_batch(batch_to_row(&batch))?;
        Ok(batch)
    }

    /// Vincula el estado PENDING de un lote remoto sin cerrarlo.
    pub fn link_batch_state(&self, batch_id: Uuid, state_id: Uuid) -> Result<Batch, EngineError> {
        let mut batch = self.require_batch(batch_id)?;
        batch.state_id = Some(state_id);
        self.store.update_batch(batch_to_row(&batch))?;
        Ok(batch)
    }

    fn require_batch(&self, batch_id: Uuid) -> Result<Batch, EngineError> {
        let row = self.store
                      .get_batch(&batch_id.to_string())?
                      .ok_or_else(|| EngineError::AuditIntegrity(format!("unknown batch: {batch_id}")))?;
        repos::parse_batch(&row)
    }

    pub fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>, EngineError> {
        match self.store.get_batch(&batch_id.to_string())? {
            Some(row) => Ok(Some(repos::parse_batch(&row)?)),
            None => Ok(None),
        }
    }

    pub fn get_batches(&self, run_id: Uuid) -> Result<Vec<Batch>, EngineError> {
        let mut batches = self.store
                              .list_batches(&run_id.to_string())?
                              .iter()
                              .map(repos::parse_batch)
                              .collect::<Result<Vec<_>, _>>()?;
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    pub fn get_batch_members(&self, batch_id: Uuid) -> Result<Vec<BatchMember>, EngineError> {
        self.store
            .list_batch_members(&batch_id.to_string())?
            .iter()
            .map(repos::parse_batch_member)
            .collect()
    }

    // ===== Outcomes =====

    /// Graba el outcome de un token. La terminalidad se deriva del outcome:
    /// el llamador no puede fabricar un `is_terminal` inconsistente.
    #[allow(clippy::too_many_arguments)]
    pub fn record_token_outcome(&self,
                                run_id: Uuid,
                                token_id: Uuid,
                                outcome: RowOutcome,
                                sink_name: Option<String>,
                                batch_id: Option<Uuid>,
                                group_id: Option<Uuid>,
                                error_hash: Option<String>,
                                context: Option<Value>)
                                -> Result<TokenOutcome, EngineError> {
        let (fork_group_id, join_group_id, expand_group_id) = match outcome {
            RowOutcome::Forked => (group_id, None, None),
            RowOutcome::Coalesced | RowOutcome::DroppedAtCoalesce => (None, group_id, None),
            RowOutcome::Expanded => (None, None, group_id),
            _ => (None, None, None),
        };
        let record = TokenOutcome { outcome_id: Uuid::new_v4(),
                                    run_id,
                                    token_id,
                                    outcome,
                                    is_terminal: outcome.is_terminal(),
                                    recorded_at: Utc::now(),
                                    sink_name,
                                    batch_id,
                                    fork_group_id,
                                    join_group_id,
                                    expand_group_id,
                                    error_hash,
                                    context,
                                    expected_branches: None };
        self.store.insert_token_outcome(outcome_to_row(&record))?;
        Ok(record)
    }

    pub fn get_outcomes_for_token(&self, token_id: Uuid) -> Result<Vec<TokenOutcome>, EngineError> {
        self.store
            .list_outcomes_for_token(&token_id.to_string())?
            .iter()
            .map(repos::parse_token_outcome)
            .collect()
    }

    pub fn get_outcomes_for_run(&self, run_id: Uuid) -> Result<Vec<TokenOutcome>, EngineError> {
        self.store
            .list_outcomes_for_run(&run_id.to_string())?
            .iter()
            .map(repos::parse_token_outcome)
            .collect()
    }

    /// Completitud de fila: TODOS los tokens con outcome terminal, y al
    /// menos uno de esos outcomes completa fila. Los marcadores de
    /// delegación (FORKED/EXPANDED) son terminales para su token pero no
    /// alcanzan por sí solos: los hijos deben terminar, y una fila cuyo
    /// único rastro es la delegación sigue incompleta.
    pub fn row_is_complete(&self, row_id: Uuid) -> Result<bool, EngineError> {
        let tokens = self.get_tokens(row_id)?;
        if tokens.is_empty() {
            return Ok(false);
        }
        let mut any_completing = false;
        for token in &tokens {
            let outcomes = self.get_outcomes_for_token(token.token_id)?;
            if !outcomes.iter().any(|o| o.is_terminal) {
                return Ok(false);
            }
            if outcomes.iter().any(|o| o.outcome.is_row_completing()) {
                any_completing = true;
            }
        }
        Ok(any_completing)
    }

    // ===== Artifacts =====

    pub fn register_artifact(&self,
                             run_id: Uuid,
                             state_id: Uuid,
                             sink_node_id: &str,
                             descriptor: &ArtifactDescriptor)
                             -> Result<ArtifactRecord, EngineError> {
        let artifact = ArtifactRecord { artifact_id: Uuid::new_v4(),
                                        run_id,
                                        produced_by_state_id: state_id,
                                        sink_node_id: sink_node_id.to_string(),
                                        artifact_type: descriptor.artifact_type.clone(),
                                        path_or_uri: descriptor.path_or_uri.clone(),
                                        content_hash: descriptor.content_hash.clone(),
                                        size_bytes: descriptor.size_bytes,
                                        idempotency_key: descriptor.idempotency_key.clone(),
                                        created_at: Utc::now() };
        self.store.insert_artifact(artifact_to_row(&artifact))?;
        Ok(artifact)
    }

    pub fn get_artifacts(&self, run_id: Uuid) -> Result<Vec<ArtifactRecord>, EngineError> {
        let mut artifacts = self.store
                                .list_artifacts(&run_id.to_string())?
                                .iter()
                                .map(repos::parse_artifact)
                                .collect::<Result<Vec<_>, _>>()?;
        artifacts.sort_by_key(|a| a.created_at);
        Ok(artifacts)
    }

    // ===== Linaje =====

    /// Linaje completo de una fila: tokens, estados, outcomes y ruteo.
    pub fn explain_row(&self, row_id: Uuid) -> Result<RowLineage, EngineError> {
        let record = self.get_row(row_id)?
                         .ok_or_else(|| EngineError::AuditIntegrity(format!("unknown row: {row_id}")))?;
        let tokens = self.get_tokens(row_id)?;
        let mut states = Vec::new();
        let mut outcomes = Vec::new();
        let mut routing = Vec::new();
        for token in &tokens {
            states.extend(self.get_node_states_for_token(token.token_id)?);
            outcomes.extend(self.get_outcomes_for_token(token.token_id)?);
        }
        for state in &states {
            routing.extend(self.get_routing_events(state.state_id())?);
        }
        Ok(RowLineage { row: record,
                        tokens,
                        states,
                        outcomes,
                        routing })
    }

    fn run_id_for_state(&self, state_id: Uuid) -> Result<Uuid, EngineError> {
        let state = self.store
                        .get_node_state(&state_id.to_string())?
                        .ok_or_else(|| EngineError::AuditIntegrity(format!("unknown state: {state_id}")))?;
        let token = self.store
                        .get_token(&state.token_id)?
                        .ok_or_else(|| EngineError::AuditIntegrity(format!("state {state_id} cites unknown token")))?;
        let row = self.store
                      .get_row(&token.row_id)?
                      .ok_or_else(|| EngineError::AuditIntegrity(format!("token {} cites unknown row", token.token_id)))?;
        Uuid::parse_str(&row.run_id).map_err(|_| EngineError::Corruption(format!("row {} has invalid run_id", row.row_id)))
    }
}

/// Linaje reconstruido de una fila para reportes.
#[derive(Debug)]
pub struct RowLineage {
    pub row: RowRecord,
    pub tokens: Vec<Token>,
    pub states: Vec<NodeState>,
    pub outcomes: Vec<TokenOutcome>,
    pub routing: Vec<RoutingEvent>,
}

// ===== Conversión dominio → fila cruda =====

fn run_to_row(run: &RunRecord) -> RunRow {
    RunRow { run_id: run.run_id.to_string(),
             started_at: run.started_at,
             config_hash: run.config_hash.clone(),
             settings_json: run.settings_json.clone(),
             canonical_version: run.canonical_version.clone(),
             status: run.status.as_str().to_string(),
             completed_at: run.completed_at,
             reproducibility: run.reproducibility.as_str().to_string(),
             export_status: run.export_status.map(|s| s.as_str().to_string()),
             export_metadata: run.export_metadata.clone() }
}

fn node_to_row(node: &NodeRecord) -> NodeRow {
    NodeRow { node_id: node.node_id.clone(),
              run_id: node.run_id.to_string(),
              kind: node.kind.as_str().to_string(),
              plugin_name: node.plugin_name.clone(),
              plugin_version: node.plugin_version.clone(),
              config_json: node.config_json.clone(),
              config_hash: node.config_hash.clone(),
              determinism: node.determinism.as_str().to_string(),
              input_schema: node.input_schema.clone(),
              output_schema: node.output_schema.clone(),
              sequence: node.sequence.map(|s| s as i64),
              registered_at: node.registered_at }
}

fn edge_to_row(edge: &Edge) -> EdgeRow {
    EdgeRow { edge_id: edge.edge_id.clone(),
              run_id: edge.run_id.to_string(),
              from_node: edge.from_node.clone(),
              to_node: edge.to_node.clone(),
              label: edge.label.clone(),
              mode: edge.mode.as_str().to_string(),
              created_at: edge.created_at }
}

fn row_record_to_row(row: &RowRecord) -> RowRow {
    RowRow { row_id: row.row_id.to_string(),
             run_id: row.run_id.to_string(),
             source_node_id: row.source_node_id.clone(),
             row_index: row.row_index as i64,
             source_data_hash: row.source_data_hash.clone(),
             source_data_ref: row.source_data_ref.clone(),
             created_at: row.created_at }
}

fn token_to_row(token: &Token) -> TokenRow {
    TokenRow { token_id: token.token_id.to_string(),
               row_id: token.row_id.to_string(),
               fork_group_id: token.fork_group_id.map(|g| g.to_string()),
               join_group_id: token.join_group_id.map(|g| g.to_string()),
               expand_group_id: token.expand_group_id.map(|g| g.to_string()),
               branch_name: token.branch_name.clone(),
               step_in_pipeline: token.step_in_pipeline.map(|s| s as i64),
               created_at: token.created_at }
}

fn state_to_row(state: &NodeState) -> NodeStateRow {
    let common = state.common();
    let base = NodeStateRow { state_id: common.state_id.to_string(),
                              token_id: common.token_id.to_string(),
                              node_id: common.node_id.clone(),
                              step_index: common.step_index as i64,
                              attempt: common.attempt as i64,
                              status: state.status_str().to_string(),
                              input_hash: common.input_hash.clone(),
                              started_at: common.started_at,
                              completed_at: None,
                              duration_ms: None,
                              output_hash: None,
                              error_json: None,
                              context_before: common.context_before.clone(),
                              context_after: common.context_after.clone() };
    match state {
        NodeState::Open { .. } => base,
        NodeState::Pending { completed_at, duration_ms, .. } => NodeStateRow { completed_at: Some(*completed_at),
                                                                               duration_ms: Some(*duration_ms),
                                                                               ..base },
        NodeState::Completed { completed_at,
                               duration_ms,
                               output_hash,
                               .. } => NodeStateRow { completed_at: Some(*completed_at),
                                                      duration_ms: Some(*duration_ms),
                                                      output_hash: Some(output_hash.clone()),
                                                      ..base },
        NodeState::Failed { completed_at,
                            duration_ms,
                            output_hash,
                            error,
                            .. } => NodeStateRow { completed_at: Some(*completed_at),
                                                   duration_ms: Some(*duration_ms),
                                                   output_hash: output_hash.clone(),
                                                   error_json: error.clone(),
                                                   ..base },
    }
}

fn routing_event_to_row(event: &RoutingEvent) -> RoutingEventRow {
    RoutingEventRow { event_id: event.event_id.to_string(),
                      state_id: event.state_id.to_string(),
                      edge_id: event.edge_id.clone(),
                      routing_group_id: event.routing_group_id.to_string(),
                      ordinal: event.ordinal as i64,
                      mode: event.mode.as_str().to_string(),
                      reason_hash: event.reason_hash.clone(),
                      reason_ref: event.reason_ref.clone(),
                      created_at: event.created_at }
}

fn call_to_row(call: &CallRecord) -> CallRow {
    CallRow { call_id: call.call_id.to_string(),
              state_id: call.state_id.to_string(),
              call_index: call.call_index as i64,
              call_type: call.call_type.as_str().to_string(),
              status: call.status.as_str().to_string(),
              request_hash: call.request_hash.clone(),
              request_ref: call.request_ref.clone(),
              response_hash: call.response_hash.clone(),
              response_ref: call.response_ref.clone(),
              error_json: call.error.clone(),
              latency_ms: call.latency_ms,
              created_at: call.created_at }
}

fn batch_to_row(batch: &Batch) -> BatchRow {
    BatchRow { batch_id: batch.batch_id.to_string(),
               run_id: batch.run_id.to_string(),
               aggregation_node_id: batch.aggregation_node_id.clone(),
               attempt: batch.attempt as i64,
               status: batch.status.as_str().to_string(),
               created_at: batch.created_at,
               state_id: batch.state_id.map(|s| s.to_string()),
               trigger_type: batch.trigger_type.map(|t| t.as_str().to_string()),
               trigger_reason: batch.trigger_reason.clone(),
               completed_at: batch.completed_at }
}

fn outcome_to_row(outcome: &TokenOutcome) -> TokenOutcomeRow {
    TokenOutcomeRow { outcome_id: outcome.outcome_id.to_string(),
                      run_id: outcome.run_id.to_string(),
                      token_id: outcome.token_id.to_string(),
                      outcome: outcome.outcome.as_str().to_string(),
                      is_terminal: i32::from(outcome.is_terminal),
                      recorded_at: outcome.recorded_at,
                      sink_name: outcome.sink_name.clone(),
                      batch_id: outcome.batch_id.map(|b| b.to_string()),
                      fork_group_id: outcome.fork_group_id.map(|g| g.to_string()),
                      join_group_id: outcome.join_group_id.map(|g| g.to_string()),
                      expand_group_id: outcome.expand_group_id.map(|g| g.to_string()),
                      error_hash: outcome.error_hash.clone(),
                      context_json: outcome.context.clone(),
                      expected_branches_json: outcome.expected_branches.clone() }
}

fn artifact_to_row(artifact: &ArtifactRecord) -> ArtifactRow {
    ArtifactRow { artifact_id: artifact.artifact_id.to_string(),
                  run_id: artifact.run_id.to_string(),
                  produced_by_state_id: artifact.produced_by_state_id.to_string(),
                  sink_node_id: artifact.sink_node_id.clone(),
                  artifact_type: artifact.artifact_type.clone(),
                  path_or_uri: artifact.path_or_uri.clone(),
                  content_hash: artifact.content_hash.clone(),
                  size_bytes: artifact.size_bytes as i64,
                  idempotency_key: artifact.idempotency_key.clone(),
                  created_at: artifact.created_at }
}
