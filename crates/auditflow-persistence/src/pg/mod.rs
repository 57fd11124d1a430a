//! Implementación Postgres (Diesel) del `AuditStore` del kernel.
//!
//! Objetivo:
//! - Paridad 1:1 con el backend en memoria: mismas filas crudas, mismo
//!   parseo estricto aguas arriba (capa de repositorios del core).
//! - Disciplina append-only: inserciones sin updates salvo las transiciones
//!   de status que define el modelo (run, node_state, batch).
//! - Errores transitorios: retry con backoff pequeño en toda operación.

use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use log::warn;
use serde_json::Value;

use auditflow_core::recorder::store::{
    ArtifactRow, AuditStore, BatchMemberRow, BatchRow, CallRow, CheckpointRow, EdgeRow, NodeRow, NodeStateRow,
    RoutingEventRow, RowRow, RunRow, TokenOutcomeRow, TokenParentRow, TokenRow,
};
use auditflow_core::EngineError;
use chrono::{DateTime, Utc};

use crate::error::{is_retryable, PersistenceError};
use crate::migrations::run_pending_migrations;
use crate::schema::{
    artifacts, batch_members, batches, calls, checkpoints, edges, node_states, nodes, routing_events, rows,
    runs, token_outcomes, token_parents, tokens,
};

/// Pool r2d2 de conexiones Postgres. Al construirlo se corren las
/// migraciones pendientes una sola vez.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Construye el pool y aplica migraciones.
pub fn build_pool(url: &str, min_idle: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let manager = ConnectionManager::<PgConnection>::new(url);
    let pool = r2d2::Pool::builder().min_idle(Some(min_idle))
                                    .max_size(max_size)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    let mut conn = pool.get().map_err(|e| PersistenceError::TransientIo(format!("pool checkout: {e}")))?;
    run_pending_migrations(&mut conn)?;
    Ok(pool)
}

/// Retry con backoff exponencial pequeño (hasta 3 intentos).
fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable error (attempt {}): {:?} -> sleeping {}ms", attempts + 1, e, delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, PersistenceError> {
        self.pool.get().map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

// ===== Filas Diesel (orden de campos = orden de columnas) =====

#[derive(Queryable, Insertable, AsChangeset, Debug)]
#[diesel(table_name = runs)]
#[diesel(treat_none_as_null = true)]
struct PgRun {
    run_id: String,
    started_at: DateTime<Utc>,
    config_hash: String,
    settings_json: Value,
    canonical_version: String,
    status: String,
    completed_at: Option<DateTime<Utc>>,
    reproducibility: String,
    export_status: Option<String>,
    export_metadata: Option<Value>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = nodes)]
struct PgNode {
    node_id: String,
    run_id: String,
    kind: String,
    plugin_name: String,
    plugin_version: String,
    config_json: Value,
    config_hash: String,
    determinism: String,
    input_schema: Option<Value>,
    output_schema: Option<Value>,
    sequence: Option<i64>,
    registered_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = edges)]
struct PgEdge {
    edge_id: String,
    run_id: String,
    from_node: String,
    to_node: String,
    label: String,
    mode: String,
    created_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = rows)]
struct PgRowRecord {
    row_id: String,
    run_id: String,
    source_node_id: String,
    row_index: i64,
    source_data_hash: String,
    source_data_ref: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = tokens)]
struct PgToken {
    token_id: String,
    row_id: String,
    fork_group_id: Option<String>,
    join_group_id: Option<String>,
    expand_group_id: Option<String>,
    branch_name: Option<String>,
    step_in_pipeline: Option<i64>,
    created_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = token_parents)]
struct PgTokenParent {
    child_token_id: String,
    parent_token_id: String,
    ordinal: i64,
}

#[derive(Queryable, Insertable, AsChangeset, Debug)]
#[diesel(table_name = node_states)]
#[diesel(treat_none_as_null = true)]
struct PgNodeState {
    state_id: String,
    token_id: String,
    node_id: String,
    step_index: i64,
    attempt: i64,
    status: String,
    input_hash: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<f64>,
    output_hash: Option<String>,
    error_json: Option<Value>,
    context_before: Option<Value>,
    context_after: Option<Value>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = routing_events)]
struct PgRoutingEvent {
    event_id: String,
    state_id: String,
    edge_id: String,
    routing_group_id: String,
    ordinal: i64,
    mode: String,
    reason_hash: Option<String>,
    reason_ref: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = calls)]
struct PgCall {
    call_id: String,
    state_id: String,
    call_index: i64,
    call_type: String,
    status: String,
    request_hash: String,
    request_ref: Option<String>,
    response_hash: Option<String>,
    response_ref: Option<String>,
    error_json: Option<Value>,
    latency_ms: f64,
    created_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, AsChangeset, Debug)]
#[diesel(table_name = batches)]
#[diesel(treat_none_as_null = true)]
struct PgBatch {
    batch_id: String,
    run_id: String,
    aggregation_node_id: String,
    attempt: i64,
    status: String,
    created_at: DateTime<Utc>,
    state_id: Option<String>,
    trigger_type: Option<String>,
    trigger_reason: Option<Value>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = batch_members)]
struct PgBatchMember {
    batch_id: String,
    token_id: String,
    ordinal: i64,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = token_outcomes)]
struct PgTokenOutcome {
    outcome_id: String,
    run_id: String,
    token_id: String,
    outcome: String,
    is_terminal: i32,
    recorded_at: DateTime<Utc>,
    sink_name: Option<String>,
    batch_id: Option<String>,
    fork_group_id: Option<String>,
    join_group_id: Option<String>,
    expand_group_id: Option<String>,
    error_hash: Option<String>,
    context_json: Option<Value>,
    expected_branches_json: Option<Value>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = artifacts)]
struct PgArtifact {
    artifact_id: String,
    run_id: String,
    produced_by_state_id: String,
    sink_node_id: String,
    artifact_type: String,
    path_or_uri: String,
    content_hash: String,
    size_bytes: i64,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, Debug)]
#[diesel(table_name = checkpoints)]
struct PgCheckpoint {
    checkpoint_id: String,
    run_id: String,
    token_id: String,
    node_id: String,
    sequence_number: i64,
    payload_json: String,
    created_at: DateTime<Utc>,
}

// ===== Conversión filas Diesel ↔ filas crudas del core =====

impl From<RunRow> for PgRun {
    fn from(r: RunRow) -> Self {
        Self { run_id: r.run_id,
               started_at: r.started_at,
               config_hash: r.config_hash,
               settings_json: r.settings_json,
               canonical_version: r.canonical_version,
               status: r.status,
               completed_at: r.completed_at,
               reproducibility: r.reproducibility,
               export_status: r.export_status,
               export_metadata: r.export_metadata }
    }
}

impl From<PgRun> for RunRow {
    fn from(r: PgRun) -> Self {
        Self { run_id: r.run_id,
               started_at: r.started_at,
               config_hash: r.config_hash,
               settings_json: r.settings_json,
               canonical_version: r.canonical_version,
               status: r.status,
               completed_at: r.completed_at,
               reproducibility: r.reproducibility,
               export_status: r.export_status,
               export_metadata: r.export_metadata }
    }
}

impl From<NodeRow> for PgNode {
    fn from(r: NodeRow) -> Self {
        Self { node_id: r.node_id,
               run_id: r.run_id,
               kind: r.kind,
               plugin_name: r.plugin_name,
               plugin_version: r.plugin_version,
               config_json: r.config_json,
               config_hash: r.config_hash,
               determinism: r.determinism,
               input_schema: r.input_schema,
               output_schema: r.output_schema,
               sequence: r.sequence,
               registered_at: r.registered_at }
    }
}

impl From<PgNode> for NodeRow {
    fn from(r: PgNode) -> Self {
        Self { node_id: r.node_id,
               run_id: r.run_id,
               kind: r.kind,
               plugin_name: r.plugin_name,
               plugin_version: r.plugin_version,
               config_json: r.config_json,
               config_hash: r.config_hash,
               determinism: r.determinism,
               input_schema: r.input_schema,
               output_schema: r.output_schema,
               sequence: r.sequence,
               registered_at: r.registered_at }
    }
}

impl From<EdgeRow> for PgEdge {
    fn from(r: EdgeRow) -> Self {
        Self { edge_id: r.edge_id,
               run_id: r.run_id,
               from_node: r.from_node,
               to_node: r.to_node,
               label: r.label,
               mode: r.mode,
               created_at: r.created_at }
    }
}

impl From<PgEdge> for EdgeRow {
    fn from(r: PgEdge) -> Self {
        Self { edge_id: r.edge_id,
               run_id: r.run_id,
               from_node: r.from_node,
               to_node: r.to_node,
               label: r.label,
               mode: r.mode,
               created_at: r.created_at }
    }
}

impl From<RowRow> for PgRowRecord {
    fn from(r: RowRow) -> Self {
        Self { row_id: r.row_id,
               run_id: r.run_id,
               source_node_id: r.source_node_id,
               row_index: r.row_index,
               source_data_hash: r.source_data_hash,
               source_data_ref: r.source_data_ref,
               created_at: r.created_at }
    }
}

impl From<PgRowRecord> for RowRow {
    fn from(r: PgRowRecord) -> Self {
        Self { row_id: r.row_id,
               run_id: r.run_id,
               source_node_id: r.source_node_id,
               row_index: r.row_index,
               source_data_hash: r.source_data_hash,
               source_data_ref: r.source_data_ref,
               created_at: r.created_at }
    }
}

impl From<TokenRow> for PgToken {
    fn from(r: TokenRow) -> Self {
        Self { token_id: r.token_id,
               row_id: r.row_id,
               fork_group_id: r.fork_group_id,
               join_group_id: r.join_group_id,
               expand_group_id: r.expand_group_id,
               branch_name: r.branch_name,
               step_in_pipeline: r.step_in_pipeline,
               created_at: r.created_at }
    }
}

impl From<PgToken> for TokenRow {
    fn from(r: PgToken) -> Self {
        Self { token_id: r.token_id,
               row_id: r.row_id,
               fork_group_id: r.fork_group_id,
               join_group_id: r.join_group_id,
               expand_group_id: r.expand_group_id,
               branch_name: r.branch_name,
               step_in_pipeline: r.step_in_pipeline,
               created_at: r.created_at }
    }
}

impl From<TokenParentRow> for PgTokenParent {
    fn from(r: TokenParentRow) -> Self {
        Self { child_token_id: r.child_token_id,
               parent_token_id: r.parent_token_id,
               ordinal: r.ordinal }
    }
}

impl From<PgTokenParent> for TokenParentRow {
    fn from(r: PgTokenParent) -> Self {
        Self { child_token_id: r.child_token_id,
               parent_token_id: r.parent_token_id,
               ordinal: r.ordinal }
    }
}

impl From<NodeStateRow> for PgNodeState {
    fn from(r: NodeStateRow) -> Self {
        Self { state_id: r.state_id,
               token_id: r.token_id,
               node_id: r.node_id,
               step_index: r.step_index,
               attempt: r.attempt,
               status: r.status,
               input_hash: r.input_hash,
               started_at: r.started_at,
               completed_at: r.completed_at,
               duration_ms: r.duration_ms,
               output_hash: r.output_hash,
               error_json: r.error_json,
               context_before: r.context_before,
               context_after: r.context_after }
    }
}

impl From<PgNodeState> for NodeStateRow {
    fn from(r: PgNodeState) -> Self {
        Self { state_id: r.state_id,
               token_id: r.token_id,
               node_id: r.node_id,
               step_index: r.step_index,
               attempt: r.attempt,
               status: r.status,
               input_hash: r.input_hash,
               started_at: r.started_at,
               completed_at: r.completed_at,
               duration_ms: r.duration_ms,
               output_hash: r.output_hash,
               error_json: r.error_json,
               context_before: r.context_before,
               context_after: r.context_after }
    }
}

impl From<RoutingEventRow> for PgRoutingEvent {
    fn from(r: RoutingEventRow) -> Self {
        Self { event_id: r.event_id,
               state_id: r.state_id,
               edge_id: r.edge_id,
               routing_group_id: r.routing_group_id,
               ordinal: r.ordinal,
               mode: r.mode,
               reason_hash: r.reason_hash,
               reason_ref: r.reason_ref,
               created_at: r.created_at }
    }
}

impl From<PgRoutingEvent> for RoutingEventRow {
    fn from(r: PgRoutingEvent) -> Self {
        Self { event_id: r.event_id,
               state_id: r.state_id,
               edge_id: r.edge_id,
               routing_group_id: r.routing_group_id,
               ordinal: r.ordinal,
               mode: r.mode,
               reason_hash: r.reason_hash,
               reason_ref: r.reason_ref,
               created_at: r.created_at }
    }
}

impl From<CallRow> for PgCall {
    fn from(r: CallRow) -> Self {
        Self { call_id: r.call_id,
               state_id: r.state_id,
               call_index: r.call_index,
               call_type: r.call_type,
               status: r.status,
               request_hash: r.request_hash,
               request_ref: r.request_ref,
               response_hash: r.response_hash,
               response_ref: r.response_ref,
               error_json: r.error_json,
               latency_ms: r.latency_ms,
               created_at: r.created_at }
    }
}

impl From<PgCall> for CallRow {
    fn from(r: PgCall) -> Self {
        Self { call_id: r.call_id,
               state_id: r.state_id,
               call_index: r.call_index,
               call_type: r.call_type,
               status: r.status,
               request_hash: r.request_hash,
               request_ref: r.request_ref,
               response_hash: r.response_hash,
               response_ref: r.response_ref,
               error_json: r.error_json,
               latency_ms: r.latency_ms,
               created_at: r.created_at }
    }
}

impl From<BatchRow> for PgBatch {
    fn from(r: BatchRow) -> Self {
        Self { batch_id: r.batch_id,
               run_id: r.run_id,
               aggregation_node_id: r.aggregation_node_id,
               attempt: r.attempt,
               status: r.status,
               created_at: r.created_at,
               state_id: r.state_id,
               trigger_type: r.trigger_type,
               trigger_reason: r.trigger_reason,
               completed_at: r.completed_at }
    }
}

impl From<PgBatch> for BatchRow {
    fn from(r: PgBatch) -> Self {
        Self { batch_id: r.batch_id,
               run_id: r.run_id,
               aggregation_node_id: r.aggregation_node_id,
               attempt: r.attempt,
               status: r.status,
               created_at: r.created_at,
               state_id: r.state_id,
               trigger_type: r.trigger_type,
               trigger_reason: r.trigger_reason,
               completed_at: r.completed_at }
    }
}

impl From<BatchMemberRow> for PgBatchMember {
    fn from(r: BatchMemberRow) -> Self {
        Self { batch_id: r.batch_id,
               token_id: r.token_id,
               ordinal: r.ordinal }
    }
}

impl From<PgBatchMember> for BatchMemberRow {
    fn from(r: PgBatchMember) -> Self {
        Self { batch_id: r.batch_id,
               token_id: r.token_id,
               ordinal: r.ordinal }
    }
}

impl From<TokenOutcomeRow> for PgTokenOutcome {
    fn from(r: TokenOutcomeRow) -> Self {
        Self { outcome_id: r.outcome_id,
               run_id: r.run_id,
               token_id: r.token_id,
               outcome: r.outcome,
               is_terminal: r.is_terminal,
               recorded_at: r.recorded_at,
               sink_name: r.sink_name,
               batch_id: r.batch_id,
               fork_group_id: r.fork_group_id,
               join_group_id: r.join_group_id,
               expand_group_id: r.expand_group_id,
               error_hash: r.error_hash,
               context_json: r.context_json,
               expected_branches_json: r.expected_branches_json }
    }
}

impl From<PgTokenOutcome> for TokenOutcomeRow {
    fn from(r: PgTokenOutcome) -> Self {
        Self { outcome_id: r.outcome_id,
               run_id: r.run_id,
               token_id: r.token_id,
               outcome: r.outcome,
               is_terminal: r.is_terminal,
               recorded_at: r.recorded_at,
               sink_name: r.sink_name,
               batch_id: r.batch_id,
               fork_group_id: r.fork_group_id,
               join_group_id: r.join_group_id,
               expand_group_id: r.expand_group_id,
               error_hash: r.error_hash,
               context_json: r.context_json,
               expected_branches_json: r.expected_branches_json }
    }
}

impl From<ArtifactRow> for PgArtifact {
    fn from(r: ArtifactRow) -> Self {
        Self { artifact_id: r.artifact_id,
               run_id: r.run_id,
               produced_by_state_id: r.produced_by_state_id,
               sink_node_id: r.sink_node_id,
               artifact_type: r.artifact_type,
               path_or_uri: r.path_or_uri,
               content_hash: r.content_hash,
               size_bytes: r.size_bytes,
               idempotency_key: r.idempotency_key,
               created_at: r.created_at }
    }
}

impl From<PgArtifact> for ArtifactRow {
    fn from(r: PgArtifact) -> Self {
        Self { artifact_id: r.artifact_id,
               run_id: r.run_id,
               produced_by_state_id: r.produced_by_state_id,
               sink_node_id: r.sink_node_id,
               artifact_type: r.artifact_type,
               path_or_uri: r.path_or_uri,
               content_hash: r.content_hash,
               size_bytes: r.size_bytes,
               idempotency_key: r.idempotency_key,
               created_at: r.created_at }
    }
}

impl From<CheckpointRow> for PgCheckpoint {
    fn from(r: CheckpointRow) -> Self {
        Self { checkpoint_id: r.checkpoint_id,
               run_id: r.run_id,
               token_id: r.token_id,
               node_id: r.node_id,
               sequence_number: r.sequence_number,
               payload_json: r.payload_json,
               created_at: r.created_at }
    }
}

impl From<PgCheckpoint> for CheckpointRow {
    fn from(r: PgCheckpoint) -> Self {
        Self { checkpoint_id: r.checkpoint_id,
               run_id: r.run_id,
               token_id: r.token_id,
               node_id: r.node_id,
               sequence_number: r.sequence_number,
               payload_json: r.payload_json,
               created_at: r.created_at }
    }
}

// ===== AuditStore =====

impl AuditStore for PgAuditStore {
    fn insert_run(&self, row: RunRow) -> Result<(), EngineError> {
        let pg_row = PgRun::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(runs::table).values(&pg_row)
                                            .execute(&mut conn)
                                            .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn update_run(&self, row: RunRow) -> Result<(), EngineError> {
        let pg_row = PgRun::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::update(runs::table.find(&pg_row.run_id)).set(&pg_row)
                                                            .execute(&mut conn)
                                                            .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<RunRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            runs::table.find(run_id)
                       .first::<PgRun>(&mut conn)
                       .optional()
                       .map_err(PersistenceError::from)
        }).map(|r| r.map(RunRow::from))
          .map_err(EngineError::from)
    }

    fn insert_node(&self, row: NodeRow) -> Result<(), EngineError> {
        let pg_row = PgNode::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(nodes::table).values(&pg_row)
                                             .execute(&mut conn)
                                             .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn update_node_output_schema(&self, node_id: &str, run_id: &str, output_schema: Value) -> Result<(), EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::update(nodes::table.find((run_id, node_id)))
                .set(nodes::output_schema.eq(Some(output_schema.clone())))
                .execute(&mut conn)
                .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn get_node(&self, run_id: &str, node_id: &str) -> Result<Option<NodeRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            nodes::table.find((run_id, node_id))
                        .first::<PgNode>(&mut conn)
                        .optional()
                        .map_err(PersistenceError::from)
        }).map(|r| r.map(NodeRow::from))
          .map_err(EngineError::from)
    }

    fn list_nodes(&self, run_id: &str) -> Result<Vec<NodeRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            nodes::table.filter(nodes::run_id.eq(run_id))
                        .load::<PgNode>(&mut conn)
                        .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(NodeRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_edge(&self, row: EdgeRow) -> Result<(), EngineError> {
        let pg_row = PgEdge::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(edges::table).values(&pg_row)
                                             .execute(&mut conn)
                                             .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn list_edges(&self, run_id: &str) -> Result<Vec<EdgeRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            edges::table.filter(edges::run_id.eq(run_id))
                        .load::<PgEdge>(&mut conn)
                        .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(EdgeRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_row(&self, row: RowRow) -> Result<(), EngineError> {
        let pg_row = PgRowRecord::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(rows::table).values(&pg_row)
                                            .execute(&mut conn)
                                            .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn get_row(&self, row_id: &str) -> Result<Option<RowRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            rows::table.find(row_id)
                       .first::<PgRowRecord>(&mut conn)
                       .optional()
                       .map_err(PersistenceError::from)
        }).map(|r| r.map(RowRow::from))
          .map_err(EngineError::from)
    }

    fn list_rows(&self, run_id: &str) -> Result<Vec<RowRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            rows::table.filter(rows::run_id.eq(run_id))
                       .order(rows::row_index.asc())
                       .load::<PgRowRecord>(&mut conn)
                       .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(RowRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_token(&self, row: TokenRow) -> Result<(), EngineError> {
        let pg_row = PgToken::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(tokens::table).values(&pg_row)
                                              .execute(&mut conn)
                                              .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn get_token(&self, token_id: &str) -> Result<Option<TokenRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            tokens::table.find(token_id)
                         .first::<PgToken>(&mut conn)
                         .optional()
                         .map_err(PersistenceError::from)
        }).map(|r| r.map(TokenRow::from))
          .map_err(EngineError::from)
    }

    fn list_tokens_for_row(&self, row_id: &str) -> Result<Vec<TokenRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            tokens::table.filter(tokens::row_id.eq(row_id))
                         .order(tokens::created_at.asc())
                         .load::<PgToken>(&mut conn)
                         .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(TokenRow::from).collect())
          .map_err(EngineError::from)
    }

    fn list_tokens_for_run(&self, run_id: &str) -> Result<Vec<TokenRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            tokens::table.inner_join(rows::table.on(rows::row_id.eq(tokens::row_id)))
                         .filter(rows::run_id.eq(run_id))
                         .select(tokens::all_columns)
                         .load::<PgToken>(&mut conn)
                         .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(TokenRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_token_parent(&self, row: TokenParentRow) -> Result<(), EngineError> {
        let pg_row = PgTokenParent::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(token_parents::table).values(&pg_row)
                                                     .execute(&mut conn)
                                                     .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn list_token_parents(&self, child_token_id: &str) -> Result<Vec<TokenParentRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            token_parents::table.filter(token_parents::child_token_id.eq(child_token_id))
                                .order(token_parents::ordinal.asc())
                                .load::<PgTokenParent>(&mut conn)
                                .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(TokenParentRow::from).collect())
          .map_err(EngineError::from)
    }

    fn list_token_parents_for_run(&self, run_id: &str) -> Result<Vec<TokenParentRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            token_parents::table
                .inner_join(tokens::table.on(tokens::token_id.eq(token_parents::child_token_id)))
                .inner_join(rows::table.on(rows::row_id.eq(tokens::row_id)))
                .filter(rows::run_id.eq(run_id))
                .select(token_parents::all_columns)
                .load::<PgTokenParent>(&mut conn)
                .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(TokenParentRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_node_state(&self, row: NodeStateRow) -> Result<(), EngineError> {
        let pg_row = PgNodeState::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(node_states::table).values(&pg_row)
                                                   .execute(&mut conn)
                                                   .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn update_node_state(&self, row: NodeStateRow) -> Result<(), EngineError> {
        let pg_row = PgNodeState::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::update(node_states::table.find(&pg_row.state_id)).set(&pg_row)
                                                                     .execute(&mut conn)
                                                                     .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn get_node_state(&self, state_id: &str) -> Result<Option<NodeStateRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            node_states::table.find(state_id)
                              .first::<PgNodeState>(&mut conn)
                              .optional()
                              .map_err(PersistenceError::from)
        }).map(|r| r.map(NodeStateRow::from))
          .map_err(EngineError::from)
    }

    fn list_states_for_token(&self, token_id: &str) -> Result<Vec<NodeStateRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            node_states::table.filter(node_states::token_id.eq(token_id))
                              .order((node_states::step_index.asc(), node_states::attempt.asc()))
                              .load::<PgNodeState>(&mut conn)
                              .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(NodeStateRow::from).collect())
          .map_err(EngineError::from)
    }

    fn list_states_for_run(&self, run_id: &str) -> Result<Vec<NodeStateRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            node_states::table
                .inner_join(tokens::table.on(tokens::token_id.eq(node_states::token_id)))
                .inner_join(rows::table.on(rows::row_id.eq(tokens::row_id)))
                .filter(rows::run_id.eq(run_id))
                .select(node_states::all_columns)
                .load::<PgNodeState>(&mut conn)
                .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(NodeStateRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_routing_event(&self, row: RoutingEventRow) -> Result<(), EngineError> {
        let pg_row = PgRoutingEvent::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(routing_events::table).values(&pg_row)
                                                      .execute(&mut conn)
                                                      .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn list_routing_events_for_state(&self, state_id: &str) -> Result<Vec<RoutingEventRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            routing_events::table.filter(routing_events::state_id.eq(state_id))
                                 .order(routing_events::ordinal.asc())
                                 .load::<PgRoutingEvent>(&mut conn)
                                 .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(RoutingEventRow::from).collect())
          .map_err(EngineError::from)
    }

    fn list_routing_events_for_run(&self, run_id: &str) -> Result<Vec<RoutingEventRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            routing_events::table
                .inner_join(node_states::table.on(node_states::state_id.eq(routing_events::state_id)))
                .inner_join(tokens::table.on(tokens::token_id.eq(node_states::token_id)))
                .inner_join(rows::table.on(rows::row_id.eq(tokens::row_id)))
                .filter(rows::run_id.eq(run_id))
                .select(routing_events::all_columns)
                .load::<PgRoutingEvent>(&mut conn)
                .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(RoutingEventRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_call(&self, row: CallRow) -> Result<(), EngineError> {
        let pg_row = PgCall::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(calls::table).values(&pg_row)
                                             .execute(&mut conn)
                                             .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn list_calls_for_state(&self, state_id: &str) -> Result<Vec<CallRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            calls::table.filter(calls::state_id.eq(state_id))
                        .order(calls::call_index.asc())
                        .load::<PgCall>(&mut conn)
                        .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(CallRow::from).collect())
          .map_err(EngineError::from)
    }

    fn list_calls_for_run(&self, run_id: &str) -> Result<Vec<CallRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            calls::table
                .inner_join(node_states::table.on(node_states::state_id.eq(calls::state_id)))
                .inner_join(tokens::table.on(tokens::token_id.eq(node_states::token_id)))
                .inner_join(rows::table.on(rows::row_id.eq(tokens::row_id)))
                .filter(rows::run_id.eq(run_id))
                .select(calls::all_columns)
                .load::<PgCall>(&mut conn)
                .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(CallRow::from).collect())
          .map_err(EngineError::from)
    }

    fn next_call_index(&self, state_id: &str) -> Result<i64, EngineError> {
        // Serializado por estado: las llamadas de un estado provienen de un
        // único worker, max+1 dentro de la transacción alcanza.
        with_retry(|| {
            let mut conn = self.conn()?;
            conn.build_transaction().read_write().run(|tx_conn| {
                let max: Option<i64> = calls::table.filter(calls::state_id.eq(state_id))
                                                   .select(diesel::dsl::max(calls::call_index))
                                                   .first(tx_conn)?;
                Ok::<i64, diesel::result::Error>(max.map(|m| m + 1).unwrap_or(0))
            }).map_err(PersistenceError::from)
        }).map_err(EngineError::from)
    }

    fn insert_batch(&self, row: BatchRow) -> Result<(), EngineError> {
        let pg_row = PgBatch::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(batches::table).values(&pg_row)
                                               .execute(&mut conn)
                                               .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn update_batch(&self, row: BatchRow) -> Result<(), EngineError> {
        let pg_row = PgBatch::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::update(batches::table.find(&pg_row.batch_id)).set(&pg_row)
                                                                 .execute(&mut conn)
                                                                 .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            batches::table.find(batch_id)
                          .first::<PgBatch>(&mut conn)
                          .optional()
                          .map_err(PersistenceError::from)
        }).map(|r| r.map(BatchRow::from))
          .map_err(EngineError::from)
    }

    fn list_batches(&self, run_id: &str) -> Result<Vec<BatchRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            batches::table.filter(batches::run_id.eq(run_id))
                          .order(batches::created_at.asc())
                          .load::<PgBatch>(&mut conn)
                          .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(BatchRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_batch_member(&self, row: BatchMemberRow) -> Result<(), EngineError> {
        let pg_row = PgBatchMember::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(batch_members::table).values(&pg_row)
                                                     .execute(&mut conn)
                                                     .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn list_batch_members(&self, batch_id: &str) -> Result<Vec<BatchMemberRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            batch_members::table.filter(batch_members::batch_id.eq(batch_id))
                                .order(batch_members::ordinal.asc())
                                .load::<PgBatchMember>(&mut conn)
                                .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(BatchMemberRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_token_outcome(&self, row: TokenOutcomeRow) -> Result<(), EngineError> {
        let pg_row = PgTokenOutcome::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(token_outcomes::table).values(&pg_row)
                                                      .execute(&mut conn)
                                                      .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn list_outcomes_for_token(&self, token_id: &str) -> Result<Vec<TokenOutcomeRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            token_outcomes::table.filter(token_outcomes::token_id.eq(token_id))
                                 .order(token_outcomes::recorded_at.asc())
                                 .load::<PgTokenOutcome>(&mut conn)
                                 .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(TokenOutcomeRow::from).collect())
          .map_err(EngineError::from)
    }

    fn list_outcomes_for_run(&self, run_id: &str) -> Result<Vec<TokenOutcomeRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            token_outcomes::table.filter(token_outcomes::run_id.eq(run_id))
                                 .order(token_outcomes::recorded_at.asc())
                                 .load::<PgTokenOutcome>(&mut conn)
                                 .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(TokenOutcomeRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_artifact(&self, row: ArtifactRow) -> Result<(), EngineError> {
        let pg_row = PgArtifact::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(artifacts::table).values(&pg_row)
                                                 .execute(&mut conn)
                                                 .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            artifacts::table.filter(artifacts::run_id.eq(run_id))
                            .order(artifacts::created_at.asc())
                            .load::<PgArtifact>(&mut conn)
                            .map_err(PersistenceError::from)
        }).map(|rows| rows.into_iter().map(ArtifactRow::from).collect())
          .map_err(EngineError::from)
    }

    fn insert_checkpoint(&self, row: CheckpointRow) -> Result<(), EngineError> {
        let pg_row = PgCheckpoint::from(row);
        with_retry(|| {
            let mut conn = self.conn()?;
            diesel::insert_into(checkpoints::table).values(&pg_row)
                                                   .execute(&mut conn)
                                                   .map_err(PersistenceError::from)?;
            Ok(())
        }).map_err(EngineError::from)
    }

    fn latest_checkpoint(&self, run_id: &str) -> Result<Option<CheckpointRow>, EngineError> {
        with_retry(|| {
            let mut conn = self.conn()?;
            checkpoints::table.filter(checkpoints::run_id.eq(run_id))
                              .order(checkpoints::sequence_number.desc())
                              .first::<PgCheckpoint>(&mut conn)
                              .optional()
                              .map_err(PersistenceError::from)
        }).map(|r| r.map(CheckpointRow::from))
          .map_err(EngineError::from)
    }
}
