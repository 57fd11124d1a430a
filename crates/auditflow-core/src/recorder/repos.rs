//! Capa de repositorios: filas crudas → valores estrictos del dominio.
//!
//! Contrato:
//! - Todo lo que se lee del store o parsea al valor de dominio correcto o es
//!   error de corrupción. Nunca coerciones string→boolean, nunca variantes de
//!   enum desconocidas aceptadas en silencio, nunca `null` donde el dominio
//!   lo prohíbe.
//! - Los invariantes por variante de `NodeState` se verifican ACÁ, en tiempo
//!   de carga: una fila con columnas null/no-null inconsistentes es
//!   corrupción y se reporta con el state_id.

use uuid::Uuid;

use crate::errors::EngineError;
use crate::model::{
    ArtifactRecord, Batch, BatchMember, BatchStatus, CallRecord, CallStatus, CallType, Determinism, Edge, ExportStatus,
    NodeKind, NodeRecord, NodeState, NodeStateCommon, ReproducibilityGrade, RoutingEvent, RoutingMode, RowOutcome,
    RowRecord, RunRecord, RunStatus, Token, TokenOutcome, TokenParent, TriggerType,
};

use super::store::{
    ArtifactRow, BatchMemberRow, BatchRow, CallRow, EdgeRow, NodeRow, NodeStateRow, RoutingEventRow, RowRow, RunRow,
    TokenOutcomeRow, TokenParentRow, TokenRow,
};

fn corrupt(what: &str, detail: String) -> EngineError {
    EngineError::Corruption(format!("{what}: {detail}"))
}

fn parse_uuid(what: &str, raw: &str) -> Result<Uuid, EngineError> {
    Uuid::parse_str(raw).map_err(|_| corrupt(what, format!("invalid uuid '{raw}'")))
}

fn parse_opt_uuid(what: &str, raw: &Option<String>) -> Result<Option<Uuid>, EngineError> {
    match raw {
        Some(s) => parse_uuid(what, s).map(Some),
        None => Ok(None),
    }
}

/// Booleans persisten como 0/1; cualquier otro entero es corrupción.
fn parse_bool01(what: &str, raw: i32) -> Result<bool, EngineError> {
    match raw {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(corrupt(what, format!("boolean column holds {other}, expected 0 or 1"))),
    }
}

fn parse_u32(what: &str, raw: i64) -> Result<u32, EngineError> {
    u32::try_from(raw).map_err(|_| corrupt(what, format!("negative or oversized counter: {raw}")))
}

pub fn parse_run(row: &RunRow) -> Result<RunRecord, EngineError> {
    let status = RunStatus::parse(&row.status).ok_or_else(|| corrupt("run", format!("unknown status '{}'", row.status)))?;
    let reproducibility = ReproducibilityGrade::parse(&row.reproducibility)
        .ok_or_else(|| corrupt("run", format!("unknown reproducibility '{}'", row.reproducibility)))?;
    let export_status = match &row.export_status {
        Some(s) => Some(ExportStatus::parse(s).ok_or_else(|| corrupt("run", format!("unknown export status '{s}'")))?),
        None => None,
    };
    Ok(RunRecord { run_id: parse_uuid("run", &row.run_id)?,
                   started_at: row.started_at,
                   config_hash: row.config_hash.clone(),
                   settings_json: row.settings_json.clone(),
                   canonical_version: row.canonical_version.clone(),
                   status,
                   completed_at: row.completed_at,
                   reproducibility,
                   export_status,
                   export_metadata: row.export_metadata.clone() })
}

pub fn parse_node(row: &NodeRow) -> Result<NodeRecord, EngineError> {
    let kind = NodeKind::parse(&row.kind).ok_or_else(|| corrupt("node", format!("unknown node kind '{}'", row.kind)))?;
    let determinism = Determinism::parse(&row.determinism)
        .ok_or_else(|| corrupt("node", format!("unknown determinism '{}'", row.determinism)))?;
    let sequence = match row.sequence {
        Some(s) => Some(parse_u32("node.sequence", s)?),
        None => None,
    };
    Ok(NodeRecord { node_id: row.node_id.clone(),
                    run_id: parse_uuid("node.run_id", &row.run_id)?,
                    kind,
                    plugin_name: row.plugin_name.clone(),
                    plugin_version: row.plugin_version.clone(),
                    config_json: row.config_json.clone(),
                    config_hash: row.config_hash.clone(),
                    determinism,
                    input_schema: row.input_schema.clone(),
                    output_schema: row.output_schema.clone(),
                    sequence,
                    registered_at: row.registered_at })
}

pub fn parse_edge(row: &EdgeRow) -> Result<Edge, EngineError> {
    let mode = RoutingMode::parse(&row.mode).ok_or_else(|| corrupt("edge", format!("unknown routing mode '{}'", row.mode)))?;
    Ok(Edge { edge_id: row.edge_id.clone(),
              run_id: parse_uuid("edge.run_id", &row.run_id)?,
              from_node: row.from_node.clone(),
              to_node: row.to_node.clone(),
              label: row.label.clone(),
              mode,
              created_at: row.created_at })
}

pub fn parse_row_record(row: &RowRow) -> Result<RowRecord, EngineError> {
    let row_index = u64::try_from(row.row_index).map_err(|_| corrupt("row", format!("negative row_index {}", row.row_index)))?;
    Ok(RowRecord { row_id: parse_uuid("row.row_id", &row.row_id)?,
                   run_id: parse_uuid("row.run_id", &row.run_id)?,
                   source_node_id: row.source_node_id.clone(),
                   row_index,
                   source_data_hash: row.source_data_hash.clone(),
                   source_data_ref: row.source_data_ref.clone(),
                   created_at: row.created_at })
}

pub fn parse_token(row: &TokenRow) -> Result<Token, EngineError> {
    let step_in_pipeline = match row.step_in_pipeline {
        Some(s) => Some(parse_u32("token.step_in_pipeline", s)?),
        None => None,
    };
    Ok(Token { token_id: parse_uuid("token.token_id", &row.token_id)?,
               row_id: parse_uuid("token.row_id", &row.row_id)?,
               fork_group_id: parse_opt_uuid("token.fork_group_id", &row.fork_group_id)?,
               join_group_id: parse_opt_uuid("token.join_group_id", &row.join_group_id)?,
               expand_group_id: parse_opt_uuid("token.expand_group_id", &row.expand_group_id)?,
               branch_name: row.branch_name.clone(),
               step_in_pipeline,
               created_at: row.created_at })
}

pub fn parse_token_parent(row: &TokenParentRow) -> Result<TokenParent, EngineError> {
    Ok(TokenParent { child_token_id: parse_uuid("token_parent.child", &row.child_token_id)?,
                     parent_token_id: parse_uuid("token_parent.parent", &row.parent_token_id)?,
                     ordinal: parse_u32("token_parent.ordinal", row.ordinal)? })
}

/// Construye la unión discriminada verificando los invariantes por variante.
pub fn parse_node_state(row: &NodeStateRow) -> Result<NodeState, EngineError> {
    let common = NodeStateCommon { state_id: parse_uuid("node_state.state_id", &row.state_id)?,
                                   token_id: parse_uuid("node_state.token_id", &row.token_id)?,
                                   node_id: row.node_id.clone(),
                                   step_index: parse_u32("node_state.step_index", row.step_index)?,
                                   attempt: parse_u32("node_state.attempt", row.attempt)?,
                                   input_hash: row.input_hash.clone(),
                                   started_at: row.started_at,
                                   context_before: row.context_before.clone(),
                                   context_after: row.context_after.clone() };
    let sid = &row.state_id;
    match row.status.as_str() {
        "open" => {
            if row.completed_at.is_some() || row.duration_ms.is_some() || row.output_hash.is_some() || row.error_json.is_some() {
                return Err(corrupt("node_state", format!("state {sid} is open but has completion columns set")));
            }
            Ok(NodeState::Open { common })
        }
        "pending" => {
            let completed_at = row.completed_at
                                  .ok_or_else(|| corrupt("node_state", format!("pending state {sid} lacks completed_at")))?;
            let duration_ms = row.duration_ms
                                 .ok_or_else(|| corrupt("node_state", format!("pending state {sid} lacks duration_ms")))?;
            if row.output_hash.is_some() {
                return Err(corrupt("node_state", format!("pending state {sid} must not carry output_hash")));
            }
            Ok(NodeState::Pending { common, completed_at, duration_ms })
        }
        "completed" => {
            let completed_at = row.completed_at
                                  .ok_or_else(|| corrupt("node_state", format!("completed state {sid} lacks completed_at")))?;
            let duration_ms = row.duration_ms
                                 .ok_or_else(|| corrupt("node_state", format!("completed state {sid} lacks duration_ms")))?;
            let output_hash = row.output_hash
                                 .clone()
                                 .ok_or_else(|| corrupt("node_state", format!("completed state {sid} lacks output_hash")))?;
            Ok(NodeState::Completed { common,
                                      completed_at,
                                      duration_ms,
                                      output_hash })
        }
        "failed" => {
            let completed_at = row.completed_at
                                  .ok_or_else(|| corrupt("node_state", format!("failed state {sid} lacks completed_at")))?;
            let duration_ms = row.duration_ms
                                 .ok_or_else(|| corrupt("node_state", format!("failed state {sid} lacks duration_ms")))?;
            Ok(NodeState::Failed { common,
                                   completed_at,
                                   duration_ms,
                                   output_hash: row.output_hash.clone(),
                                   error: row.error_json.clone() })
        }
        other => Err(corrupt("node_state", format!("unknown status '{other}' in state {sid}"))),
    }
}

pub fn parse_routing_event(row: &RoutingEventRow) -> Result<RoutingEvent, EngineError> {
    let mode = RoutingMode::parse(&row.mode)
        .ok_or_else(|| corrupt("routing_event", format!("unknown routing mode '{}'", row.mode)))?;
    Ok(RoutingEvent { event_id: parse_uuid("routing_event.event_id", &row.event_id)?,
                      state_id: parse_uuid("routing_event.state_id", &row.state_id)?,
                      edge_id: row.edge_id.clone(),
                      routing_group_id: parse_uuid("routing_event.routing_group_id", &row.routing_group_id)?,
                      ordinal: parse_u32("routing_event.ordinal", row.ordinal)?,
                      mode,
                      reason_hash: row.reason_hash.clone(),
                      reason_ref: row.reason_ref.clone(),
                      created_at: row.created_at })
}

pub fn parse_call(row: &CallRow) -> Result<CallRecord, EngineError> {
    let call_type = CallType::parse(&row.call_type)
        .ok_or_else(|| corrupt("call", format!("unknown call type '{}'", row.call_type)))?;
    let status = CallStatus::parse(&row.status).ok_or_else(|| corrupt("call", format!("unknown call status '{}'", row.status)))?;
    Ok(CallRecord { call_id: parse_uuid("call.call_id", &row.call_id)?,
                    state_id: parse_uuid("call.state_id", &row.state_id)?,
                    call_index: parse_u32("call.call_index", row.call_index)?,
                    call_type,
                    status,
                    request_hash: row.request_hash.clone(),
                    request_ref: row.request_ref.clone(),
                    response_hash: row.response_hash.clone(),
                    response_ref: row.response_ref.clone(),
                    error: row.error_json.clone(),
                    latency_ms: row.latency_ms,
                    created_at: row.created_at })
}

pub fn parse_batch(row: &BatchRow) -> Result<Batch, EngineError> {
    let status = BatchStatus::parse(&row.status)
        .ok_or_else(|| corrupt("batch", format!("unknown batch status '{}'", row.status)))?;
    let trigger_type = match &row.trigger_type {
        Some(t) => Some(TriggerType::parse(t).ok_or_else(|| corrupt("batch", format!("unknown trigger type '{t}'")))?),
        None => None,
    };
    Ok(Batch { batch_id: parse_uuid("batch.batch_id", &row.batch_id)?,
               run_id: parse_uuid("batch.run_id", &row.run_id)?,
               aggregation_node_id: row.aggregation_node_id.clone(),
               attempt: parse_u32("batch.attempt", row.attempt)?,
               status,
               created_at: row.created_at,
               state_id: parse_opt_uuid("batch.state_id", &row.state_id)?,
               trigger_type,
               trigger_reason: row.trigger_reason.clone(),
               completed_at: row.completed_at })
}

pub fn parse_batch_member(row: &BatchMemberRow) -> Result<BatchMember, EngineError> {
    Ok(BatchMember { batch_id: parse_uuid("batch_member.batch_id", &row.batch_id)?,
                     token_id: parse_uuid("batch_member.token_id", &row.token_id)?,
                     ordinal: parse_u32("batch_member.ordinal", row.ordinal)? })
}

/// La terminalidad persistida DEBE coincidir con la estática del outcome.
pub fn parse_token_outcome(row: &TokenOutcomeRow) -> Result<TokenOutcome, EngineError> {
    let outcome = RowOutcome::parse(&row.outcome)
        .ok_or_else(|| corrupt("token_outcome", format!("unknown outcome '{}'", row.outcome)))?;
    let is_terminal = parse_bool01("token_outcome.is_terminal", row.is_terminal)?;
    if is_terminal != outcome.is_terminal() {
        return Err(corrupt("token_outcome",
                           format!("outcome '{}' stored with is_terminal={} but its static terminality is {}",
                                   row.outcome,
                                   is_terminal,
                                   outcome.is_terminal())));
    }
    Ok(TokenOutcome { outcome_id: parse_uuid("token_outcome.outcome_id", &row.outcome_id)?,
                      run_id: parse_uuid("token_outcome.run_id", &row.run_id)?,
                      token_id: parse_uuid("token_outcome.token_id", &row.token_id)?,
                      outcome,
                      is_terminal,
                      recorded_at: row.recorded_at,
                      sink_name: row.sink_name.clone(),
                      batch_id: parse_opt_uuid("token_outcome.batch_id", &row.batch_id)?,
                      fork_group_id: parse_opt_uuid("token_outcome.fork_group_id", &row.fork_group_id)?,
                      join_group_id: parse_opt_uuid("token_outcome.join_group_id", &row.join_group_id)?,
                      expand_group_id: parse_opt_uuid("token_outcome.expand_group_id", &row.expand_group_id)?,
                      error_hash: row.error_hash.clone(),
                      context: row.context_json.clone(),
                      expected_branches: row.expected_branches_json.clone() })
}

pub fn parse_artifact(row: &ArtifactRow) -> Result<ArtifactRecord, EngineError> {
    let size_bytes = u64::try_from(row.size_bytes)
        .map_err(|_| corrupt("artifact", format!("negative size_bytes {}", row.size_bytes)))?;
    Ok(ArtifactRecord { artifact_id: parse_uuid("artifact.artifact_id", &row.artifact_id)?,
                        run_id: parse_uuid("artifact.run_id", &row.run_id)?,
                        produced_by_state_id: parse_uuid("artifact.produced_by_state_id", &row.produced_by_state_id)?,
                        sink_node_id: row.sink_node_id.clone(),
                        artifact_type: row.artifact_type.clone(),
                        path_or_uri: row.path_or_uri.clone(),
                        content_hash: row.content_hash.clone(),
                        size_bytes,
                        idempotency_key: row.idempotency_key.clone(),
                        created_at: row.created_at })
}
