//! Executor de agregaciones: buffer estructural + ciclo de vida de lotes.
//!
//! La agregación es ESTRUCTURAL: el motor es dueño del buffer, el plugin
//! sólo procesa el lote cuando el trigger dispara. Ciclo del lote:
//! draft (primer accept) → executing (flush) → completed/failed.
//!
//! El terminal CONSUMED_IN_BATCH se deriva de batch_members, no del status
//! del estado de nodo.
//!
//! Ruta BatchPending: un plugin que envió trabajo remoto y aún no tiene
//! resultado cierra el estado PENDING, deja el lote en executing con el
//! estado vinculado y NO resetea buffers; el orchestrator reingresa después
//! (posiblemente tras un restart) para completar el mismo lote.

use auditflow_domain::{PipelineRow, SchemaContract};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::dag::AggregationSettings;
use crate::errors::EngineError;
use crate::model::{BatchStatus, RowOutcome, TokenInfo, TriggerType};
use crate::plugin::{PluginContext, PluginError, TransformPlugin, TransformResult};
use crate::recorder::{LandscapeRecorder, StateCompletion};

use super::triggers::TriggerEvaluator;

/// Resultado de un flush.
#[derive(Debug)]
pub enum FlushOutcome {
    /// El lote terminó (bien o mal); los buffers quedaron reseteados.
    Finished {
        result: TransformResult,
        consumed: Vec<TokenInfo>,
        batch_id: Uuid,
        state_id: Uuid,
    },
    /// El plugin señaló BatchPending: lote en executing, buffers intactos.
    Pending { batch_id: Uuid, state_id: Uuid },
}

pub struct AggregationExecutor {
    recorder: Arc<LandscapeRecorder>,
    run_id: Uuid,
    /// node_id → batch en curso (None entre lotes).
    batch_ids: HashMap<String, Uuid>,
    /// batch_id → conteo de miembros (ordinales).
    member_counts: HashMap<Uuid, u32>,
    buffers: HashMap<String, Vec<IndexMap<String, Value>>>,
    buffer_tokens: HashMap<String, Vec<TokenInfo>>,
    evaluators: HashMap<String, TriggerEvaluator>,
    restored_states: HashMap<String, Value>,
}

impl AggregationExecutor {
    pub fn new(recorder: Arc<LandscapeRecorder>,
               run_id: Uuid,
               aggregation_settings: &HashMap<String, AggregationSettings>)
               -> Result<Self, EngineError> {
        let mut evaluators = HashMap::new();
        let mut buffers = HashMap::new();
        let mut buffer_tokens = HashMap::new();
        for (node_id, settings) in aggregation_settings {
            evaluators.insert(node_id.clone(), TriggerEvaluator::new(&settings.trigger)?);
            buffers.insert(node_id.clone(), Vec::new());
            buffer_tokens.insert(node_id.clone(), Vec::new());
        }
        Ok(Self { recorder,
                  run_id,
                  batch_ids: HashMap::new(),
                  member_counts: HashMap::new(),
                  buffers,
                  buffer_tokens,
                  evaluators,
                  restored_states: HashMap::new() })
    }

    /// Acepta una fila al buffer del nodo. Crea el lote draft en el primer
    /// accept, graba la membresía con su ordinal y alimenta el trigger.
    pub fn buffer_row(&mut self, node_id: &str, token: &TokenInfo) -> Result<Uuid, EngineError> {
        let batch_id = match self.batch_ids.get(node_id) {
            Some(id) => *id,
            None => {
                let batch = self.recorder.create_batch(self.run_id, node_id, 0)?;
                self.batch_ids.insert(node_id.to_string(), batch.batch_id);
                self.member_counts.insert(batch.batch_id, 0);
                batch.batch_id
            }
        };

        self.buffers.entry(node_id.to_string()).or_default().push(token.row.to_dict());
        self.buffer_tokens.entry(node_id.to_string()).or_default().push(token.clone());

        let ordinal = *self.member_counts.get(&batch_id).unwrap_or(&0);
        self.recorder.add_batch_member(batch_id, token.token_id, ordinal)?;
        self.member_counts.insert(batch_id, ordinal + 1);

        // Marcador no terminal: el token espera dentro del buffer.
        self.recorder.record_token_outcome(self.run_id,
                                           token.token_id,
                                           RowOutcome::Buffered,
                                           None,
                                           Some(batch_id),
                                           None,
                                           None,
                                           None)?;

        if let Some(evaluator) = self.evaluators.get_mut(node_id) {
            evaluator.record_accept(&token.row.to_dict())?;
        }
        Ok(batch_id)
    }

    pub fn buffer_count(&self, node_id: &str) -> usize {
        self.buffers.get(node_id).map(|b| b.len()).unwrap_or(0)
    }

    pub fn batch_id(&self, node_id: &str) -> Option<Uuid> {
        self.batch_ids.get(node_id).copied()
    }

    /// (dispara?, tipo) sin consumir el estado del trigger.
    pub fn check_flush_status(&mut self, node_id: &str) -> (bool, Option<TriggerType>) {
        match self.evaluators.get_mut(node_id) {
            Some(evaluator) => {
                let fired = evaluator.check();
                (fired.is_some(), fired)
            }
            None => (false, None),
        }
    }

    pub fn should_flush(&mut self, node_id: &str) -> bool {
        self.check_flush_status(node_id).0
    }

    /// Ejecuta el flush del lote en curso con auditoría completa.
    pub fn execute_flush(&mut self,
                         node_id: &str,
                         transform: &mut dyn TransformPlugin,
                         ctx: &mut PluginContext,
                         step_in_pipeline: u32,
                         trigger_type: TriggerType)
                         -> Result<FlushOutcome, EngineError> {
        let batch_id = *self.batch_ids
                            .get(node_id)
                            .ok_or_else(|| EngineError::Internal(format!("no batch exists for node {node_id} - cannot \
                                                                          flush")))?;
        let buffered_rows = self.buffers.get(node_id).cloned().unwrap_or_default();
        let buffered_tokens = self.buffer_tokens.get(node_id).cloned().unwrap_or_default();
        if buffered_rows.is_empty() {
            return Err(EngineError::Internal(format!("cannot flush empty buffer for node {node_id}")));
        }

        // Hash de entrada del lote completo.
        let rows_value = Value::Array(buffered_rows.iter().map(map_to_value).collect());
        let batch_input = serde_json::json!({"batch_rows": rows_value});
        let input_hash = crate::hashing::hash_value(&batch_input);

        // Paso 1: lote → executing con el tipo de trigger.
        self.recorder.update_batch_status(batch_id, BatchStatus::Executing, Some(trigger_type))?;

        // Paso 2: estado de nodo del flush (el primer token representa al
        // lote).
        let representative = &buffered_tokens[0];
        let state = self.recorder
                        .begin_node_state(representative.token_id, node_id, step_in_pipeline, 0, &batch_input)?;
        let state_id = state.state_id();

        ctx.state_id = Some(state_id);
        ctx.node_id = Some(node_id.to_string());
        ctx.token_id = None;
        ctx.batch_token_ids = Some(buffered_tokens.iter().map(|t| t.token_id).collect());
        ctx.contract = Some(Arc::clone(representative.row.contract()));

        // Paso 3: reconstruir filas con contrato y ejecutar el plugin.
        let contract = Arc::clone(representative.row.contract());
        let rows: Vec<PipelineRow> = buffered_rows.iter()
                                                  .map(|r| PipelineRow::from_trusted(r.clone(), Arc::clone(&contract)))
                                                  .collect();

        let started = Instant::now();
        let outcome = transform.process_batch(rows, ctx);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut result = match outcome {
            Ok(result) => result,
            Err(PluginError::BatchPending) => {
                // Señal de control, no error: estado PENDING, lote sigue en
                // executing con el estado vinculado, buffers intactos.
                self.recorder.complete_node_state(state_id, StateCompletion::Pending { duration_ms })?;
                self.recorder.link_batch_state(batch_id, state_id)?;
                return Ok(FlushOutcome::Pending { batch_id, state_id });
            }
            Err(plugin_error) => {
                let error_json = serde_json::json!({"exception": plugin_error.to_string(), "type": "PluginError"});
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Failed { error: Some(error_json),
                                                                            duration_ms,
                                                                            output_hash: None })?;
                self.recorder
                    .complete_batch(batch_id, BatchStatus::Failed, Some(trigger_type), Some(state_id))?;
                self.reset_batch_state(node_id);
                return Err(EngineError::PluginContract { plugin: transform.name().to_string(),
                                                         message: plugin_error.to_string() });
            }
        };

        // Paso 4: auditoría del resultado.
        {
            let output_hash = match &result {
                TransformResult::Success { row, .. } => Some(crate::hashing::hash_value(&map_to_value(row))),
                TransformResult::SuccessMulti { rows, .. } => {
                    Some(crate::hashing::hash_value(&Value::Array(rows.iter().map(map_to_value).collect())))
                }
                TransformResult::Error { .. } => None,
            };
            let audit = result.audit_mut();
            audit.input_hash = Some(input_hash);
            audit.duration_ms = Some(duration_ms);
            audit.output_hash = output_hash;
        }

        // Paso 5: cerrar estado y lote.
        match &result {
            TransformResult::Success { row, .. } => {
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Completed { output_data: map_to_value(row),
                                                                               duration_ms })?;
                self.recorder
                    .complete_batch(batch_id, BatchStatus::Completed, Some(trigger_type), Some(state_id))?;
            }
            TransformResult::SuccessMulti { rows, .. } => {
                let output = Value::Array(rows.iter().map(map_to_value).collect());
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Completed { output_data: output, duration_ms })?;
                self.recorder
                    .complete_batch(batch_id, BatchStatus::Completed, Some(trigger_type), Some(state_id))?;
            }
            TransformResult::Error { reason, .. } => {
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Failed { error: Some(reason.clone()),
                                                                            duration_ms,
                                                                            output_hash: None })?;
                self.recorder
                    .complete_batch(batch_id, BatchStatus::Failed, Some(trigger_type), Some(state_id))?;
            }
        }

        // Paso 6: reset para el próximo lote.
        self.reset_batch_state(node_id);
        self.buffers.insert(node_id.to_string(), Vec::new());
        self.buffer_tokens.insert(node_id.to_string(), Vec::new());
        if let Some(evaluator) = self.evaluators.get_mut(node_id) {
            evaluator.reset();
        }

        Ok(FlushOutcome::Finished { result,
                                    consumed: buffered_tokens,
                                    batch_id,
                                    state_id })
    }

    fn reset_batch_state(&mut self, node_id: &str) {
        if let Some(batch_id) = self.batch_ids.remove(node_id) {
            self.member_counts.remove(&batch_id);
        }
    }

    // ===== Checkpoint =====

    /// Estado serializable de los buffers no vacíos: filas, identidad
    /// completa de tokens, contrato compartido, offsets del trigger y
    /// batch_id.
    pub fn checkpoint_state(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (node_id, rows) in &self.buffers {
            if rows.is_empty() {
                continue;
            }
            let tokens = self.buffer_tokens.get(node_id).cloned().unwrap_or_default();
            let contract_schema = tokens.first().map(|t| t.row.contract().to_schema_json());
            let trigger = self.evaluators.get(node_id).map(|e| e.checkpoint_state()).unwrap_or(Value::Null);
            out.insert(node_id.clone(),
                       serde_json::json!({
                           "rows": rows.iter().map(map_to_value).collect::<Vec<_>>(),
                           "tokens": tokens.iter().map(|t| serde_json::json!({
                               "token_id": t.token_id.to_string(),
                               "row_id": t.row_id.to_string(),
                               "branch_name": t.branch_name,
                           })).collect::<Vec<_>>(),
                           "contract": contract_schema,
                           "trigger": trigger,
                           "batch_id": self.batch_ids.get(node_id).map(|b| b.to_string()),
                       }));
        }
        Value::Object(out)
    }

    /// Restaura buffers, contratos, ordinales y offsets de trigger desde un
    /// checkpoint. Claves ausentes son corrupción; un buffer restaurado debe
    /// reproducir la próxima decisión de trigger pre-crash.
    pub fn restore_from_checkpoint(&mut self, state: &Value) -> Result<(), EngineError> {
        let entries = state.as_object()
                           .ok_or_else(|| EngineError::Corruption("aggregation checkpoint is not an object".to_string()))?;
        for (node_id, entry) in entries {
            let rows_json = entry.get("rows")
                                 .and_then(|r| r.as_array())
                                 .ok_or_else(|| EngineError::Corruption(format!("checkpoint for {node_id} missing 'rows'")))?;
            let tokens_json = entry.get("tokens")
                                   .and_then(|t| t.as_array())
                                   .ok_or_else(|| EngineError::Corruption(format!("checkpoint for {node_id} missing \
                                                                                   'tokens'")))?;
            if rows_json.len() != tokens_json.len() {
                return Err(EngineError::Corruption(format!("checkpoint for {node_id}: {} rows but {} tokens",
                                                           rows_json.len(),
                                                           tokens_json.len())));
            }
            let contract = match entry.get("contract") {
                Some(Value::Null) | None => Arc::new(SchemaContract::observed().locked()),
                Some(schema) => Arc::new(SchemaContract::from_schema_json(schema).map_err(|e| {
                                             EngineError::Corruption(format!("checkpoint contract for {node_id}: {e}"))
                                         })?),
            };

            let mut rows = Vec::with_capacity(rows_json.len());
            let mut tokens = Vec::with_capacity(tokens_json.len());
            for (row_json, token_json) in rows_json.iter().zip(tokens_json) {
                let map = value_to_map(row_json)
                    .ok_or_else(|| EngineError::Corruption(format!("checkpoint row for {node_id} is not an object")))?;
                let token_id = token_json.get("token_id")
                                         .and_then(|t| t.as_str())
                                         .and_then(|s| Uuid::parse_str(s).ok())
                                         .ok_or_else(|| EngineError::Corruption(format!("checkpoint token for {node_id} \
                                                                                         missing token_id")))?;
                let row_id = token_json.get("row_id")
                                       .and_then(|t| t.as_str())
                                       .and_then(|s| Uuid::parse_str(s).ok())
                                       .ok_or_else(|| EngineError::Corruption(format!("checkpoint token for {node_id} \
                                                                                       missing row_id")))?;
                let branch_name = token_json.get("branch_name").and_then(|b| b.as_str()).map(String::from);
                let pipeline_row = PipelineRow::from_trusted(map.clone(), Arc::clone(&contract));
                let mut info = TokenInfo::new(token_id, row_id, pipeline_row);
                info.branch_name = branch_name;
                rows.push(map);
                tokens.push(info);
            }

            if let Some(batch_id_str) = entry.get("batch_id").and_then(|b| b.as_str()) {
                let batch_id = Uuid::parse_str(batch_id_str)
                    .map_err(|_| EngineError::Corruption(format!("checkpoint batch_id for {node_id} is invalid")))?;
                self.batch_ids.insert(node_id.clone(), batch_id);
                self.member_counts.insert(batch_id, rows.len() as u32);
            }

            if let Some(trigger_state) = entry.get("trigger") {
                if !trigger_state.is_null() {
                    if let Some(evaluator) = self.evaluators.get_mut(node_id) {
                        evaluator.restore(trigger_state)?;
                    }
                }
            }

            self.buffers.insert(node_id.clone(), rows);
            self.buffer_tokens.insert(node_id.clone(), tokens);
        }
        Ok(())
    }

    /// Restaura un lote en curso como lote vigente del nodo (recuperación).
    pub fn restore_batch(&mut self, batch_id: Uuid) -> Result<(), EngineError> {
        let batch = self.recorder
                        .get_batch(batch_id)?
                        .ok_or_else(|| EngineError::AuditIntegrity(format!("batch not found: {batch_id}")))?;
        let members = self.recorder.get_batch_members(batch_id)?;
        self.batch_ids.insert(batch.aggregation_node_id.clone(), batch_id);
        self.member_counts.insert(batch_id, members.len() as u32);
        Ok(())
    }

    /// Estado de plugin restaurado (para plugins con estado propio).
    pub fn set_restored_state(&mut self, node_id: &str, state: Value) {
        self.restored_states.insert(node_id.to_string(), state);
    }

    pub fn restored_state(&self, node_id: &str) -> Option<&Value> {
        self.restored_states.get(node_id)
    }
}

fn map_to_value(map: &IndexMap<String, Value>) -> Value {
    let mut obj = serde_json::Map::new();
    for (k, v) in map {
        obj.insert(k.clone(), v.clone());
    }
    Value::Object(obj)
}

fn value_to_map(value: &Value) -> Option<IndexMap<String, Value>> {
    value.as_object().map(|obj| {
                         let mut map = IndexMap::with_capacity(obj.len());
                         for (k, v) in obj {
                             map.insert(k.clone(), v.clone());
                         }
                         map
                     })
}
