//! S5: un lote remoto pendiente sobrevive un reinicio del proceso.
//!
//! Se simula el reinicio a nivel executor: el primer flush levanta
//! BatchPending (estado PENDING, lote executing, buffers intactos); un
//! AggregationExecutor NUEVO restaura el checkpoint y el siguiente flush
//! completa el mismo lote.

use auditflow_core::dag::{AggregationSettings, TriggerSettings};
use auditflow_core::executors::{AggregationExecutor, FlushOutcome};
use auditflow_core::model::{BatchStatus, NodeState, RowOutcome, Token, TokenInfo, TriggerType};
use auditflow_core::plugin::{PluginContext, PluginError, TransformPlugin, TransformResult};
use auditflow_core::recorder::{InMemoryAuditStore, LandscapeRecorder};
use auditflow_domain::{PipelineRow, SchemaContract};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Plugin que envía un trabajo remoto: la primera vez publica su checkpoint
/// opaco y levanta BatchPending; cuando el checkpoint dice que el trabajo
/// existe, devuelve el resultado.
struct RemoteBatchTransform;

impl TransformPlugin for RemoteBatchTransform {
    fn name(&self) -> &str {
        "remote_batch"
    }

    fn config(&self) -> Value {
        json!({})
    }

    fn is_batch_aware(&self) -> bool {
        true
    }

    fn process(&mut self, _row: PipelineRow, _ctx: &mut PluginContext) -> Result<TransformResult, PluginError> {
        Err(PluginError::Fatal("remote_batch is batch-only".to_string()))
    }

    fn process_batch(&mut self, rows: Vec<PipelineRow>, ctx: &mut PluginContext) -> Result<TransformResult, PluginError> {
        match ctx.get_checkpoint() {
            None => {
                // Trabajo enviado; el job id es el checkpoint opaco.
                ctx.update_checkpoint(json!({"job_id": "job-42", "submitted": rows.len()}))
                   .map_err(|e| PluginError::Fatal(e.to_string()))?;
                Err(PluginError::BatchPending)
            }
            Some(checkpoint) => {
                // El trabajo remoto terminó: una fila resumen.
                let mut out = IndexMap::new();
                out.insert("job_id".to_string(), checkpoint["job_id"].clone());
                out.insert("rows_processed".to_string(), Value::from(rows.len() as u64));
                ctx.clear_checkpoint();
                Ok(TransformResult::success(out))
            }
        }
    }
}

fn seed_tokens(recorder: &Arc<LandscapeRecorder>, run_id: Uuid, count: usize) -> Vec<TokenInfo> {
    let contract = Arc::new(SchemaContract::observed().locked());
    (0..count).map(|i| {
                  let row = recorder.create_row(run_id, "source_inline_x", i as u64, &json!({"i": i})).unwrap();
                  let token = Token { token_id: Uuid::new_v4(),
                                      row_id: row.row_id,
                                      fork_group_id: None,
                                      join_group_id: None,
                                      expand_group_id: None,
                                      branch_name: None,
                                      step_in_pipeline: Some(1),
                                      created_at: chrono::Utc::now() };
                  recorder.insert_token(&token).unwrap();
                  let mut data = IndexMap::new();
                  data.insert("i".to_string(), Value::from(i as u64));
                  TokenInfo::new(token.token_id, token.row_id, PipelineRow::from_trusted(data, Arc::clone(&contract)))
              })
              .collect()
}

fn agg_settings() -> HashMap<String, AggregationSettings> {
    let mut map = HashMap::new();
    map.insert("aggregation_remote_abc".to_string(),
               AggregationSettings { name: "remote".to_string(),
                                     plugin: "remote_batch".to_string(),
                                     options: json!({}),
                                     input: "raw_rows".to_string(),
                                     on_success: Some("output".to_string()),
                                     trigger: TriggerSettings { count: Some(2),
                                                                timeout_seconds: None,
                                                                condition: None } });
    map
}

#[test]
fn batch_pending_survives_restart_and_completes() {
    let recorder = Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())));
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    let node_id = "aggregation_remote_abc";
    recorder.register_node(run.run_id, node_id, auditflow_core::model::NodeKind::Aggregation, "remote_batch",
                           "1.0.0", json!({}), auditflow_core::model::Determinism::ExternalCall, None, None, Some(1))
            .unwrap();

    let tokens = seed_tokens(&recorder, run.run_id, 2);
    let mut plugin = RemoteBatchTransform;
    let ctx = PluginContext::new(run.run_id, Arc::clone(&recorder));

    // --- Proceso 1: buffer + flush que queda pendiente ---
    let mut agg = AggregationExecutor::new(Arc::clone(&recorder), run.run_id, &agg_settings()).unwrap();
    for token in &tokens {
        agg.buffer_row(node_id, token).unwrap();
    }
    assert!(agg.should_flush(node_id));
    let batch_id = agg.batch_id(node_id).unwrap();

    let mut ctx1 = ctx.clone();
    let flush = agg.execute_flush(node_id, &mut plugin, &mut ctx1, 1, TriggerType::Count).unwrap();
    let state_id = match flush {
        FlushOutcome::Pending { batch_id: pending_batch, state_id } => {
            assert_eq!(pending_batch, batch_id);
            state_id
        }
        other => panic!("expected pending flush, got {other:?}"),
    };

    // Estado PENDING, lote executing con el estado vinculado, buffer intacto.
    let state = recorder.get_node_state(state_id).unwrap();
    assert!(matches!(state, NodeState::Pending { .. }));
    let batch = recorder.get_batch(batch_id).unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Executing);
    assert_eq!(batch.state_id, Some(state_id));
    assert_eq!(agg.buffer_count(node_id), 2);

    // Snapshot como lo haría el checkpoint del run.
    let agg_snapshot = agg.checkpoint_state();
    let plugin_snapshot = ctx1.checkpoint_snapshot();
    assert_eq!(plugin_snapshot.len(), 1, "pending plugin must expose its checkpoint");

    // --- Proceso 2 (post-crash): executor nuevo + restauración ---
    let mut restored = AggregationExecutor::new(Arc::clone(&recorder), run.run_id, &agg_settings()).unwrap();
    restored.restore_from_checkpoint(&agg_snapshot).unwrap();
    restored.restore_batch(batch_id).unwrap();
    assert_eq!(restored.buffer_count(node_id), 2);
    assert_eq!(restored.batch_id(node_id), Some(batch_id));

    let ctx2 = PluginContext::new(run.run_id, Arc::clone(&recorder));
    ctx2.restore_checkpoints(plugin_snapshot);

    // Identidad de tokens restaurada del checkpoint.
    let snapshot_tokens: Vec<String> = agg_snapshot[node_id]["tokens"].as_array()
                                                                      .unwrap()
                                                                      .iter()
                                                                      .map(|t| t["token_id"].as_str().unwrap().to_string())
                                                                      .collect();
    let original_tokens: Vec<String> = tokens.iter().map(|t| t.token_id.to_string()).collect();
    assert_eq!(snapshot_tokens, original_tokens);

    // El trigger restaurado reproduce la decisión pre-crash: ya disparó.
    assert!(restored.should_flush(node_id));

    let mut plugin2 = RemoteBatchTransform;
    let mut ctx2 = ctx2;
    let flush = restored.execute_flush(node_id, &mut plugin2, &mut ctx2, 1, TriggerType::Count).unwrap();
    match flush {
        FlushOutcome::Finished { result, consumed, batch_id: finished_batch, .. } => {
            assert_eq!(finished_batch, batch_id);
            assert_eq!(consumed.len(), 2);
            match result {
                TransformResult::Success { row, .. } => {
                    assert_eq!(row["job_id"], json!("job-42"));
                    assert_eq!(row["rows_processed"], json!(2));
                }
                other => panic!("expected success, got {other:?}"),
            }
            for token in &consumed {
                recorder.record_token_outcome(run.run_id, token.token_id, RowOutcome::ConsumedInBatch, None,
                                              Some(batch_id), None, None, None)
                        .unwrap();
            }
        }
        other => panic!("expected finished flush, got {other:?}"),
    }

    let batch = recorder.get_batch(batch_id).unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    // Los miembros del lote conservan sus ordinales originales.
    let members = recorder.get_batch_members(batch_id).unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].ordinal, 0);
    assert_eq!(members[1].ordinal, 1);
}
