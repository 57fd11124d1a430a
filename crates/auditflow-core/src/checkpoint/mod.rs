//! Checkpoint y recuperación.
//!
//! El checkpoint es un blob JSON canónico versionado: buffers de agregación
//! (filas + identidad completa de tokens + contrato compartido + offsets de
//! trigger + batch_id), checkpoints opacos de plugins pendientes y el último
//! token completado en sink. Tope duro de 10 MB, advertencia en 1 MB. Un
//! mismatch de versión al restaurar es fatal y se niega a continuar.
//!
//! Recuperación: una fila está sin procesar cuando ALGUNO de sus tokens
//! carece de outcome terminal que complete fila. El caso fork-parcial (un
//! hijo completo, otro crasheado) DEBE reaparecer como sin procesar: el
//! outcome FORKED del padre no completa la fila.

mod recovery;

pub use recovery::RecoveryManager;

use chrono::Utc;
use log::warn;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::constants::{CHECKPOINT_MAX_BYTES, CHECKPOINT_VERSION, CHECKPOINT_WARN_BYTES};
use crate::errors::EngineError;
use crate::hashing::to_canonical_json;
use crate::recorder::store::CheckpointRow;
use crate::recorder::LandscapeRecorder;

/// Checkpoint reconstruido desde el store.
#[derive(Debug, Clone)]
pub struct RestoredCheckpoint {
    pub sequence_number: u64,
    pub token_id: Uuid,
    pub node_id: String,
    pub aggregation_state: Value,
    pub plugin_checkpoints: Vec<(String, Value)>,
}

pub struct CheckpointManager {
    recorder: Arc<LandscapeRecorder>,
}

impl CheckpointManager {
    pub fn new(recorder: Arc<LandscapeRecorder>) -> Self {
        Self { recorder }
    }

    /// Persiste un checkpoint reanudable.
    ///
    /// `token_id`/`node_id` son la última posición completada en sink;
    /// `aggregation_state` viene de `AggregationExecutor::checkpoint_state`;
    /// `plugin_checkpoints` son los blobs opacos de plugins pendientes.
    pub fn create_checkpoint(&self,
                             run_id: Uuid,
                             token_id: Uuid,
                             node_id: &str,
                             sequence_number: u64,
                             aggregation_state: Value,
                             plugin_checkpoints: Vec<(String, Value)>)
                             -> Result<(), EngineError> {
        let payload = serde_json::json!({
            "version": CHECKPOINT_VERSION,
            "aggregations": aggregation_state,
            "plugin_checkpoints": plugin_checkpoints.iter().map(|(node, blob)| {
                serde_json::json!({"node_id": node, "blob": blob})
            }).collect::<Vec<_>>(),
        });
        let payload_json = to_canonical_json(&payload);
        let size = payload_json.len();
        if size > CHECKPOINT_MAX_BYTES {
            return Err(EngineError::CheckpointTooLarge { size,
                                                         cap: CHECKPOINT_MAX_BYTES });
        }
        if size > CHECKPOINT_WARN_BYTES {
            warn!("checkpoint payload is large: {size} bytes (warn threshold {CHECKPOINT_WARN_BYTES})");
        }
        self.recorder.store().insert_checkpoint(CheckpointRow { checkpoint_id: Uuid::new_v4().to_string(),
                                                                run_id: run_id.to_string(),
                                                                token_id: token_id.to_string(),
                                                                node_id: node_id.to_string(),
                                                                sequence_number: sequence_number as i64,
                                                                payload_json,
                                                                created_at: Utc::now() })?;
        Ok(())
    }

    /// Último checkpoint del run, parseado estricto.
    ///
    /// - Versión distinta de `CHECKPOINT_VERSION` ⇒ error fatal.
    /// - Claves ausentes ⇒ corrupción (un checkpoint válido siempre las
    ///   escribe; `null` sí puede ser un estado legítimo).
    pub fn latest_checkpoint(&self, run_id: Uuid) -> Result<Option<RestoredCheckpoint>, EngineError> {
        let row = match self.recorder.store().latest_checkpoint(&run_id.to_string())? {
            Some(row) => row,
            None => return Ok(None),
        };
        let payload: Value = serde_json::from_str(&row.payload_json)
            .map_err(|e| EngineError::Corruption(format!("checkpoint payload is not valid JSON: {e}")))?;

        let version = payload.get("version")
                             .and_then(|v| v.as_u64())
                             .ok_or_else(|| EngineError::Corruption("checkpoint missing 'version'".to_string()))?;
        if version != CHECKPOINT_VERSION as u64 {
            return Err(EngineError::CheckpointVersionMismatch { found: version as u32,
                                                                expected: CHECKPOINT_VERSION });
        }

        let aggregation_state = payload.get("aggregations")
                                       .cloned()
                                       .ok_or_else(|| EngineError::Corruption("checkpoint missing 'aggregations'".to_string()))?;
        let plugin_entries = payload.get("plugin_checkpoints")
                                    .and_then(|p| p.as_array())
                                    .ok_or_else(|| EngineError::Corruption("checkpoint missing 'plugin_checkpoints'".to_string()))?;
        let mut plugin_checkpoints = Vec::with_capacity(plugin_entries.len());
        for entry in plugin_entries {
            let node_id = entry.get("node_id")
                               .and_then(|n| n.as_str())
                               .ok_or_else(|| EngineError::Corruption("plugin checkpoint missing 'node_id'".to_string()))?;
            let blob = entry.get("blob")
                            .cloned()
                            .ok_or_else(|| EngineError::Corruption("plugin checkpoint missing 'blob'".to_string()))?;
            plugin_checkpoints.push((node_id.to_string(), blob));
        }

        let token_id = Uuid::parse_str(&row.token_id)
            .map_err(|_| EngineError::Corruption(format!("checkpoint token_id is invalid: {}", row.token_id)))?;
        let sequence_number = u64::try_from(row.sequence_number)
            .map_err(|_| EngineError::Corruption(format!("checkpoint sequence_number is negative: {}", row.sequence_number)))?;

        Ok(Some(RestoredCheckpoint { sequence_number,
                                     token_id,
                                     node_id: row.node_id,
                                     aggregation_state,
                                     plugin_checkpoints }))
    }
}
