//! Recuperación: filas sin procesar y restauración de buffers.

use std::sync::Arc;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::executors::AggregationExecutor;
use crate::recorder::LandscapeRecorder;

use super::{CheckpointManager, RestoredCheckpoint};

pub struct RecoveryManager {
    recorder: Arc<LandscapeRecorder>,
    checkpoints: CheckpointManager,
}

impl RecoveryManager {
    pub fn new(recorder: Arc<LandscapeRecorder>) -> Self {
        let checkpoints = CheckpointManager::new(Arc::clone(&recorder));
        Self { recorder, checkpoints }
    }

    /// Filas del run donde ALGÚN token carece de outcome terminal que
    /// complete fila, en orden de row_index.
    ///
    /// La regla es por-token, no por-fila: una fila bifurcada con un hijo
    /// COMPLETED y otro sin outcome está SIN PROCESAR (el FORKED del padre
    /// es terminal para el token pero no completa la fila).
    pub fn get_unprocessed_rows(&self, run_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
        let rows = self.recorder.get_rows(run_id)?;
        let mut unprocessed = Vec::new();
        for row in rows {
            if !self.recorder.row_is_complete(row.row_id)? {
                unprocessed.push(row.row_id);
            }
        }
        Ok(unprocessed)
    }

    /// Tokens de una fila que aún no alcanzaron un outcome que complete
    /// fila (los subgrafos que deben re-ejecutarse).
    pub fn get_incomplete_tokens(&self, row_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
        let tokens = self.recorder.get_tokens(row_id)?;
        let mut incomplete = Vec::new();
        for token in tokens {
            let outcomes = self.recorder.get_outcomes_for_token(token.token_id)?;
            let done = outcomes.iter().any(|o| o.outcome.is_terminal());
            if !done {
                incomplete.push(token.token_id);
            }
        }
        Ok(incomplete)
    }

    /// Restaura el último checkpoint: buffers de agregación (con ordinales y
    /// offsets de trigger), lotes en curso y checkpoints de plugins.
    pub fn restore(&self,
                   run_id: Uuid,
                   aggregations: &mut AggregationExecutor)
                   -> Result<Option<RestoredCheckpoint>, EngineError> {
        let checkpoint = match self.checkpoints.latest_checkpoint(run_id)? {
            Some(cp) => cp,
            None => return Ok(None),
        };
        aggregations.restore_from_checkpoint(&checkpoint.aggregation_state)?;
        // Lotes en curso referenciados por los buffers restaurados.
        if let Some(entries) = checkpoint.aggregation_state.as_object() {
            for entry in entries.values() {
                if let Some(batch_id_str) = entry.get("batch_id").and_then(|b| b.as_str()) {
                    let batch_id = Uuid::parse_str(batch_id_str)
                        .map_err(|_| EngineError::Corruption(format!("checkpoint batch_id invalid: {batch_id_str}")))?;
                    aggregations.restore_batch(batch_id)?;
                }
            }
        }
        Ok(Some(checkpoint))
    }
}
