//! Contexto pasado a cada método de plugin.
//!
//! Porta identidad (run, state, node, token), acceso al recorder para grabar
//! llamadas externas, el contrato vigente y el checkpoint opaco para plugins
//! de lote remoto. Los executors fijan state_id/node_id antes de cada
//! llamada; los plugins jamás inventan identidad.

use auditflow_domain::SchemaContract;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::model::{CallRecord, CallStatus, CallType};
use crate::recorder::LandscapeRecorder;

/// Contexto de ejecución de plugin.
#[derive(Clone)]
pub struct PluginContext {
    pub run_id: Uuid,
    /// Estado vigente; lo fija el executor antes de invocar al plugin.
    pub state_id: Option<Uuid>,
    /// Nodo vigente; lo fija el executor antes de invocar al plugin.
    pub node_id: Option<String>,
    /// Token en proceso (None durante flush de lote).
    pub token_id: Option<Uuid>,
    /// Tokens del lote durante un flush de agregación.
    pub batch_token_ids: Option<Vec<Uuid>>,
    /// Contrato vigente de la fila/lote en proceso.
    pub contract: Option<Arc<SchemaContract>>,
    recorder: Arc<LandscapeRecorder>,
    /// Checkpoints opacos de plugins pendientes, por node_id. Compartidos
    /// entre contextos clonados para que el orchestrator los persista.
    batch_checkpoints: Arc<DashMap<String, Value>>,
}

impl PluginContext {
    pub fn new(run_id: Uuid, recorder: Arc<LandscapeRecorder>) -> Self {
        Self { run_id,
               state_id: None,
               node_id: None,
               token_id: None,
               batch_token_ids: None,
               contract: None,
               recorder,
               batch_checkpoints: Arc::new(DashMap::new()) }
    }

    pub fn recorder(&self) -> &Arc<LandscapeRecorder> {
        &self.recorder
    }

    /// Graba una llamada externa bajo el estado vigente. El call_index lo
    /// asigna el recorder de forma atómica.
    pub fn record_call(&self,
                       call_type: CallType,
                       status: CallStatus,
                       request: &Value,
                       response: Option<&Value>,
                       error: Option<Value>,
                       latency_ms: f64)
                       -> Result<CallRecord, EngineError> {
        let state_id = self.state_id
                           .ok_or_else(|| EngineError::Internal("record_call without an active state".to_string()))?;
        self.recorder.record_call(state_id, call_type, status, request, response, error, latency_ms)
    }

    // ===== Checkpoint opaco para plugins de lote remoto =====

    /// Blob de checkpoint del nodo vigente, si existe.
    pub fn get_checkpoint(&self) -> Option<Value> {
        let node_id = self.node_id.as_ref()?;
        self.batch_checkpoints.get(node_id).map(|v| v.clone())
    }

    /// Publica el checkpoint opaco del nodo vigente. Un plugin que levanta
    /// `BatchPending` DEBE haber publicado uno: es lo que permite retomar el
    /// trabajo remoto tras un reinicio.
    pub fn update_checkpoint(&self, blob: Value) -> Result<(), EngineError> {
        let node_id = self.node_id
                          .as_ref()
                          .ok_or_else(|| EngineError::Internal("update_checkpoint without an active node".to_string()))?;
        self.batch_checkpoints.insert(node_id.clone(), blob);
        Ok(())
    }

    /// Limpia el checkpoint del nodo vigente (lote remoto terminado).
    pub fn clear_checkpoint(&self) {
        if let Some(node_id) = self.node_id.as_ref() {
            self.batch_checkpoints.remove(node_id);
        }
    }

    /// Todos los checkpoints pendientes (para el snapshot del run).
    pub fn checkpoint_snapshot(&self) -> Vec<(String, Value)> {
        self.batch_checkpoints.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    /// Restaura checkpoints de plugins desde un snapshot previo.
    pub fn restore_checkpoints(&self, entries: Vec<(String, Value)>) {
        for (node_id, blob) in entries {
            self.batch_checkpoints.insert(node_id, blob);
        }
    }
}
