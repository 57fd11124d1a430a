//! Executor de sinks: un estado de nodo POR TOKEN escrito.
//!
//! Crítico: cada token que llega a un sink recibe su estado de nodo; ése es
//! el comprobante de que la fila alcanzó su terminal. El COMPLETED terminal
//! se deriva de tener un estado completed en un nodo sink.

use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::model::{ArtifactRecord, TokenInfo};
use crate::plugin::{PluginContext, SinkPlugin};
use crate::recorder::{LandscapeRecorder, StateCompletion};

pub struct SinkExecutor {
    recorder: Arc<LandscapeRecorder>,
    run_id: Uuid,
}

impl SinkExecutor {
    pub fn new(recorder: Arc<LandscapeRecorder>, run_id: Uuid) -> Self {
        Self { recorder, run_id }
    }

    /// Escribe los tokens al sink y registra exactamente un Artifact por
    /// grupo de escrituras, ligado al primer estado para linaje.
    ///
    /// `on_token_written` se invoca por token tras la escritura exitosa
    /// (checkpoint post-sink). Un fallo de escritura cierra TODOS los
    /// estados abiertos con el mismo error y se propaga.
    pub fn write(&self,
                 sink: &mut dyn SinkPlugin,
                 sink_node_id: &str,
                 tokens: &[TokenInfo],
                 ctx: &mut PluginContext,
                 step_in_pipeline: u32,
                 mut on_token_written: Option<&mut dyn FnMut(&TokenInfo)>)
                 -> Result<Option<ArtifactRecord>, EngineError> {
        if tokens.is_empty() {
            return Ok(None);
        }

        // Fronteras de auditoría y de sink: mapeos planos, nunca el par
        // fila+contrato.
        let rows: Vec<indexmap::IndexMap<String, serde_json::Value>> = tokens.iter().map(|t| t.row.to_dict()).collect();

        let mut states: Vec<(Uuid, &TokenInfo)> = Vec::with_capacity(tokens.len());
        for token in tokens {
            let state = self.recorder
                            .begin_node_state(token.token_id, sink_node_id, step_in_pipeline, 0, &token.row.to_value())?;
            states.push((state.state_id(), token));
        }

        ctx.node_id = Some(sink_node_id.to_string());
        ctx.state_id = Some(states[0].0);

        let started = Instant::now();
        let written = sink.write(&rows, ctx);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let descriptor = match written {
            Ok(descriptor) => descriptor,
            Err(plugin_error) => {
                let error_json = serde_json::json!({"exception": plugin_error.to_string(), "type": "PluginError"});
                for (state_id, _) in &states {
                    self.recorder.complete_node_state(*state_id,
                                                      StateCompletion::Failed { error: Some(error_json.clone()),
                                                                                duration_ms,
                                                                                output_hash: None })?;
                }
                return Err(EngineError::PluginContract { plugin: sink.name().to_string(),
                                                         message: plugin_error.to_string() });
            }
        };

        for (state_id, token) in &states {
            let sink_output = serde_json::json!({
                "row": token.row.to_value(),
                "artifact_path": descriptor.path_or_uri,
                "content_hash": descriptor.content_hash,
            });
            self.recorder.complete_node_state(*state_id,
                                              StateCompletion::Completed { output_data: sink_output, duration_ms })?;
        }

        let first_state = states[0].0;
        let artifact = self.recorder.register_artifact(self.run_id, first_state, sink_node_id, &descriptor)?;

        if let Some(callback) = on_token_written.as_mut() {
            for token in tokens {
                callback(token);
            }
        }

        Ok(Some(artifact))
    }
}
