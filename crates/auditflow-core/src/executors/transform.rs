//! Executor de transforms: un intento, auditoría completa alrededor.
//!
//! El reintento es responsabilidad del llamador (el orchestrator envuelve
//! con la política de retry cuando el resultado es retryable); cada intento
//! tiene su propio estado de nodo con su número de attempt.

use auditflow_domain::PipelineRow;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::model::TokenInfo;
use crate::plugin::{PluginContext, PluginError, TransformPlugin, TransformResult};
use crate::recorder::{LandscapeRecorder, StateCompletion};

/// Resultado del executor: el resultado del plugin con campos de auditoría
/// poblados, el token actualizado y el sink de error si el transform erró.
#[derive(Debug)]
pub struct TransformOutcome {
    pub result: TransformResult,
    pub updated_token: TokenInfo,
    /// None si no hubo error; "discard" o nombre de sink si el transform
    /// devolvió Error y tiene on_error configurado.
    pub error_sink: Option<String>,
    pub state_id: Uuid,
}

pub struct TransformExecutor {
    recorder: Arc<LandscapeRecorder>,
}

impl TransformExecutor {
    pub fn new(recorder: Arc<LandscapeRecorder>) -> Self {
        Self { recorder }
    }

    /// Ejecuta UN intento de un transform de fila única.
    ///
    /// - Resultado Success ⇒ estado COMPLETED y fila del token actualizada
    ///   (multi-fila deja la fila intacta; el orchestrator expande después).
    /// - Resultado Error ⇒ fallo de procesamiento legítimo: estado FAILED y
    ///   ruteo según on_error; sin on_error es un error de programación.
    /// - PluginError ⇒ bug o señal inválida en este contexto: estado FAILED
    ///   y propagación.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_transform(&self,
                             transform: &mut dyn TransformPlugin,
                             node_id: &str,
                             on_error: Option<&str>,
                             token: &TokenInfo,
                             ctx: &mut PluginContext,
                             step_in_pipeline: u32,
                             attempt: u32)
                             -> Result<TransformOutcome, EngineError> {
        let input_value = token.row.to_value();
        let input_hash = crate::hashing::hash_value(&input_value);

        let state = self.recorder
                        .begin_node_state(token.token_id, node_id, step_in_pipeline, attempt, &input_value)?;
        let state_id = state.state_id();

        // Identidad para grabación de llamadas externas del plugin.
        ctx.state_id = Some(state_id);
        ctx.node_id = Some(node_id.to_string());
        ctx.token_id = Some(token.token_id);
        ctx.contract = Some(Arc::clone(token.row.contract()));

        let started = Instant::now();
        let outcome = transform.process(token.row.clone(), ctx);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut result = match outcome {
            Ok(result) => result,
            Err(plugin_error) => {
                let error_json = serde_json::json!({
                    "exception": plugin_error.to_string(),
                    "type": "PluginError",
                });
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Failed { error: Some(error_json),
                                                                            duration_ms,
                                                                            output_hash: None })?;
                return Err(match plugin_error {
                    PluginError::Capacity { status } => EngineError::Capacity { status },
                    other => EngineError::PluginContract { plugin: transform.name().to_string(),
                                                           message: other.to_string() },
                });
            }
        };

        // Poblar campos de auditoría del resultado.
        {
            let output_hash = match &result {
                TransformResult::Success { row, .. } => {
                    Some(crate::hashing::hash_value(&map_to_value(row)))
                }
                TransformResult::SuccessMulti { rows, .. } => {
                    let value = serde_json::Value::Array(rows.iter().map(map_to_value).collect());
                    Some(crate::hashing::hash_value(&value))
                }
                TransformResult::Error { .. } => None,
            };
            let audit = result.audit_mut();
            audit.input_hash = Some(input_hash);
            audit.duration_ms = Some(duration_ms);
            audit.output_hash = output_hash;
        }

        match &result {
            TransformResult::Success { row, contract, .. } => {
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Completed { output_data: map_to_value(row),
                                                                               duration_ms })?;
                // Contrato de salida: el del resultado o, en su defecto, el
                // del token de entrada. Ninguno es un error ruidoso.
                let out_contract = contract.clone().unwrap_or_else(|| Arc::clone(token.row.contract()));
                let new_row = PipelineRow::new(row.clone(), out_contract).map_err(|e| {
                                  EngineError::PluginContract { plugin: transform.name().to_string(),
                                                                message: format!("output row violates its contract: {e}") }
                              })?;
                Ok(TransformOutcome { updated_token: token.with_row(new_row),
                                      result,
                                      error_sink: None,
                                      state_id })
            }
            TransformResult::SuccessMulti { rows, .. } => {
                let output = serde_json::Value::Array(rows.iter().map(map_to_value).collect());
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Completed { output_data: output, duration_ms })?;
                // Multi-fila: la fila del token queda intacta; el
                // orchestrator expande con tokens nuevos.
                Ok(TransformOutcome { updated_token: token.clone(),
                                      result,
                                      error_sink: None,
                                      state_id })
            }
            TransformResult::Error { reason, .. } => {
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Failed { error: Some(reason.clone()),
                                                                            duration_ms,
                                                                            output_hash: None })?;
                // on_error viene del wiring (settings); el default del
                // plugin sólo aplica si el wiring no declara nada.
                let on_error = on_error.map(String::from)
                                       .or_else(|| transform.on_error().map(String::from));
                match on_error {
                    None => Err(EngineError::PluginContract {
                        plugin: transform.name().to_string(),
                        message: format!("returned error but has no on_error configured. Either configure on_error or \
                                          fix the transform to not return errors for this input. Error: {reason}"),
                    }),
                    Some(sink) => Ok(TransformOutcome { updated_token: token.clone(),
                                                        result,
                                                        error_sink: Some(sink),
                                                        state_id }),
                }
            }
        }
    }
}

fn map_to_value(map: &indexmap::IndexMap<String, serde_json::Value>) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for (k, v) in map {
        obj.insert(k.clone(), v.clone());
    }
    serde_json::Value::Object(obj)
}
