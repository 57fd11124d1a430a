//! Executor de gates: plugin y config-driven.
//!
//! Crítico: el estado del nodo SIEMPRE cierra COMPLETED para evaluaciones
//! exitosas. El estado terminal (ROUTED, FORKED) se DERIVA de
//! routing_events/token_parents, no se guarda en node_states.status.
//!
//! Resolución de continue: cuando un gate emite `continue` y existe
//! exactamente un edge hacia un destino de procesamiento, se rutea ahí; con
//! más de uno, falla cerrado.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::dag::{ExecutionGraph, GateSettings, RouteDestination};
use crate::errors::EngineError;
use crate::expr::ExpressionParser;
use crate::model::{RoutingAction, RoutingMode, TokenInfo};
use crate::plugin::{GatePlugin, GateResult, PluginContext};
use crate::recorder::{LandscapeRecorder, RoutingSpec, StateCompletion};
use crate::tokens::TokenManager;

/// A dónde sigue el token después del gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDestination {
    /// Continuar al único destino de procesamiento (fallthrough).
    Continue,
    /// Rutear a un sink con la etiqueta dada.
    Sink { sink_name: String, label: String },
    /// Saltar a un nodo de procesamiento concreto.
    Jump(String),
    /// El token fue bifurcado; los hijos siguen en `child_tokens`.
    Forked,
}

#[derive(Debug)]
pub struct GateOutcome {
    pub result: GateResult,
    pub updated_token: TokenInfo,
    pub child_tokens: Vec<TokenInfo>,
    pub destination: GateDestination,
    pub state_id: Uuid,
}

pub struct GateExecutor {
    recorder: Arc<LandscapeRecorder>,
    /// (node_id, label) → edge_id de los edges registrados del run.
    edge_map: HashMap<(String, String), String>,
}

impl GateExecutor {
    pub fn new(recorder: Arc<LandscapeRecorder>, edge_map: HashMap<(String, String), String>) -> Self {
        Self { recorder, edge_map }
    }

    fn edge_for(&self, node_id: &str, label: &str) -> Result<String, EngineError> {
        self.edge_map
            .get(&(node_id.to_string(), label.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::MissingEdge { node_id: node_id.to_string(),
                                                      label: label.to_string() })
    }

    fn record_single(&self, state_id: Uuid, node_id: &str, label: &str, reason: Option<&serde_json::Value>)
                     -> Result<(), EngineError> {
        let edge_id = self.edge_for(node_id, label)?;
        self.recorder.record_routing_event(state_id, &edge_id, RoutingMode::Move, reason)?;
        Ok(())
    }

    fn record_fork(&self,
                   state_id: Uuid,
                   node_id: &str,
                   branches: &[String],
                   reason: Option<&serde_json::Value>)
                   -> Result<(), EngineError> {
        let mut routes = Vec::with_capacity(branches.len());
        for branch in branches {
            routes.push(RoutingSpec { edge_id: self.edge_for(node_id, branch)?,
                                      mode: RoutingMode::Copy });
        }
        self.recorder.record_routing_events(state_id, &routes, reason)?;
        Ok(())
    }

    /// Gate config-driven: evalúa la expresión compilada contra la fila y
    /// resuelve el label por el mapa de rutas del grafo.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_config_gate(&self,
                               settings: &GateSettings,
                               parser: &ExpressionParser,
                               node_id: &str,
                               graph: &ExecutionGraph,
                               token: &TokenInfo,
                               ctx: &mut PluginContext,
                               step_in_pipeline: u32,
                               token_manager: &TokenManager)
                               -> Result<GateOutcome, EngineError> {
        let input_value = token.row.to_value();
        let input_hash = crate::hashing::hash_value(&input_value);
        let state = self.recorder
                        .begin_node_state(token.token_id, node_id, step_in_pipeline, 0, &input_value)?;
        let state_id = state.state_id();
        ctx.state_id = Some(state_id);
        ctx.node_id = Some(node_id.to_string());
        ctx.token_id = Some(token.token_id);

        let started = Instant::now();
        let evaluated = parser.evaluate(&token.row.to_dict());
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let eval_result = match evaluated {
            Ok(v) => v,
            Err(e) => {
                let error_json = serde_json::json!({"exception": e.to_string(), "type": "ExpressionError"});
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Failed { error: Some(error_json),
                                                                            duration_ms,
                                                                            output_hash: None })?;
                return Err(EngineError::Config(format!("gate '{}': {e}", settings.name)));
            }
        };

        // Bool → "true"/"false"; string → label directo.
        let route_label = match &eval_result {
            serde_json::Value::Bool(b) => if *b { "true".to_string() } else { "false".to_string() },
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let destination = match graph.resolve_route(node_id, &route_label) {
            Some(dest) => dest.clone(),
            None => {
                let error_json = serde_json::json!({
                    "exception": format!("Route label '{route_label}' not found in routes config"),
                    "type": "RouteError",
                });
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Failed { error: Some(error_json),
                                                                            duration_ms,
                                                                            output_hash: None })?;
                return Err(EngineError::Config(format!(
                    "gate '{}' condition returned '{route_label}' which is not in routes: {:?}",
                    settings.name,
                    settings.routes.keys().collect::<Vec<_>>()
                )));
            }
        };

        let reason = serde_json::json!({"condition": settings.condition, "result": route_label});
        let mut child_tokens = Vec::new();

        let gate_destination = match &destination {
            RouteDestination::Continue => {
                // Continue explícito queda auditado como evento sobre el
                // edge de fallthrough.
                graph.continue_target(node_id)?;
                self.record_single(state_id, node_id, "continue", Some(&reason))?;
                GateDestination::Continue
            }
            RouteDestination::Fork => {
                let branches = settings.fork_to
                                       .clone()
                                       .ok_or_else(|| EngineError::Config(format!("gate '{}' routes to fork without \
                                                                                   fork_to",
                                                                                  settings.name)))?;
                self.record_fork(state_id, node_id, &branches, Some(&reason))?;
                child_tokens = token_manager.fork_token(token, &branches, step_in_pipeline, &token.row)?;
                GateDestination::Forked
            }
            RouteDestination::Sink(sink_name) => {
                self.record_single(state_id, node_id, &route_label, Some(&reason))?;
                GateDestination::Sink { sink_name: sink_name.clone(),
                                        label: route_label.clone() }
            }
            RouteDestination::ProcessingNode(target) => {
                self.record_single(state_id, node_id, &route_label, Some(&reason))?;
                GateDestination::Jump(target.clone())
            }
        };

        // Cierre COMPLETED siempre: el terminal se deriva del ruteo.
        self.recorder.complete_node_state(state_id,
                                          StateCompletion::Completed { output_data: input_value, duration_ms })?;

        let mut result = GateResult::new(token.row.to_dict(), RoutingAction::route_with_reason(&route_label, reason));
        result.audit.input_hash = Some(input_hash.clone());
        result.audit.output_hash = Some(input_hash);
        result.audit.duration_ms = Some(duration_ms);

        Ok(GateOutcome { result,
                         updated_token: token.clone(),
                         child_tokens,
                         destination: gate_destination,
                         state_id })
    }

    /// Gate basado en plugin: el plugin emite la acción; el mapa de rutas
    /// resuelve labels; fork crea hijos vía token manager.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_gate(&self,
                        gate: &mut dyn GatePlugin,
                        node_id: &str,
                        graph: &ExecutionGraph,
                        token: &TokenInfo,
                        ctx: &mut PluginContext,
                        step_in_pipeline: u32,
                        token_manager: &TokenManager)
                        -> Result<GateOutcome, EngineError> {
        let input_value = token.row.to_value();
        let input_hash = crate::hashing::hash_value(&input_value);
        let state = self.recorder
                        .begin_node_state(token.token_id, node_id, step_in_pipeline, 0, &input_value)?;
        let state_id = state.state_id();
        ctx.state_id = Some(state_id);
        ctx.node_id = Some(node_id.to_string());
        ctx.token_id = Some(token.token_id);
        ctx.contract = Some(Arc::clone(token.row.contract()));

        let started = Instant::now();
        let evaluated = gate.evaluate(token.row.clone(), ctx);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut result = match evaluated {
            Ok(result) => result,
            Err(plugin_error) => {
                let error_json = serde_json::json!({"exception": plugin_error.to_string(), "type": "PluginError"});
                self.recorder.complete_node_state(state_id,
                                                  StateCompletion::Failed { error: Some(error_json),
                                                                            duration_ms,
                                                                            output_hash: None })?;
                return Err(EngineError::PluginContract { plugin: gate.name().to_string(),
                                                         message: plugin_error.to_string() });
            }
        };

        let output_value = map_to_value(&result.row);
        result.audit.input_hash = Some(input_hash);
        result.audit.output_hash = Some(crate::hashing::hash_value(&output_value));
        result.audit.duration_ms = Some(duration_ms);

        let mut child_tokens = Vec::new();
        let destination = match result.action.clone() {
            RoutingAction::Continue { reason } => {
                graph.continue_target(node_id)?;
                self.record_single(state_id, node_id, "continue", reason.as_ref())?;
                GateDestination::Continue
            }
            RoutingAction::Route { label, reason, .. } => match graph.resolve_route(node_id, &label) {
                None => {
                    return Err(EngineError::MissingEdge { node_id: node_id.to_string(), label });
                }
                Some(RouteDestination::Continue) => {
                    graph.continue_target(node_id)?;
                    self.record_single(state_id, node_id, "continue", reason.as_ref())?;
                    GateDestination::Continue
                }
                Some(RouteDestination::Sink(sink_name)) => {
                    self.record_single(state_id, node_id, &label, reason.as_ref())?;
                    GateDestination::Sink { sink_name: sink_name.clone(), label }
                }
                Some(RouteDestination::ProcessingNode(target)) => {
                    self.record_single(state_id, node_id, &label, reason.as_ref())?;
                    GateDestination::Jump(target.clone())
                }
                Some(RouteDestination::Fork) => {
                    return Err(EngineError::PluginContract {
                        plugin: gate.name().to_string(),
                        message: format!("route('{label}') resolved to fork; use fork_to_paths for forking"),
                    });
                }
            },
            RoutingAction::ForkToPaths { branches, reason } => {
                self.record_fork(state_id, node_id, &branches, reason.as_ref())?;
                child_tokens = token_manager.fork_token(token, &branches, step_in_pipeline, &token.row)?;
                GateDestination::Forked
            }
        };

        self.recorder.complete_node_state(state_id,
                                          StateCompletion::Completed { output_data: output_value, duration_ms })?;

        let contract = result.contract.clone().unwrap_or_else(|| Arc::clone(token.row.contract()));
        let new_row = auditflow_domain::PipelineRow::new(result.row.clone(), contract).map_err(|e| {
                          EngineError::PluginContract { plugin: gate.name().to_string(),
                                                        message: format!("gate output row violates its contract: {e}") }
                      })?;

        Ok(GateOutcome { updated_token: token.with_row(new_row),
                         result,
                         child_tokens,
                         destination,
                         state_id })
    }
}

fn map_to_value(map: &indexmap::IndexMap<String, serde_json::Value>) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for (k, v) in map {
        obj.insert(k.clone(), v.clone());
    }
    serde_json::Value::Object(obj)
}
