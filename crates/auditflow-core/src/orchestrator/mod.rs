//! Orchestrator: el driver del run.
//!
//! Por cada fila del source: registro de fila + token con
//! step_in_pipeline=1, y recorrido de los nodos de procesamiento en orden
//! topológico despachando al executor correspondiente. Al agotarse el
//! source: flush de agregaciones con trigger end_of_source, espera acotada
//! de lotes pendientes, vencimientos de coalesce y cierre del run.
//!
//! El driver es un hilo lógico único; el paralelismo por fila (plugins
//! pipelined) vive en `pool` y nunca retiene un lock de auditoría a través
//! de un punto de suspensión.

use auditflow_domain::{PipelineRow, SchemaContract};
use indexmap::IndexMap;
use log::{debug, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, RecoveryManager};
use crate::coalesce::{CoalesceEngine, CoalesceOutcome};
use crate::dag::{
    build_execution_graph, AggregationSettings, CheckpointFrequency, CheckpointSettings, CoalesceSettings,
    ConcurrencySettings, ExecutionGraph, GateSettings, NodeDescriptor, RetrySettings, SourceSettings, TransformSettings,
};
use crate::errors::EngineError;
use crate::executors::{
    AggregationExecutor, FlushOutcome, GateDestination, GateExecutor, SinkExecutor, TransformExecutor,
};
use crate::expr::ExpressionParser;
use crate::hashing::hash_value;
use crate::model::{NodeKind, RowOutcome, RunStatus, TokenInfo, TriggerType};
use crate::plugin::{PluginContext, SinkPlugin, SourcePlugin, TransformPlugin, TransformResult};
use crate::recorder::LandscapeRecorder;
use crate::replay::{compare_runs, VerifyReport};
use crate::tokens::TokenManager;

/// Modo de ejecución del run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Live,
    Replay,
    Verify,
}

/// Settings del run que no son wiring del grafo.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub checkpoint: CheckpointSettings,
    pub retry: RetrySettings,
    pub concurrency: ConcurrencySettings,
    pub run_mode: RunMode,
    pub replay_source_run_id: Option<Uuid>,
    /// Espera acotada de lotes pendientes al finalizar (segundos).
    pub pending_wait_seconds: f64,
    pub pending_poll_seconds: f64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self { checkpoint: CheckpointSettings::default(),
               retry: RetrySettings::default(),
               concurrency: ConcurrencySettings::default(),
               run_mode: RunMode::Live,
               replay_source_run_id: None,
               pending_wait_seconds: 60.0,
               pending_poll_seconds: 0.25 }
    }
}

/// Definición completa del pipeline: plugins + wiring.
pub struct PipelineDefinition {
    pub source: Box<dyn SourcePlugin>,
    pub source_settings: SourceSettings,
    pub transforms: Vec<(TransformSettings, Box<dyn TransformPlugin>)>,
    pub sinks: IndexMap<String, Box<dyn SinkPlugin>>,
    pub aggregations: Vec<(AggregationSettings, Box<dyn TransformPlugin>)>,
    pub gates: Vec<GateSettings>,
    pub coalesces: Vec<CoalesceSettings>,
}

impl PipelineDefinition {
    /// Compila el grafo desde los plugins y el wiring.
    pub fn build_graph(&self) -> Result<ExecutionGraph, EngineError> {
        let source_desc = NodeDescriptor { plugin_name: self.source.name().to_string(),
                                           plugin_version: self.source.plugin_version().to_string(),
                                           config: self.source.config(),
                                           determinism: self.source.determinism(),
                                           input_schema: None,
                                           output_schema: self.source
                                                              .output_contract()
                                                              .map(|c| c.to_schema_json()) };
        let transform_descs: Vec<(TransformSettings, NodeDescriptor)> =
            self.transforms
                .iter()
                .map(|(settings, plugin)| {
                    (settings.clone(),
                     NodeDescriptor { plugin_name: plugin.name().to_string(),
                                      plugin_version: plugin.plugin_version().to_string(),
                                      config: plugin.config(),
                                      determinism: plugin.determinism(),
                                      input_schema: plugin.input_contract().map(|c| c.to_schema_json()),
                                      output_schema: plugin.output_contract().map(|c| c.to_schema_json()) })
                })
                .collect();
        let sink_descs: IndexMap<String, NodeDescriptor> =
            self.sinks
                .iter()
                .map(|(name, plugin)| {
                    (name.clone(),
                     NodeDescriptor { plugin_name: plugin.name().to_string(),
                                      plugin_version: plugin.plugin_version().to_string(),
                                      config: plugin.config(),
                                      determinism: plugin.determinism(),
                                      input_schema: plugin.input_contract().map(|c| c.to_schema_json()),
                                      output_schema: None })
                })
                .collect();
        let agg_descs: Vec<(AggregationSettings, NodeDescriptor)> =
            self.aggregations
                .iter()
                .map(|(settings, plugin)| {
                    (settings.clone(),
                     NodeDescriptor { plugin_name: plugin.name().to_string(),
                                      plugin_version: plugin.plugin_version().to_string(),
                                      config: plugin.config(),
                                      determinism: plugin.determinism(),
                                      input_schema: plugin.input_contract().map(|c| c.to_schema_json()),
                                      output_schema: plugin.output_contract().map(|c| c.to_schema_json()) })
                })
                .collect();
        let graph = build_execution_graph(&source_desc,
                                          &self.source_settings,
                                          &transform_descs,
                                          &sink_descs,
                                          &agg_descs,
                                          &self.gates,
                                          &self.coalesces)?;
        Ok(graph)
    }

    /// JSON de settings para el registro del run (las options ya llegan con
    /// secretos fingerprinteados desde la capa de configuración).
    fn settings_json(&self, settings: &RunSettings) -> Value {
        serde_json::json!({
            "engine_version": crate::constants::ENGINE_VERSION,
            "datasource": {"plugin": self.source.name(), "options": self.source.config()},
            "sinks": self.sinks.keys().collect::<Vec<_>>(),
            "transforms": self.transforms.iter().map(|(s, _)| &s.name).collect::<Vec<_>>(),
            "aggregations": self.aggregations.iter().map(|(s, _)| &s.name).collect::<Vec<_>>(),
            "gates": self.gates.iter().map(|g| &g.name).collect::<Vec<_>>(),
            "coalesce": self.coalesces.iter().map(|c| &c.name).collect::<Vec<_>>(),
            "run_mode": settings.run_mode,
            "replay_source_run_id": settings.replay_source_run_id.map(|r| r.to_string()),
        })
    }
}

/// Resumen devuelto al finalizar.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub rows_read: u64,
    pub verify: Option<VerifyReport>,
}

pub struct Orchestrator {
    definition: PipelineDefinition,
    settings: RunSettings,
    recorder: Arc<LandscapeRecorder>,
}

impl Orchestrator {
    pub fn new(definition: PipelineDefinition, settings: RunSettings, recorder: Arc<LandscapeRecorder>) -> Self {
        Self { definition,
               settings,
               recorder }
    }

    /// Corre el pipeline de punta a punta en un run nuevo.
    pub fn run(self) -> Result<RunSummary, EngineError> {
        if matches!(self.settings.run_mode, RunMode::Replay | RunMode::Verify)
           && self.settings.replay_source_run_id.is_none()
        {
            return Err(EngineError::Config("replay_source_run_id is required when run_mode is replay or verify".to_string()));
        }
        self.settings.checkpoint.validate()?;

        let graph = self.definition.build_graph()?;
        let settings_json = self.definition.settings_json(&self.settings);
        let config_hash = hash_value(&settings_json);
        let run = self.recorder.begin_run(&config_hash, settings_json)?;

        let mut engine = RunEngine::build(run.run_id, graph, self.definition, self.settings, self.recorder, false)?;
        engine.register_graph()?;
        engine.start_plugins()?;
        let result = engine.drive(0);
        engine.finish(result)
    }

    /// Reanuda un run fallido desde su último checkpoint.
    ///
    /// Restaura buffers de agregación y checkpoints de plugins, re-ejecuta
    /// únicamente los subgrafos de tokens sin terminal y retoma la lectura
    /// del source en la primera fila nunca leída. Requiere payload store
    /// (los datos fuente se releen del landscape).
    pub fn resume(self, run_id: Uuid) -> Result<RunSummary, EngineError> {
        let graph = self.definition.build_graph()?;
        let run = self.recorder
                      .get_run(run_id)?
                      .ok_or_else(|| EngineError::Config(format!("cannot resume unknown run {run_id}")))?;
        debug!("resume run_id={run_id} prior_status={}", run.status.as_str());

        let mut engine = RunEngine::build(run_id, graph, self.definition, self.settings, self.recorder, true)?;
        engine.start_plugins()?;

        let recovery = RecoveryManager::new(Arc::clone(&engine.recorder));
        if let Some(checkpoint) = recovery.restore(run_id, &mut engine.agg_exec)? {
            engine.ctx.restore_checkpoints(checkpoint.plugin_checkpoints.clone());
            engine.checkpoint_seq = checkpoint.sequence_number + 1;
        }
        let buffered: HashSet<Uuid> = engine.agg_exec_buffered_tokens();

        // Re-ejecutar sólo los subgrafos de tokens incompletos.
        let unprocessed = recovery.get_unprocessed_rows(run_id)?;
        for row_id in unprocessed {
            engine.replay_row(row_id, &recovery, &buffered)?;
        }

        // Retomar la lectura del source después de la última fila conocida.
        let skip = engine.recorder.get_rows(run_id)?.len() as u64;
        let result = engine.drive(skip);
        engine.finish(result)
    }
}

/// Estado interno de un run en ejecución.
struct RunEngine {
    run_id: Uuid,
    graph: ExecutionGraph,
    recorder: Arc<LandscapeRecorder>,
    settings: RunSettings,
    source: Box<dyn SourcePlugin>,
    source_settings: SourceSettings,
    source_contract: Arc<SchemaContract>,
    /// node_id → (wiring, plugin).
    transforms: HashMap<String, (TransformSettings, Box<dyn TransformPlugin>)>,
    /// node_id → (wiring, plugin batch-aware).
    agg_plugins: HashMap<String, (AggregationSettings, Box<dyn TransformPlugin>)>,
    /// nombre de sink → plugin.
    sinks: HashMap<String, Box<dyn SinkPlugin>>,
    /// node_id de sink → nombre de sink.
    sink_names: HashMap<String, String>,
    /// node_id → (settings, expresión compilada una vez).
    gates: HashMap<String, (GateSettings, ExpressionParser)>,
    transform_exec: TransformExecutor,
    gate_exec: GateExecutor,
    agg_exec: AggregationExecutor,
    sink_exec: SinkExecutor,
    coalesce: CoalesceEngine,
    token_manager: TokenManager,
    checkpoints: CheckpointManager,
    ctx: PluginContext,
    rows_read: u64,
    rows_since_checkpoint: u64,
    checkpoint_seq: u64,
    last_sink_token: Option<(Uuid, String)>,
    /// node_ids de agregaciones con lote pendiente (BatchPending).
    pending_batches: HashMap<String, TriggerType>,
    resumed: bool,
}

impl RunEngine {
    fn build(run_id: Uuid,
             graph: ExecutionGraph,
             definition: PipelineDefinition,
             settings: RunSettings,
             recorder: Arc<LandscapeRecorder>,
             resumed: bool)
             -> Result<Self, EngineError> {
        let PipelineDefinition { source,
                                 source_settings,
                                 transforms,
                                 sinks,
                                 aggregations,
                                 gates,
                                 coalesces } = definition;

        let source_contract = source.output_contract()
                                    .unwrap_or_else(|| Arc::new(SchemaContract::observed().locked()));

        let mut transform_map = HashMap::new();
        for (ts, plugin) in transforms {
            let node_id = graph.transform_ids()
                               .get(&ts.name)
                               .cloned()
                               .ok_or_else(|| EngineError::Internal(format!("transform '{}' missing from graph", ts.name)))?;
            transform_map.insert(node_id, (ts, plugin));
        }

        let mut agg_map = HashMap::new();
        let mut agg_settings_by_node = HashMap::new();
        for (as_, plugin) in aggregations {
            let node_id = graph.aggregation_ids()
                               .get(&as_.name)
                               .cloned()
                               .ok_or_else(|| EngineError::Internal(format!("aggregation '{}' missing from graph", as_.name)))?;
            agg_settings_by_node.insert(node_id.clone(), as_.clone());
            agg_map.insert(node_id, (as_, plugin));
        }

        let mut sink_map = HashMap::new();
        let mut sink_names = HashMap::new();
        for (name, plugin) in sinks {
            let node_id = graph.sink_id(&name)
                               .cloned()
                               .ok_or_else(|| EngineError::Internal(format!("sink '{name}' missing from graph")))?;
            sink_names.insert(node_id, name.clone());
            sink_map.insert(name, plugin);
        }

        let mut gate_map = HashMap::new();
        for gs in gates {
            let node_id = graph.gate_ids()
                               .get(&gs.name)
                               .cloned()
                               .ok_or_else(|| EngineError::Internal(format!("gate '{}' missing from graph", gs.name)))?;
            let parser = ExpressionParser::compile(&gs.condition).map_err(EngineError::from)?;
            gate_map.insert(node_id, (gs, parser));
        }

        let mut coalesce_settings = HashMap::new();
        let mut coalesce_schemas = HashMap::new();
        for cs in coalesces {
            let node_id = graph.coalesce_ids()
                               .get(&cs.name)
                               .cloned()
                               .ok_or_else(|| EngineError::Internal(format!("coalesce '{}' missing from graph", cs.name)))?;
            coalesce_schemas.insert(node_id.clone(), graph.node(&node_id)?.schema.clone());
            coalesce_settings.insert(node_id, cs);
        }

        // Mapa (node, label) → edge_id con los ids deterministas que el
        // recorder asignará al registrar (mismo contenido ⇒ mismo id).
        let mut edge_map = HashMap::new();
        for edge in graph.edges() {
            let identity = serde_json::json!({
                "from": edge.from, "to": edge.to, "label": edge.label, "mode": edge.mode.as_str(),
            });
            let edge_id = format!("edge_{}", &crate::hashing::hash_str(&crate::hashing::to_canonical_json(&identity))[..12]);
            edge_map.insert((edge.from.clone(), edge.label.clone()), edge_id);
        }

        let agg_exec = AggregationExecutor::new(Arc::clone(&recorder), run_id, &agg_settings_by_node)?;
        let ctx = PluginContext::new(run_id, Arc::clone(&recorder));

        Ok(Self { run_id,
                  recorder: Arc::clone(&recorder),
                  settings,
                  source,
                  source_settings,
                  source_contract,
                  transforms: transform_map,
                  agg_plugins: agg_map,
                  sinks: sink_map,
                  sink_names,
                  gates: gate_map,
                  transform_exec: TransformExecutor::new(Arc::clone(&recorder)),
                  gate_exec: GateExecutor::new(Arc::clone(&recorder), edge_map),
                  agg_exec,
                  sink_exec: SinkExecutor::new(Arc::clone(&recorder), run_id),
                  coalesce: CoalesceEngine::new(coalesce_settings, coalesce_schemas),
                  token_manager: TokenManager::new(Arc::clone(&recorder), run_id),
                  checkpoints: CheckpointManager::new(recorder),
                  ctx,
                  graph,
                  rows_read: 0,
                  rows_since_checkpoint: 0,
                  checkpoint_seq: 0,
                  last_sink_token: None,
                  pending_batches: HashMap::new(),
                  resumed })
    }

    /// Registra nodos y edges del grafo en el landscape.
    fn register_graph(&self) -> Result<(), EngineError> {
        for info in self.graph.nodes() {
            self.recorder.register_node(self.run_id,
                                        &info.node_id,
                                        info.kind,
                                        &info.plugin_name,
                                        &info.plugin_version,
                                        info.config.clone(),
                                        info.determinism,
                                        None,
                                        info.schema.clone(),
                                        info.sequence)?;
        }
        for edge in self.graph.edges() {
            self.recorder.register_edge(self.run_id, &edge.from, &edge.to, &edge.label, edge.mode)?;
        }
        Ok(())
    }

    fn start_plugins(&mut self) -> Result<(), EngineError> {
        let mut ctx = self.ctx.clone();
        self.source.on_start(&mut ctx).map_err(|e| EngineError::PluginContract { plugin: self.source.name().to_string(),
                                                                                 message: e.to_string() })?;
        for (_, (settings, plugin)) in self.transforms.iter_mut() {
            plugin.on_start(&mut ctx).map_err(|e| EngineError::PluginContract { plugin: settings.name.clone(),
                                                                                message: e.to_string() })?;
        }
        for (name, plugin) in self.sinks.iter_mut() {
            plugin.on_start(&mut ctx).map_err(|e| EngineError::PluginContract { plugin: name.clone(),
                                                                                message: e.to_string() })?;
        }
        Ok(())
    }

    fn close_plugins(&mut self) {
        self.source.close();
        for (_, (_, plugin)) in self.transforms.iter_mut() {
            plugin.close();
        }
        for (_, (_, plugin)) in self.agg_plugins.iter_mut() {
            plugin.close();
        }
        for (_, plugin) in self.sinks.iter_mut() {
            plugin.close();
        }
    }

    fn agg_exec_buffered_tokens(&self) -> HashSet<Uuid> {
        match self.agg_exec.checkpoint_state().as_object() {
            Some(entries) => entries.values()
                                    .filter_map(|e| e.get("tokens").and_then(|t| t.as_array()))
                                    .flatten()
                                    .filter_map(|t| t.get("token_id").and_then(|id| id.as_str()))
                                    .filter_map(|s| Uuid::parse_str(s).ok())
                                    .collect(),
            None => HashSet::new(),
        }
    }

    /// Bucle principal: lee el source, crea fila + token y procesa.
    fn drive(&mut self, skip_rows: u64) -> Result<(), EngineError> {
        let source_node_id = self.graph.source_id().to_string();
        let mut index: u64 = 0;

        loop {
            let next = self.source.read().map_err(|e| EngineError::PluginContract {
                plugin: self.source.name().to_string(),
                message: e.to_string(),
            })?;
            let Some(raw) = next else { break };
            let row_index = index;
            index += 1;
            if row_index < skip_rows {
                continue;
            }
            self.rows_read += 1;

            // Validación contra el contrato del source.
            let validated = PipelineRow::new(raw.clone(), Arc::clone(&self.source_contract));
            let row = match validated {
                Ok(row) => row,
                Err(validation_error) => {
                    self.quarantine_row(&source_node_id, row_index, &raw, &validation_error.to_string())?;
                    continue;
                }
            };

            let row_record = self.recorder
                                 .create_row(self.run_id, &source_node_id, row_index, &row.to_value())?;
            let token = self.token_manager.create_token(&row_record, row)?;

            // Estado de nodo del source: comprobante de lectura de la fila.
            let source_state = self.recorder
                                   .begin_node_state(token.token_id, &source_node_id, 0, 0, &token.row.to_value())?;
            self.recorder.complete_node_state(source_state.state_id(),
                                              crate::recorder::StateCompletion::Completed {
                                                  output_data: token.row.to_value(),
                                                  duration_ms: 0.0,
                                              })?;

            if let Some(first) = self.graph.pipeline_nodes().first().cloned() {
                self.process_token_at(token, first)?;
            } else {
                // Pipeline sólo-source: directo al sink de salida.
                let sink_name = self.source_settings.on_success.clone();
                self.write_to_sink(&sink_name, &token, RowOutcome::Completed, 1, None)?;
            }

            self.expire_coalesce_joins()?;
            self.maybe_checkpoint(false)?;
        }

        self.finalize_aggregations()?;
        self.wait_for_pending_batches()?;
        self.expire_coalesce_joins()?;
        self.fail_stranded_joins()?;
        Ok(())
    }

    /// Fila que falla validación: cuarentena (sink dedicado) o descarte.
    fn quarantine_row(&mut self,
                      source_node_id: &str,
                      row_index: u64,
                      raw: &IndexMap<String, Value>,
                      reason: &str)
                      -> Result<(), EngineError> {
        let raw_value = map_to_value(raw);
        let row_record = self.recorder.create_row(self.run_id, source_node_id, row_index, &raw_value)?;
        let quarantine_row = PipelineRow::from_trusted(raw.clone(), Arc::new(SchemaContract::observed().locked()));
        let token = self.token_manager.create_token(&row_record, quarantine_row)?;
        let destination = self.source_settings.on_validation_failure.clone();
        let error_json = serde_json::json!({"validation_error": reason});
        // La lectura inválida también deja su comprobante en el source.
        let source_state = self.recorder.begin_node_state(token.token_id, source_node_id, 0, 0, &raw_value)?;
        self.recorder.complete_node_state(source_state.state_id(),
                                          crate::recorder::StateCompletion::Failed { error: Some(error_json.clone()),
                                                                                     duration_ms: 0.0,
                                                                                     output_hash: None })?;
        if destination == "discard" {
            self.recorder.record_token_outcome(self.run_id,
                                               token.token_id,
                                               RowOutcome::Failed,
                                               None,
                                               None,
                                               None,
                                               Some(hash_value(&error_json)),
                                               Some(error_json))?;
        } else {
            self.write_to_sink(&destination, &token, RowOutcome::Quarantined, 1, Some(error_json))?;
        }
        Ok(())
    }

    /// Recorre nodos de procesamiento desde `node_id` hasta que el token
    /// termina (sink, buffer, join o fallo).
    fn process_token_at(&mut self, token: TokenInfo, node_id: String) -> Result<(), EngineError> {
        let mut current = Some((token, node_id));
        let mut prev_step: u32 = 0;
        while let Some((token, node_id)) = current.take() {
            let (kind, sequence) = {
                let info = self.graph.node(&node_id)?;
                (info.kind, info.sequence)
            };
            // Sinks no secuencian; su step es el del nodo previo + 1.
            let step = sequence.unwrap_or(prev_step + 1);
            prev_step = step;
            match kind {
                NodeKind::Transform => {
                    current = self.run_transform(&node_id, token, step)?;
                }
                NodeKind::Gate => {
                    current = self.run_gate(&node_id, token, step)?;
                }
                NodeKind::Aggregation => {
                    self.run_aggregation(&node_id, &token, step)?;
                }
                NodeKind::Coalesce => {
                    current = self.run_coalesce(&node_id, token, step)?;
                }
                NodeKind::Sink => {
                    let sink_name = self.sink_names
                                        .get(&node_id)
                                        .cloned()
                                        .ok_or_else(|| EngineError::AuditIntegrity(format!("unknown sink node {node_id}")))?;
                    self.write_to_sink(&sink_name, &token, RowOutcome::Completed, step, None)?;
                }
                NodeKind::Source => {
                    return Err(EngineError::Internal("token routed back to source".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Siguiente parada después de un nodo exitoso: edge continue hacia otro
    /// nodo de procesamiento, o edge on_success hacia un sink.
    fn advance(&mut self, token: TokenInfo, node_id: &str, step: u32) -> Result<Option<(TokenInfo, String)>, EngineError> {
        let next = self.graph.edge_from(node_id, "continue").map(|e| e.to.clone());
        if let Some(next) = next {
            return Ok(Some((token, next)));
        }
        let sink_node = self.graph.edge_from(node_id, "on_success").map(|e| e.to.clone());
        if let Some(sink_node) = sink_node {
            let sink_name = self.sink_names
                                .get(&sink_node)
                                .cloned()
                                .ok_or_else(|| EngineError::AuditIntegrity(format!("on_success edge from {node_id} does \
                                                                                    not reach a sink")))?;
            self.write_to_sink(&sink_name, &token, RowOutcome::Completed, step + 1, None)?;
            return Ok(None);
        }
        Err(EngineError::MissingEdge { node_id: node_id.to_string(),
                                       label: "continue".to_string() })
    }

    fn run_transform(&mut self,
                     node_id: &str,
                     token: TokenInfo,
                     step: u32)
                     -> Result<Option<(TokenInfo, String)>, EngineError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = {
                let (settings, plugin) = self.transforms
                                             .get_mut(node_id)
                                             .ok_or_else(|| EngineError::Internal(format!("no transform bound to \
                                                                                           {node_id}")))?;
                let on_error = Some(settings.on_error.clone());
                self.transform_exec.execute_transform(plugin.as_mut(),
                                                      node_id,
                                                      on_error.as_deref(),
                                                      &token,
                                                      &mut self.ctx,
                                                      step,
                                                      attempt)
            };

            match outcome {
                Err(e @ (EngineError::Capacity { .. } | EngineError::Transient(_))) => {
                    attempt += 1;
                    if attempt >= self.settings.retry.max_attempts {
                        return Err(e);
                    }
                    let delay = (self.settings.retry.initial_delay_seconds * f64::from(1u32 << attempt.min(16)))
                        .min(self.settings.retry.max_delay_seconds);
                    std::thread::sleep(Duration::from_secs_f64(delay));
                    continue;
                }
                Err(e) => return Err(e),
                Ok(outcome) => {
                    match &outcome.result {
                        TransformResult::Success { .. } => {
                            return self.advance(outcome.updated_token, node_id, step);
                        }
                        TransformResult::SuccessMulti { rows, contract, .. } => {
                            let out_contract = contract.clone().unwrap_or_else(|| Arc::clone(token.row.contract()));
                            let pipeline_rows: Vec<PipelineRow> =
                                rows.iter()
                                    .map(|r| PipelineRow::from_trusted(r.clone(), Arc::clone(&out_contract)))
                                    .collect();
                            let children = self.token_manager.expand_token(&token, pipeline_rows, step)?;
                            for child in children {
                                if let Some((child, next)) = self.advance(child, node_id, step)? {
                                    self.process_token_at(child, next)?;
                                }
                            }
                            return Ok(None);
                        }
                        TransformResult::Error { reason, retryable, .. } => {
                            if *retryable && attempt + 1 < self.settings.retry.max_attempts {
                                attempt += 1;
                                continue;
                            }
                            let error_hash = hash_value(reason);
                            match outcome.error_sink.as_deref() {
                                Some("discard") | None => {
                                    self.recorder.record_token_outcome(self.run_id,
                                                                       token.token_id,
                                                                       RowOutcome::Failed,
                                                                       None,
                                                                       None,
                                                                       None,
                                                                       Some(error_hash),
                                                                       Some(reason.clone()))?;
                                }
                                Some(sink_name) => {
                                    let context = serde_json::json!({
                                        "transform_error": reason,
                                        "transform_node": node_id,
                                    });
                                    let sink_name = sink_name.to_string();
                                    self.write_to_sink(&sink_name, &token, RowOutcome::Routed, step + 1, Some(context))?;
                                }
                            }
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    fn run_gate(&mut self, node_id: &str, token: TokenInfo, step: u32) -> Result<Option<(TokenInfo, String)>, EngineError> {
        let (settings, parser) = self.gates
                                     .get(node_id)
                                     .cloned()
                                     .ok_or_else(|| EngineError::Internal(format!("no gate bound to {node_id}")))?;
        let outcome = self.gate_exec.execute_config_gate(&settings,
                                                         &parser,
                                                         node_id,
                                                         &self.graph,
                                                         &token,
                                                         &mut self.ctx,
                                                         step,
                                                         &self.token_manager)?;
        match outcome.destination {
            GateDestination::Continue => {
                let target = self.graph.continue_target(node_id)?.clone();
                Ok(Some((outcome.updated_token, target)))
            }
            GateDestination::Jump(target) => Ok(Some((outcome.updated_token, target))),
            GateDestination::Sink { sink_name, .. } => {
                self.write_to_sink(&sink_name, &outcome.updated_token, RowOutcome::Routed, step + 1, None)?;
                Ok(None)
            }
            GateDestination::Forked => {
                for child in outcome.child_tokens {
                    let branch = child.branch_name
                                      .clone()
                                      .ok_or_else(|| EngineError::Internal("fork child without branch".to_string()))?;
                    let target = self.graph
                                     .edge_from(node_id, &branch)
                                     .map(|e| e.to.clone())
                                     .ok_or_else(|| EngineError::MissingEdge { node_id: node_id.to_string(),
                                                                               label: branch.clone() })?;
                    self.process_token_at(child, target)?;
                }
                Ok(None)
            }
        }
    }

    fn run_aggregation(&mut self, node_id: &str, token: &TokenInfo, step: u32) -> Result<(), EngineError> {
        self.agg_exec.buffer_row(node_id, token)?;
        let (fire, trigger) = self.agg_exec.check_flush_status(node_id);
        if fire {
            let trigger = trigger.expect("fired trigger has a type");
            self.flush_aggregation(node_id, trigger, step)?;
            self.maybe_checkpoint(true)?;
        }
        Ok(())
    }

    fn flush_aggregation(&mut self, node_id: &str, trigger: TriggerType, step: u32) -> Result<(), EngineError> {
        let flush = {
            let (_, plugin) = self.agg_plugins
                                  .get_mut(node_id)
                                  .ok_or_else(|| EngineError::Internal(format!("no aggregation bound to {node_id}")))?;
            self.agg_exec.execute_flush(node_id, plugin.as_mut(), &mut self.ctx, step, trigger)?
        };
        match flush {
            FlushOutcome::Pending { batch_id, state_id } => {
                debug!("aggregation {node_id} pending batch_id={batch_id} state_id={state_id}");
                self.pending_batches.insert(node_id.to_string(), trigger);
                Ok(())
            }
            FlushOutcome::Finished { result, consumed, batch_id, .. } => {
                self.pending_batches.remove(node_id);
                match &result {
                    TransformResult::Error { reason, .. } => {
                        let error_hash = hash_value(reason);
                        for t in &consumed {
                            self.recorder.record_token_outcome(self.run_id,
                                                               t.token_id,
                                                               RowOutcome::Failed,
                                                               None,
                                                               Some(batch_id),
                                                               None,
                                                               Some(error_hash.clone()),
                                                               Some(reason.clone()))?;
                        }
                        Ok(())
                    }
                    TransformResult::Success { .. } | TransformResult::SuccessMulti { .. } => {
                        for t in &consumed {
                            self.recorder.record_token_outcome(self.run_id,
                                                               t.token_id,
                                                               RowOutcome::ConsumedInBatch,
                                                               None,
                                                               Some(batch_id),
                                                               None,
                                                               None,
                                                               None)?;
                        }
                        let (rows, contract) = match result {
                            TransformResult::Success { row, contract, .. } => (vec![row], contract),
                            TransformResult::SuccessMulti { rows, contract, .. } => (rows, contract),
                            TransformResult::Error { .. } => unreachable!(),
                        };
                        let representative = consumed.first()
                                                     .ok_or_else(|| EngineError::Internal("flush with no consumed \
                                                                                           tokens"
                                                                                                       .to_string()))?;
                        let out_contract =
                            contract.unwrap_or_else(|| Arc::clone(representative.row.contract()));
                        let pipeline_rows: Vec<PipelineRow> =
                            rows.into_iter()
                                .map(|r| PipelineRow::from_trusted(r, Arc::clone(&out_contract)))
                                .collect();
                        let children = self.token_manager.create_output_tokens(representative, pipeline_rows, step)?;
                        for child in children {
                            if let Some((child, next)) = self.advance(child, node_id, step)? {
                                self.process_token_at(child, next)?;
                            }
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    fn run_coalesce(&mut self,
                    node_id: &str,
                    token: TokenInfo,
                    step: u32)
                    -> Result<Option<(TokenInfo, String)>, EngineError> {
        let token_id = token.token_id;
        match self.coalesce.accept(node_id, token)? {
            CoalesceOutcome::Waiting => {
                // Marcador no terminal: el token espera en el join.
                self.recorder.record_token_outcome(self.run_id,
                                                   token_id,
                                                   RowOutcome::Buffered,
                                                   None,
                                                   None,
                                                   None,
                                                   None,
                                                   Some(serde_json::json!({"waiting_at": node_id})))?;
                Ok(None)
            }
            CoalesceOutcome::Dropped => {
                self.recorder.record_token_outcome(self.run_id,
                                                   token_id,
                                                   RowOutcome::DroppedAtCoalesce,
                                                   None,
                                                   None,
                                                   None,
                                                   None,
                                                   Some(serde_json::json!({"dropped_at": node_id})))?;
                Ok(None)
            }
            CoalesceOutcome::Merged { parents, merged_row } => {
                let merged = self.token_manager.coalesce_tokens(&parents, merged_row, step)?;
                self.advance(merged, node_id, step)
            }
        }
    }

    /// Escribe un token a un sink y graba su outcome terminal.
    fn write_to_sink(&mut self,
                     sink_name: &str,
                     token: &TokenInfo,
                     outcome: RowOutcome,
                     step: u32,
                     context: Option<Value>)
                     -> Result<(), EngineError> {
        let sink_node_id = self.graph
                               .sink_id(sink_name)
                               .cloned()
                               .ok_or_else(|| EngineError::Config(format!("unknown sink '{sink_name}'")))?;
        {
            let plugin = self.sinks
                             .get_mut(sink_name)
                             .ok_or_else(|| EngineError::Internal(format!("no plugin bound to sink '{sink_name}'")))?;
            self.sink_exec
                .write(plugin.as_mut(), &sink_node_id, std::slice::from_ref(token), &mut self.ctx, step, None)?;
        }
        self.recorder.record_token_outcome(self.run_id,
                                           token.token_id,
                                           outcome,
                                           Some(sink_name.to_string()),
                                           None,
                                           None,
                                           None,
                                           context)?;
        self.last_sink_token = Some((token.token_id, sink_node_id));
        Ok(())
    }

    /// Checkpoint según cadencia configurada.
    fn maybe_checkpoint(&mut self, aggregation_boundary: bool) -> Result<(), EngineError> {
        if !self.settings.checkpoint.enabled {
            return Ok(());
        }
        let due = match self.settings.checkpoint.frequency {
            CheckpointFrequency::EveryRow => true,
            CheckpointFrequency::EveryN => {
                self.rows_since_checkpoint += 1;
                let interval = self.settings.checkpoint.checkpoint_interval.unwrap_or(1);
                self.rows_since_checkpoint >= interval
            }
            CheckpointFrequency::AggregationOnly => aggregation_boundary,
        };
        if !due {
            return Ok(());
        }
        let Some((token_id, node_id)) = self.last_sink_token.clone() else {
            // Nada completado en sink todavía: los buffers de agregación
            // igual se preservan una vez que exista una posición.
            return Ok(());
        };
        self.checkpoints.create_checkpoint(self.run_id,
                                           token_id,
                                           &node_id,
                                           self.checkpoint_seq,
                                           self.agg_exec.checkpoint_state(),
                                           self.ctx.checkpoint_snapshot())?;
        self.checkpoint_seq += 1;
        self.rows_since_checkpoint = 0;
        Ok(())
    }

    /// Al agotarse el source: flush de todo buffer no vacío con
    /// end_of_source.
    fn finalize_aggregations(&mut self) -> Result<(), EngineError> {
        let node_ids: Vec<String> = self.graph.aggregation_ids().values().cloned().collect();
        for node_id in node_ids {
            if self.agg_exec.buffer_count(&node_id) == 0 {
                continue;
            }
            let step = self.graph.node(&node_id)?.sequence.unwrap_or(0);
            self.flush_aggregation(&node_id, TriggerType::EndOfSource, step)?;
            self.maybe_checkpoint(true)?;
        }
        Ok(())
    }

    /// Espera acotada de lotes remotos pendientes, reintentando el flush.
    fn wait_for_pending_batches(&mut self) -> Result<(), EngineError> {
        if self.pending_batches.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_secs_f64(self.settings.pending_wait_seconds);
        while !self.pending_batches.is_empty() {
            if Instant::now() >= deadline {
                let stuck: Vec<String> = self.pending_batches.keys().cloned().collect();
                return Err(EngineError::Transient(format!("pending batches did not complete before shutdown deadline: \
                                                           {stuck:?}")));
            }
            std::thread::sleep(Duration::from_secs_f64(self.settings.pending_poll_seconds));
            let retry: Vec<(String, TriggerType)> =
                self.pending_batches.iter().map(|(n, t)| (n.clone(), *t)).collect();
            for (node_id, trigger) in retry {
                let step = self.graph.node(&node_id)?.sequence.unwrap_or(0);
                self.flush_aggregation(&node_id, trigger, step)?;
            }
        }
        Ok(())
    }

    fn expire_coalesce_joins(&mut self) -> Result<(), EngineError> {
        let expired = self.coalesce.check_timeouts()?;
        for join in expired {
            match join.merged {
                Some((parents, merged_row)) => {
                    let node_id = join.node_id.clone();
                    let step = self.graph.node(&node_id)?.sequence.unwrap_or(0);
                    let merged = self.token_manager.coalesce_tokens(&parents, merged_row, step)?;
                    if let Some((token, next)) = self.advance(merged, &node_id, step)? {
                        self.process_token_at(token, next)?;
                    }
                }
                None => {
                    // Política sin fusión parcial: el set queda failed.
                    let error = serde_json::json!({
                        "coalesce_timeout": join.node_id,
                        "row_id": join.row_id.to_string(),
                    });
                    let error_hash = hash_value(&error);
                    for token in join.stranded {
                        self.recorder.record_token_outcome(self.run_id,
                                                           token.token_id,
                                                           RowOutcome::Failed,
                                                           None,
                                                           None,
                                                           None,
                                                           Some(error_hash.clone()),
                                                           Some(error.clone()))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Joins que siguen esperando al cierre del run: sus tokens quedan
    /// failed (la fusión ya no puede producirse).
    fn fail_stranded_joins(&mut self) -> Result<(), EngineError> {
        for (node_id, tokens) in self.coalesce.drain_pending() {
            let error = serde_json::json!({"coalesce_incomplete": node_id});
            let error_hash = hash_value(&error);
            for token in tokens {
                self.recorder.record_token_outcome(self.run_id,
                                                   token.token_id,
                                                   RowOutcome::Failed,
                                                   None,
                                                   None,
                                                   None,
                                                   Some(error_hash.clone()),
                                                   Some(error.clone()))?;
            }
        }
        Ok(())
    }

    /// Re-ejecuta los subgrafos incompletos de una fila (reanudación).
    fn replay_row(&mut self,
                  row_id: Uuid,
                  recovery: &RecoveryManager,
                  buffered: &HashSet<Uuid>)
                  -> Result<(), EngineError> {
        let data = self.recorder
                       .get_row_data(row_id)?
                       .ok_or_else(|| EngineError::Config(format!("resume requires a payload store; row {row_id} has no \
                                                                   stored source data")))?;
        let incomplete = recovery.get_incomplete_tokens(row_id)?;
        for token_id in incomplete {
            if buffered.contains(&token_id) {
                // El token espera en un buffer restaurado; lo completará el
                // flush, no la re-ejecución.
                continue;
            }
            let token = self.recorder
                            .get_token(token_id)?
                            .ok_or_else(|| EngineError::AuditIntegrity(format!("unknown token {token_id}")))?;
            let row_map = auditflow_domain::row::value_to_map(&data).map_err(EngineError::from)?;
            let row = PipelineRow::from_trusted(row_map, Arc::clone(&self.source_contract));
            let mut info = TokenInfo::new(token.token_id, row_id, row);
            info.branch_name = token.branch_name.clone();

            let start = match &token.branch_name {
                Some(branch) => {
                    // Hijo de fork: re-entra en el destino de su rama.
                    let edge = self.graph
                                   .edges()
                                   .iter()
                                   .find(|e| &e.label == branch)
                                   .ok_or_else(|| EngineError::AuditIntegrity(format!("no edge found for branch \
                                                                                       '{branch}'")))?;
                    edge.to.clone()
                }
                None => match self.graph.pipeline_nodes().first() {
                    Some(first) => first.clone(),
                    None => continue,
                },
            };
            debug!("replaying token {token_id} of row {row_id} from node {start}");
            self.process_token_at(info, start)?;
        }
        Ok(())
    }

    /// Cierra plugins, resuelve verify y registra el estado final del run.
    fn finish(mut self, result: Result<(), EngineError>) -> Result<RunSummary, EngineError> {
        self.close_plugins();

        let mut verify = None;
        let mut status = match &result {
            Ok(()) => RunStatus::Completed,
            Err(_) => RunStatus::Failed,
        };

        if result.is_ok() && self.settings.run_mode == RunMode::Verify {
            let baseline = self.settings
                               .replay_source_run_id
                               .expect("validated: verify requires replay_source_run_id");
            let report = compare_runs(&self.recorder, baseline, self.run_id)?;
            if !report.is_clean() {
                warn!("verify run found {} mismatches against {baseline}", report.mismatches.len());
                status = RunStatus::Failed;
            }
            verify = Some(report);
        }

        self.recorder.complete_run(self.run_id, status)?;
        match result {
            Ok(()) => Ok(RunSummary { run_id: self.run_id,
                                      status,
                                      rows_read: self.rows_read,
                                      verify }),
            Err(e) => {
                if self.resumed {
                    debug!("resumed run {} failed again: {e}", self.run_id);
                }
                Err(e)
            }
        }
    }
}

fn map_to_value(map: &IndexMap<String, Value>) -> Value {
    let mut obj = serde_json::Map::new();
    for (k, v) in map {
        obj.insert(k.clone(), v.clone());
    }
    Value::Object(obj)
}
