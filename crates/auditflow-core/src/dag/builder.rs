//! Compilación de configuración a `ExecutionGraph`.
//!
//! Reglas que el builder garantiza antes de devolver el grafo:
//! - node_ids deterministas (`<kind>_<plugin>_<hash12>[_<seq>]`, con tope de
//!   longitud): idénticos entre corridas para entradas idénticas, requisito
//!   de checkpoint/resume.
//! - Toda conexión consumida tiene exactamente un productor; todo productor
//!   tiene consumidor (sin salidas colgantes tras resolver terminales).
//!   Errores con sugerencias por distancia de edición.
//! - Ramas de fork: únicas por gate y globales; cada rama llega a un
//!   coalesce (identidad vía COPY, transformada vía conexiones) o a un sink
//!   homónimo; si no, error.
//! - Rutas de gate completas en el mapa de resolución antes de devolver.
//! - Edges DIVERT estructurales para cuarentena y errores de transform
//!   (alcanzabilidad de auditoría; no se recorren en ejecución normal).
//! - Sin ciclos (el error reporta el camino).
//! - Propagación de esquemas, incluidos merges de coalesce.

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::constants::{error_edge_label, DISCARD_DESTINATION, NODE_ID_HASH_LEN, NODE_ID_MAX_LENGTH, QUARANTINE_EDGE_LABEL};
use crate::hashing::{hash_str, to_canonical_json};
use crate::model::{Determinism, NodeKind, RoutingMode};

use super::graph::{ExecutionGraph, GraphEdge, GraphValidationError, NodeInfo, RouteDestination};
use super::settings::{AggregationSettings, CoalesceSettings, GateSettings, MergeStrategy, SourceSettings, TransformSettings};
use super::suggest::suggest_similar;

/// Metadata de plugin que el builder necesita para compilar un nodo.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub plugin_name: String,
    pub plugin_version: String,
    pub config: Value,
    pub determinism: Determinism,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
}

impl NodeDescriptor {
    pub fn new(plugin_name: &str, plugin_version: &str, config: Value, determinism: Determinism) -> Self {
        Self { plugin_name: plugin_name.to_string(),
               plugin_version: plugin_version.to_string(),
               config,
               determinism,
               input_schema: None,
               output_schema: None }
    }
}

const DISCARD: &str = DISCARD_DESTINATION;

/// Genera el node_id determinista de un nodo.
fn node_id(prefix: &str, name: &str, config: &Value, sequence: Option<usize>) -> Result<String, GraphValidationError> {
    let config_hash = &hash_str(&to_canonical_json(config))[..NODE_ID_HASH_LEN];
    let generated = match sequence {
        Some(seq) => format!("{prefix}_{name}_{config_hash}_{seq}"),
        None => format!("{prefix}_{name}_{config_hash}"),
    };
    if generated.len() > NODE_ID_MAX_LENGTH {
        return Err(GraphValidationError(format!(
            "Generated node_id exceeds {NODE_ID_MAX_LENGTH} characters: '{generated}' (length={}). Use shorter \
             transform/gate/aggregation/source/sink names.",
            generated.len()
        )));
    }
    Ok(generated)
}

fn hint_for(name: &str, candidates: &[String]) -> String {
    let suggestions = suggest_similar(name, candidates);
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" Did you mean: {}?", suggestions.join(", "))
    }
}

/// Compila el grafo completo. Ver el doc del módulo para las garantías.
#[allow(clippy::too_many_arguments)]
pub fn build_execution_graph(source: &NodeDescriptor,
                             source_settings: &SourceSettings,
                             transforms: &[(TransformSettings, NodeDescriptor)],
                             sinks: &IndexMap<String, NodeDescriptor>,
                             aggregations: &[(AggregationSettings, NodeDescriptor)],
                             gates: &[GateSettings],
                             coalesces: &[CoalesceSettings])
                             -> Result<ExecutionGraph, GraphValidationError> {
    let mut graph = ExecutionGraph::default();

    // Validaciones locales de settings antes de tocar el grafo.
    for gate in gates {
        gate.validate().map_err(|e| GraphValidationError(e.to_string()))?;
    }
    for coalesce in coalesces {
        coalesce.validate().map_err(|e| GraphValidationError(e.to_string()))?;
    }
    for (agg, _) in aggregations {
        agg.validate().map_err(|e| GraphValidationError(e.to_string()))?;
    }

    // ===== Source =====
    let source_id = node_id("source", &source.plugin_name, &source.config, None)?;
    graph.nodes.insert(source_id.clone(),
                       NodeInfo { node_id: source_id.clone(),
                                  kind: NodeKind::Source,
                                  plugin_name: source.plugin_name.clone(),
                                  plugin_version: source.plugin_version.clone(),
                                  determinism: source.determinism,
                                  config: source.config.clone(),
                                  schema: source.output_schema.clone(),
                                  sequence: Some(0) });
    graph.source_id = source_id.clone();

    // ===== Sinks =====
    for (sink_name, descriptor) in sinks {
        let sid = node_id("sink", sink_name, &descriptor.config, None)?;
        graph.sink_ids.insert(sink_name.clone(), sid.clone());
        graph.nodes.insert(sid.clone(),
                           NodeInfo { node_id: sid.clone(),
                                      kind: NodeKind::Sink,
                                      plugin_name: descriptor.plugin_name.clone(),
                                      plugin_version: descriptor.plugin_version.clone(),
                                      determinism: descriptor.determinism,
                                      config: descriptor.config.clone(),
                                      schema: descriptor.input_schema.clone(),
                                      sequence: None });
    }
    let sink_names: Vec<String> = graph.sink_ids.keys().cloned().collect();

    // ===== Transforms =====
    for (seq, (settings, descriptor)) in transforms.iter().enumerate() {
        let tid = node_id("transform", &settings.name, &descriptor.config, Some(seq))?;
        if graph.transform_ids.insert(settings.name.clone(), tid.clone()).is_some() {
            return Err(GraphValidationError(format!("Duplicate transform name: '{}'", settings.name)));
        }
        graph.nodes.insert(tid.clone(),
                           NodeInfo { node_id: tid.clone(),
                                      kind: NodeKind::Transform,
                                      plugin_name: descriptor.plugin_name.clone(),
                                      plugin_version: descriptor.plugin_version.clone(),
                                      determinism: descriptor.determinism,
                                      config: descriptor.config.clone(),
                                      schema: descriptor.output_schema.clone(),
                                      sequence: None });
    }

    // ===== Aggregations =====
    for (seq, (settings, descriptor)) in aggregations.iter().enumerate() {
        let agg_config = serde_json::json!({
            "trigger": settings.trigger,
            "options": settings.options,
            "plugin": settings.plugin,
        });
        let aid = node_id("aggregation", &settings.name, &agg_config, Some(seq))?;
        if graph.aggregation_ids.insert(settings.name.clone(), aid.clone()).is_some() {
            return Err(GraphValidationError(format!("Duplicate aggregation name: '{}'", settings.name)));
        }
        graph.nodes.insert(aid.clone(),
                           NodeInfo { node_id: aid.clone(),
                                      kind: NodeKind::Aggregation,
                                      plugin_name: descriptor.plugin_name.clone(),
                                      plugin_version: descriptor.plugin_version.clone(),
                                      determinism: descriptor.determinism,
                                      config: agg_config,
                                      schema: descriptor.output_schema.clone(),
                                      sequence: None });
    }

    // ===== Config gates =====
    // Rutas a sinks crean edge inmediato; rutas a conexiones se difieren
    // hasta conocer el registro de consumidores.
    let mut gate_route_connections: Vec<(String, String, String)> = Vec::new(); // (gate_id, label, target)
    let mut gate_schema_inputs: Vec<(String, String, String)> = Vec::new(); // (gate_id, gate_name, input)

    for gate in gates {
        let mut gate_config = serde_json::json!({
            "condition": gate.condition,
            "routes": gate.routes,
        });
        if let Some(fork_to) = &gate.fork_to {
            gate_config["fork_to"] = serde_json::json!(fork_to);
        }
        let gid = node_id("gate", &gate.name, &gate_config, None)?;
        if graph.gate_ids.insert(gate.name.clone(), gid.clone()).is_some() {
            return Err(GraphValidationError(format!("Duplicate gate name: '{}'", gate.name)));
        }
        graph.nodes.insert(gid.clone(),
                           NodeInfo { node_id: gid.clone(),
                                      kind: NodeKind::Gate,
                                      plugin_name: format!("config_gate:{}", gate.name),
                                      plugin_version: "1.0.0".to_string(),
                                      determinism: Determinism::Deterministic,
                                      config: gate_config,
                                      schema: None,
                                      sequence: None });
        gate_schema_inputs.push((gid.clone(), gate.name.clone(), gate.input.clone()));

        for (route_label, target) in &gate.routes {
            if target == "fork" {
                graph.route_resolution
                     .insert((gid.clone(), route_label.clone()), RouteDestination::Fork);
            } else if target == "continue" {
                graph.route_resolution
                     .insert((gid.clone(), route_label.clone()), RouteDestination::Continue);
            } else if let Some(sink_id) = graph.sink_ids.get(target) {
                graph.edges.push(GraphEdge { from: gid.clone(),
                                             to: sink_id.clone(),
                                             label: route_label.clone(),
                                             mode: RoutingMode::Move });
                graph.route_resolution
                     .insert((gid.clone(), route_label.clone()), RouteDestination::Sink(target.clone()));
            } else {
                gate_route_connections.push((gid.clone(), route_label.clone(), target.clone()));
            }
        }
    }

    // ===== Coalesce nodes (antes de conectar gates) =====
    let mut branch_input_connections: HashMap<String, String> = HashMap::new();
    let mut transformed_branches: HashSet<String> = HashSet::new();

    for coalesce in coalesces {
        let config_json = serde_json::json!({
            "branches": coalesce.branches,
            "policy": coalesce.policy,
            "merge": coalesce.merge,
            "timeout_seconds": coalesce.timeout_seconds,
            "quorum_count": coalesce.quorum_count,
            "select_branch": coalesce.select_branch,
        });
        let cid = node_id("coalesce", &coalesce.name, &config_json, None)?;
        if graph.coalesce_ids.insert(coalesce.name.clone(), cid.clone()).is_some() {
            return Err(GraphValidationError(format!("Duplicate coalesce name: '{}'", coalesce.name)));
        }
        graph.nodes.insert(cid.clone(),
                           NodeInfo { node_id: cid.clone(),
                                      kind: NodeKind::Coalesce,
                                      plugin_name: format!("coalesce:{}", coalesce.name),
                                      plugin_version: "1.0.0".to_string(),
                                      determinism: Determinism::Deterministic,
                                      config: config_json,
                                      schema: None,
                                      sequence: None });

        for (branch_name, input_connection) in &coalesce.branches {
            if let Some(existing) = graph.branch_to_coalesce.get(branch_name) {
                return Err(GraphValidationError(format!(
                    "Duplicate branch name '{branch_name}' found in coalesce settings. Branch '{branch_name}' is already \
                     mapped to coalesce '{existing}', but coalesce '{}' also declares it. Each fork branch can only merge \
                     at one coalesce point.",
                    coalesce.name
                )));
            }
            graph.branch_to_coalesce.insert(branch_name.clone(), coalesce.name.clone());
            branch_input_connections.insert(branch_name.clone(), input_connection.clone());
            if input_connection != branch_name {
                transformed_branches.insert(branch_name.clone());
            }
        }
    }

    // ===== Conectar forks: destinos explícitos, sin fallback =====
    let mut fork_branch_owner: HashMap<String, String> = HashMap::new();
    let mut coalesce_transform_consumers: Vec<(String, String, String)> = Vec::new(); // (branch, input_conn, coalesce)

    for gate in gates {
        let Some(fork_to) = &gate.fork_to else { continue };
        let gid = graph.gate_ids[&gate.name].clone();

        let mut seen: HashSet<&str> = HashSet::new();
        let duplicates: Vec<&str> = fork_to.iter().filter(|b| !seen.insert(b.as_str())).map(|b| b.as_str()).collect();
        if !duplicates.is_empty() {
            return Err(GraphValidationError(format!("Gate '{}' has duplicate fork branches: {duplicates:?}. Each fork \
                                                     branch name must be unique.",
                                                    gate.name)));
        }

        for branch_name in fork_to {
            if let Some(owner) = fork_branch_owner.get(branch_name) {
                return Err(GraphValidationError(format!(
                    "Fork branch '{branch_name}' is declared by multiple gates: '{owner}' and '{}'. Fork branch names \
                     must be globally unique across all gates.",
                    gate.name
                )));
            }
            fork_branch_owner.insert(branch_name.clone(), gate.name.clone());

            if let Some(coalesce_name) = graph.branch_to_coalesce.get(branch_name) {
                let coalesce_nid = graph.coalesce_ids[coalesce_name].clone();
                if transformed_branches.contains(branch_name) {
                    // Rama transformada: el coalesce consume la salida del
                    // último transform; la resolución de conexiones arma la
                    // cadena. No hay edge COPY directo.
                    let input_conn = branch_input_connections[branch_name].clone();
                    coalesce_transform_consumers.push((branch_name.clone(), input_conn, coalesce_name.clone()));
                } else {
                    // Rama identidad: edge COPY directo gate → coalesce.
                    graph.edges.push(GraphEdge { from: gid.clone(),
                                                 to: coalesce_nid,
                                                 label: branch_name.clone(),
                                                 mode: RoutingMode::Copy });
                }
            } else if let Some(sink_id) = graph.sink_ids.get(branch_name) {
                graph.edges.push(GraphEdge { from: gid.clone(),
                                             to: sink_id.clone(),
                                             label: branch_name.clone(),
                                             mode: RoutingMode::Copy });
            } else {
                return Err(GraphValidationError(format!(
                    "Gate '{}' has fork branch '{branch_name}' with no destination.\nFork branches must either:\n  1. Be \
                     listed in a coalesce 'branches' map, or\n  2. Match a sink name exactly\n\nAvailable coalesce \
                     branches: {:?}\nAvailable sinks: {:?}",
                    gate.name,
                    graph.branch_to_coalesce.keys().collect::<Vec<_>>(),
                    sink_names
                )));
            }
        }
    }

    // Toda rama declarada por un coalesce debe ser producida por algún gate.
    for (branch_name, coalesce_name) in &graph.branch_to_coalesce {
        if !fork_branch_owner.contains_key(branch_name) {
            let produced: Vec<&String> = fork_branch_owner.keys().collect();
            return Err(GraphValidationError(format!(
                "Coalesce '{coalesce_name}' declares branch '{branch_name}', but no gate produces this branch. Branches \
                 must be listed in a gate's fork_to list to be valid.\n\nBranches produced by gates: {produced:?}"
            )));
        }
    }

    // ===== Registro de productores =====
    let mut producers: HashMap<String, (String, String)> = HashMap::new(); // conexión → (node_id, label)
    let mut producer_desc: HashMap<String, String> = HashMap::new();

    let register_producer = |producers: &mut HashMap<String, (String, String)>,
                                 producer_desc: &mut HashMap<String, String>,
                                 connection: &str,
                                 nid: &str,
                                 label: &str,
                                 description: String|
     -> Result<(), GraphValidationError> {
        if let Some((existing_node, _)) = producers.get(connection) {
            return Err(GraphValidationError(format!("Duplicate producer for connection '{connection}': {} ({existing_node}) \
                                                     and {description} ({nid}).",
                                                    producer_desc[connection])));
        }
        producers.insert(connection.to_string(), (nid.to_string(), label.to_string()));
        producer_desc.insert(connection.to_string(), description);
        Ok(())
    };

    if !graph.sink_ids.contains_key(&source_settings.on_success) {
        register_producer(&mut producers,
                          &mut producer_desc,
                          &source_settings.on_success,
                          &source_id,
                          "continue",
                          format!("source '{}'", source.plugin_name))?;
    }

    for (settings, _) in transforms {
        let tid = graph.transform_ids[&settings.name].clone();
        if !graph.sink_ids.contains_key(&settings.on_success) {
            register_producer(&mut producers,
                              &mut producer_desc,
                              &settings.on_success,
                              &tid,
                              "continue",
                              format!("transform '{}'", settings.name))?;
        }
    }

    for (settings, _) in aggregations {
        let aid = graph.aggregation_ids[&settings.name].clone();
        match &settings.on_success {
            None => register_producer(&mut producers,
                                      &mut producer_desc,
                                      &settings.name,
                                      &aid,
                                      "continue",
                                      format!("aggregation '{}'", settings.name))?,
            Some(on_success) if !graph.sink_ids.contains_key(on_success) => {
                register_producer(&mut producers,
                                  &mut producer_desc,
                                  on_success,
                                  &aid,
                                  "continue",
                                  format!("aggregation '{}'", settings.name))?;
            }
            Some(_) => {}
        }
    }

    for coalesce in coalesces {
        if coalesce.on_success.is_none() {
            let cid = graph.coalesce_ids[&coalesce.name].clone();
            register_producer(&mut producers,
                              &mut producer_desc,
                              &coalesce.name,
                              &cid,
                              "continue",
                              format!("coalesce '{}'", coalesce.name))?;
        }
    }

    // Rutas de gate hacia conexiones: varias rutas del mismo gate pueden
    // converger al mismo destino; el productor se registra una sola vez.
    let mut gate_connection_route_labels: HashMap<(String, String), Vec<String>> = HashMap::new();
    for (gate_id, route_label, target) in &gate_route_connections {
        gate_connection_route_labels.entry((gate_id.clone(), target.clone()))
                                    .or_default()
                                    .push(route_label.clone());
        if let Some((existing, _)) = producers.get(target) {
            if existing == gate_id {
                continue;
            }
        }
        register_producer(&mut producers,
                          &mut producer_desc,
                          target,
                          gate_id,
                          route_label,
                          format!("gate route '{route_label}' from '{gate_id}'"))?;
    }

    // Ramas de fork transformadas se publican como conexiones del gate.
    for branch_name in &transformed_branches {
        let gate_name = &fork_branch_owner[branch_name];
        let gid = graph.gate_ids[gate_name].clone();
        register_producer(&mut producers,
                          &mut producer_desc,
                          branch_name,
                          &gid,
                          branch_name,
                          format!("fork branch '{branch_name}' from gate '{gate_name}'"))?;
    }

    // ===== Registro de consumidores =====
    let mut consumers: HashMap<String, String> = HashMap::new(); // conexión → node_id
    let mut consumer_desc: HashMap<String, String> = HashMap::new();

    let register_consumer = |consumers: &mut HashMap<String, String>,
                                 consumer_desc: &mut HashMap<String, String>,
                                 connection: &str,
                                 nid: &str,
                                 description: String|
     -> Result<(), GraphValidationError> {
        if let Some(existing) = consumers.get(connection) {
            if existing != nid {
                return Err(GraphValidationError(format!(
                    "Connection '{connection}' is consumed by more than one node: {} and {description}.",
                    consumer_desc[connection]
                )));
            }
            return Ok(());
        }
        consumers.insert(connection.to_string(), nid.to_string());
        consumer_desc.insert(connection.to_string(), description);
        Ok(())
    };

    for (settings, _) in transforms {
        let tid = graph.transform_ids[&settings.name].clone();
        register_consumer(&mut consumers,
                          &mut consumer_desc,
                          &settings.input,
                          &tid,
                          format!("transform '{}'", settings.name))?;
    }
    for (settings, _) in aggregations {
        let aid = graph.aggregation_ids[&settings.name].clone();
        register_consumer(&mut consumers,
                          &mut consumer_desc,
                          &settings.input,
                          &aid,
                          format!("aggregation '{}'", settings.name))?;
    }
    for gate in gates {
        let gid = graph.gate_ids[&gate.name].clone();
        register_consumer(&mut consumers,
                          &mut consumer_desc,
                          &gate.input,
                          &gid,
                          format!("gate '{}'", gate.name))?;
    }
    // El coalesce consume la conexión de entrada de cada rama transformada.
    for (branch_name, input_conn, coalesce_name) in &coalesce_transform_consumers {
        let cid = graph.coalesce_ids[coalesce_name].clone();
        register_consumer(&mut consumers,
                          &mut consumer_desc,
                          input_conn,
                          &cid,
                          format!("coalesce '{coalesce_name}' branch '{branch_name}'"))?;
    }

    // Todo consumidor debe resolver a un productor.
    for (connection, nid) in &consumers {
        if !producers.contains_key(connection) {
            let candidates: Vec<String> = producers.keys().cloned().collect();
            let hint = hint_for(connection, &candidates);
            return Err(GraphValidationError(format!(
                "{} input '{connection}' has no producer.{hint}\nAvailable connections: {}",
                consumer_desc.get(connection).cloned().unwrap_or_else(|| nid.clone()),
                {
                    let mut sorted = candidates.clone();
                    sorted.sort();
                    sorted.join(", ")
                }
            )));
        }
    }

    // ===== Emparejar productores y consumidores =====
    let gate_node_ids: HashSet<String> = graph.gate_ids.values().cloned().collect();

    for (connection, consumer_id) in &consumers {
        let (producer_id, producer_label) = producers[connection].clone();
        if gate_node_ids.contains(&producer_id) && producer_label != "continue" {
            let labels = gate_connection_route_labels.get(&(producer_id.clone(), connection.clone()));
            match labels {
                Some(route_labels) => {
                    for route_label in route_labels {
                        graph.edges.push(GraphEdge { from: producer_id.clone(),
                                                     to: consumer_id.clone(),
                                                     label: route_label.clone(),
                                                     mode: RoutingMode::Move });
                    }
                }
                None => {
                    graph.edges.push(GraphEdge { from: producer_id.clone(),
                                                 to: consumer_id.clone(),
                                                 label: producer_label.clone(),
                                                 mode: RoutingMode::Move });
                }
            }
            // Fallthrough de continue: un único destino de procesamiento lo
            // habilita; más de uno lo vuelve ambiguo (falla cerrado en
            // runtime).
            match graph.continue_targets.get(&producer_id) {
                None => {
                    graph.continue_targets.insert(producer_id.clone(), consumer_id.clone());
                }
                Some(existing) if existing != consumer_id => {
                    graph.ambiguous_continue.insert(producer_id.clone());
                }
                Some(_) => {}
            }
        } else {
            graph.edges.push(GraphEdge { from: producer_id.clone(),
                                         to: consumer_id.clone(),
                                         label: "continue".to_string(),
                                         mode: RoutingMode::Move });
        }
    }

    // Edge explícito de continue para gates con fallthrough no ambiguo.
    let fallthrough: Vec<(String, String)> = graph.continue_targets
                                                  .iter()
                                                  .filter(|(gid, _)| !graph.ambiguous_continue.contains(*gid))
                                                  .map(|(gid, target)| (gid.clone(), target.clone()))
                                                  .collect();
    for (gid, target) in fallthrough {
        graph.edges.push(GraphEdge { from: gid,
                                     to: target,
                                     label: "continue".to_string(),
                                     mode: RoutingMode::Move });
    }

    // ===== Resolver rutas de gate diferidas =====
    for (gate_id, route_label, target) in &gate_route_connections {
        match consumers.get(target) {
            Some(consumer_id) => {
                graph.route_resolution
                     .insert((gate_id.clone(), route_label.clone()),
                             RouteDestination::ProcessingNode(consumer_id.clone()));
            }
            None => {
                let candidates: Vec<String> = consumers.keys().cloned().collect();
                let hint = hint_for(target, &candidates);
                return Err(GraphValidationError(format!("Gate route target '{target}' is neither a sink nor a known \
                                                         connection name.{hint}")));
            }
        }
    }

    // Completitud del mapa de rutas: cada label declarado debe resolver.
    for gate in gates {
        let gid = &graph.gate_ids[&gate.name];
        for route_label in gate.routes.keys() {
            if !graph.route_resolution.contains_key(&(gid.clone(), route_label.clone())) {
                return Err(GraphValidationError(format!("Gate '{}' route '{route_label}' did not resolve to any \
                                                         destination; the route map must be total before execution.",
                                                        gate.name)));
            }
        }
    }

    // ===== Ruteo terminal (on_success → sink) =====
    for (settings, _) in transforms {
        let tid = graph.transform_ids[&settings.name].clone();
        if let Some(sink_id) = graph.sink_ids.get(&settings.on_success) {
            graph.edges.push(GraphEdge { from: tid,
                                         to: sink_id.clone(),
                                         label: "on_success".to_string(),
                                         mode: RoutingMode::Move });
        } else if !consumers.contains_key(&settings.on_success) {
            let mut candidates: Vec<String> = consumers.keys().cloned().collect();
            candidates.extend(sink_names.iter().cloned());
            let hint = hint_for(&settings.on_success, &candidates);
            return Err(GraphValidationError(format!("Transform '{}' on_success '{}' is neither a sink nor a known \
                                                     connection.{hint}",
                                                    settings.name, settings.on_success)));
        }
    }

    for (settings, _) in aggregations {
        let Some(on_success) = &settings.on_success else { continue };
        let aid = graph.aggregation_ids[&settings.name].clone();
        if let Some(sink_id) = graph.sink_ids.get(on_success) {
            graph.edges.push(GraphEdge { from: aid,
                                         to: sink_id.clone(),
                                         label: "on_success".to_string(),
                                         mode: RoutingMode::Move });
        } else if !consumers.contains_key(on_success) {
            let mut candidates: Vec<String> = consumers.keys().cloned().collect();
            candidates.extend(sink_names.iter().cloned());
            let hint = hint_for(on_success, &candidates);
            return Err(GraphValidationError(format!("Aggregation '{}' on_success '{on_success}' is neither a sink nor a \
                                                     known connection.{hint}",
                                                    settings.name)));
        }
    }

    for coalesce in coalesces {
        let Some(on_success) = &coalesce.on_success else { continue };
        if consumers.contains_key(on_success) {
            return Err(GraphValidationError(format!("Coalesce '{}' has on_success='{on_success}'. Coalesce on_success \
                                                     must point to a sink when configured.",
                                                    coalesce.name)));
        }
        let sink_id = graph.sink_ids.get(on_success).ok_or_else(|| {
                                                        GraphValidationError(format!(
                "Coalesce '{}' on_success references unknown sink '{on_success}'. Available sinks: {sink_names:?}",
                coalesce.name
            ))
                                                    })?;
        graph.edges.push(GraphEdge { from: graph.coalesce_ids[&coalesce.name].clone(),
                                     to: sink_id.clone(),
                                     label: "on_success".to_string(),
                                     mode: RoutingMode::Move });
    }

    if let Some(sink_id) = graph.sink_ids.get(&source_settings.on_success) {
        // Pipeline sólo-source: edge directo source → sink.
        if transforms.is_empty() && gates.is_empty() && aggregations.is_empty() {
            graph.edges.push(GraphEdge { from: source_id.clone(),
                                         to: sink_id.clone(),
                                         label: "on_success".to_string(),
                                         mode: RoutingMode::Move });
        }
    } else if !consumers.contains_key(&source_settings.on_success) {
        let hint = hint_for(&source_settings.on_success, &sink_names);
        return Err(GraphValidationError(format!("Source '{}' on_success '{}' is neither a sink nor a known \
                                                 connection.{hint}",
                                                source.plugin_name, source_settings.on_success)));
    }

    // Salidas colgantes: todo productor registrado debe tener consumidor.
    for (connection, (producer_id, _)) in &producers {
        if !consumers.contains_key(connection) {
            return Err(GraphValidationError(format!("Connection '{connection}' produced by {} ({producer_id}) has no \
                                                     consumer; dangling outputs are configuration errors.",
                                                    producer_desc[connection])));
        }
    }

    // ===== Edges DIVERT (cuarentena / errores) =====
    // Estructurales: existen para alcanzabilidad de auditoría, no se
    // recorren en procesamiento normal.
    let quarantine = &source_settings.on_validation_failure;
    if quarantine != DISCARD {
        if let Some(sink_id) = graph.sink_ids.get(quarantine) {
            graph.edges.push(GraphEdge { from: source_id.clone(),
                                         to: sink_id.clone(),
                                         label: QUARANTINE_EDGE_LABEL.to_string(),
                                         mode: RoutingMode::Divert });
        } else {
            let hint = hint_for(quarantine, &sink_names);
            return Err(GraphValidationError(format!("Source on_validation_failure '{quarantine}' references unknown \
                                                     sink.{hint} Available sinks: {sink_names:?}")));
        }
    }

    for (settings, _) in transforms {
        if settings.on_error != DISCARD {
            let sink_id = graph.sink_ids.get(&settings.on_error).ok_or_else(|| {
                let hint = hint_for(&settings.on_error, &sink_names);
                GraphValidationError(format!("Transform '{}' on_error '{}' references unknown sink.{hint} Available \
                                              sinks: {sink_names:?}",
                                             settings.name, settings.on_error))
            })?;
            graph.edges.push(GraphEdge { from: graph.transform_ids[&settings.name].clone(),
                                         to: sink_id.clone(),
                                         label: error_edge_label(&settings.name),
                                         mode: RoutingMode::Divert });
        }
    }

    // ===== Orden topológico =====
    let topo = graph.topological_order()?;
    let processing: HashSet<&String> = graph.transform_ids
                                            .values()
                                            .chain(graph.aggregation_ids.values())
                                            .chain(graph.gate_ids.values())
                                            .chain(graph.coalesce_ids.values())
                                            .collect();
    graph.pipeline_nodes = topo.iter().filter(|n| processing.contains(n)).cloned().collect();

    // Secuencia de pipeline (1-based; el source es 0, sinks no secuencian).
    let sequences: Vec<(String, u32)> = graph.pipeline_nodes
                                             .iter()
                                             .enumerate()
                                             .map(|(i, nid)| (nid.clone(), (i + 1) as u32))
                                             .collect();
    for (nid, seq) in sequences {
        if let Some(info) = graph.nodes.get_mut(&nid) {
            info.sequence = Some(seq);
        }
    }

    // ===== Propagación de esquemas =====
    // Paso 1: gates cuyo productor ya tiene esquema. Los que dependen de un
    // coalesce se difieren al paso 2.
    let mut deferred_gates: Vec<(String, String)> = Vec::new(); // (gate_id, input)
    for (gate_id, _gate_name, input_connection) in &gate_schema_inputs {
        let (producer_id, _) = producers[input_connection].clone();
        let upstream_schema = graph.nodes[&producer_id].schema.clone();
        match upstream_schema {
            Some(schema) => {
                if let Some(info) = graph.nodes.get_mut(gate_id) {
                    info.schema = Some(schema);
                }
            }
            None => deferred_gates.push((gate_id.clone(), input_connection.clone())),
        }
    }

    // Esquema de cada coalesce según estrategia de merge.
    let coalesce_entries: Vec<(String, CoalesceSettings)> =
        coalesces.iter().map(|c| (graph.coalesce_ids[&c.name].clone(), c.clone())).collect();
    for (cid, coalesce) in &coalesce_entries {
        let merged = merge_coalesce_schema(&graph, &producers, cid, coalesce)?;
        if let Some(info) = graph.nodes.get_mut(cid) {
            info.schema = Some(merged);
        }
    }

    // Paso 2: gates diferidos (productor era un coalesce sin esquema aún).
    for (gate_id, input_connection) in deferred_gates {
        let (producer_id, _) = producers[&input_connection].clone();
        let upstream_schema = graph.nodes[&producer_id].schema.clone();
        if let Some(info) = graph.nodes.get_mut(&gate_id) {
            info.schema = upstream_schema;
        }
    }

    Ok(graph)
}

/// Merge de esquemas de un coalesce.
///
/// - `union`: tipos compatibles en campos superpuestos; opcional en
///   cualquier rama ⇒ opcional en la salida; guaranteed_fields se
///   intersectan, audit_fields se unen.
/// - `nested`: cada rama se publica como campo anidado de tipo `any`.
/// - `select`: el esquema de la rama elegida, tal cual.
fn merge_coalesce_schema(graph: &ExecutionGraph,
                         producers: &HashMap<String, (String, String)>,
                         coalesce_id: &str,
                         coalesce: &CoalesceSettings)
                         -> Result<Value, GraphValidationError> {
    let incoming = graph.in_edges(coalesce_id);
    if incoming.is_empty() {
        return Err(GraphValidationError(format!("Coalesce node '{coalesce_id}' has no incoming branches; cannot \
                                                 determine schema for audit.")));
    }

    // rama → esquema, correlacionando edges con ramas declaradas.
    let mut branch_schemas: IndexMap<String, Value> = IndexMap::new();
    for edge in &incoming {
        if edge.mode == RoutingMode::Copy && coalesce.branches.contains_key(&edge.label) {
            if let Some(schema) = &graph.nodes[&edge.from].schema {
                branch_schemas.insert(edge.label.clone(), schema.clone());
            }
        } else if edge.mode == RoutingMode::Move {
            // Rama transformada: el edge viene del productor de la conexión
            // de entrada declarada; correlacionar por nodo origen.
            for (branch_name, input_conn) in &coalesce.branches {
                if input_conn != branch_name {
                    if let Some((producer_id, _)) = producers.get(input_conn) {
                        if producer_id == &edge.from {
                            if let Some(schema) = &graph.nodes[&edge.from].schema {
                                branch_schemas.insert(branch_name.clone(), schema.clone());
                            }
                            break;
                        }
                    }
                }
            }
        }
    }

    match coalesce.merge {
        MergeStrategy::Union => {
            // campo → (tipo, requerido, primera rama).
            let mut seen: IndexMap<String, (String, bool, String)> = IndexMap::new();
            let mut all_observed = false;
            for (branch_name, schema) in &branch_schemas {
                if schema.get("mode").and_then(|m| m.as_str()) == Some("observed") {
                    all_observed = true;
                    break;
                }
                let Some(fields) = schema.get("fields").and_then(|f| f.as_array()) else { continue };
                for field in fields {
                    let fname = field.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
                    let ftype = field.get("type").and_then(|t| t.as_str()).unwrap_or("any").to_string();
                    let frequired = field.get("required").and_then(|r| r.as_bool()).unwrap_or(true);
                    match seen.get(&fname) {
                        Some((prior_type, prior_req, prior_branch)) => {
                            if prior_type != &ftype {
                                return Err(GraphValidationError(format!(
                                    "Coalesce node '{coalesce_id}' receives incompatible types for field '{fname}' in \
                                     union merge: branch '{prior_branch}' has '{prior_type}', branch '{branch_name}' \
                                     has '{ftype}'. Union merge requires compatible types on shared fields."
                                )));
                            }
                            if !frequired {
                                let updated = (prior_type.clone(), false, prior_branch.clone());
                                seen.insert(fname, updated);
                            } else {
                                let _ = prior_req;
                            }
                        }
                        None => {
                            seen.insert(fname, (ftype, frequired, branch_name.clone()));
                        }
                    }
                }
            }

            let mut merged = if all_observed || seen.is_empty() {
                serde_json::json!({"mode": "observed"})
            } else {
                serde_json::json!({
                    "mode": "flexible",
                    "fields": seen.iter().map(|(name, (ftype, required, _))| {
                        serde_json::json!({"name": name, "type": ftype, "required": required})
                    }).collect::<Vec<_>>(),
                })
            };

            // guaranteed_fields = ∩ ramas; audit_fields = ∪ ramas.
            let mut guaranteed: Option<HashSet<String>> = None;
            let mut audit: HashSet<String> = HashSet::new();
            let mut saw_audit = false;
            for schema in branch_schemas.values() {
                if let Some(gf) = schema.get("guaranteed_fields").and_then(|g| g.as_array()) {
                    let set: HashSet<String> = gf.iter().filter_map(|v| v.as_str().map(String::from)).collect();
                    guaranteed = Some(match guaranteed {
                                          Some(acc) => acc.intersection(&set).cloned().collect(),
                                          None => set,
                                      });
                }
                if let Some(af) = schema.get("audit_fields").and_then(|a| a.as_array()) {
                    saw_audit = true;
                    audit.extend(af.iter().filter_map(|v| v.as_str().map(String::from)));
                }
            }
            if let Some(gf) = guaranteed {
                let mut sorted: Vec<String> = gf.into_iter().collect();
                sorted.sort();
                merged["guaranteed_fields"] = serde_json::json!(sorted);
            }
            if saw_audit {
                let mut sorted: Vec<String> = audit.into_iter().collect();
                sorted.sort();
                merged["audit_fields"] = serde_json::json!(sorted);
            }
            Ok(merged)
        }
        MergeStrategy::Select => {
            let select = coalesce.select_branch.as_ref().expect("validated: select requires select_branch");
            branch_schemas.get(select).cloned().ok_or_else(|| {
                                                   GraphValidationError(format!(
                    "Coalesce node '{coalesce_id}' select_branch '{select}' has no schema mapping. Available branches: \
                     {:?}. This indicates a graph construction bug.",
                    branch_schemas.keys().collect::<Vec<_>>()
                ))
                                               })
        }
        MergeStrategy::Nested => {
            // La salida publica cada rama como campo anidado de tipo any.
            Ok(serde_json::json!({
                "mode": "flexible",
                "fields": coalesce.branches.keys().map(|branch| {
                    serde_json::json!({"name": branch, "type": "any", "required": false})
                }).collect::<Vec<_>>(),
            }))
        }
    }
}
