//! Grafo de ejecución compilado.
//!
//! El builder (`dag::builder`) produce esta estructura: nodos tipados, edges
//! resueltos, registros de productores/consumidores ya validados, mapa de
//! resolución de rutas y orden topológico de nodos de procesamiento. Después
//! de compilar, el grafo es de sólo lectura: las configs de nodo quedan
//! congeladas.

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::errors::EngineError;
use crate::model::{Determinism, NodeKind, RoutingMode};

/// Error de validación del grafo (configuración, nunca recuperable).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct GraphValidationError(pub String);

impl From<GraphValidationError> for EngineError {
    fn from(e: GraphValidationError) -> Self {
        EngineError::Config(e.0)
    }
}

/// Nodo compilado.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: String,
    pub kind: NodeKind,
    pub plugin_name: String,
    pub plugin_version: String,
    pub determinism: Determinism,
    pub config: Value,
    /// Mejor esquema disponible en este punto del grafo (para auditoría).
    pub schema: Option<Value>,
    pub sequence: Option<u32>,
}

/// Edge compilado (aún sin edge_id; el recorder lo asigna al registrar).
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub label: String,
    pub mode: RoutingMode,
}

/// Destino resuelto de una ruta de gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDestination {
    Continue,
    Fork,
    Sink(String),
    ProcessingNode(String),
}

/// Grafo de ejecución compilado y validado.
#[derive(Debug, Default)]
pub struct ExecutionGraph {
    pub(crate) nodes: IndexMap<String, NodeInfo>,
    pub(crate) edges: Vec<GraphEdge>,
    pub(crate) source_id: String,
    /// nombre de sink → node_id.
    pub(crate) sink_ids: IndexMap<String, String>,
    /// nombre de transform → node_id.
    pub(crate) transform_ids: IndexMap<String, String>,
    /// nombre de agregación → node_id.
    pub(crate) aggregation_ids: IndexMap<String, String>,
    /// nombre de gate → node_id.
    pub(crate) gate_ids: IndexMap<String, String>,
    /// nombre de coalesce → node_id.
    pub(crate) coalesce_ids: IndexMap<String, String>,
    /// rama de fork → nombre de coalesce.
    pub(crate) branch_to_coalesce: IndexMap<String, String>,
    /// (gate node_id, route label) → destino resuelto.
    pub(crate) route_resolution: HashMap<(String, String), RouteDestination>,
    /// gate node_id → destino único de continue (fallthrough).
    pub(crate) continue_targets: HashMap<String, String>,
    /// gates con múltiples destinos de procesamiento (continue ambiguo).
    pub(crate) ambiguous_continue: HashSet<String>,
    /// Nodos de procesamiento en orden topológico.
    pub(crate) pipeline_nodes: Vec<String>,
}

impl ExecutionGraph {
    pub fn node(&self, node_id: &str) -> Result<&NodeInfo, EngineError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| EngineError::AuditIntegrity(format!("unknown node in graph: {node_id}")))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn sink_id(&self, sink_name: &str) -> Option<&String> {
        self.sink_ids.get(sink_name)
    }

    pub fn sink_ids(&self) -> &IndexMap<String, String> {
        &self.sink_ids
    }

    pub fn aggregation_ids(&self) -> &IndexMap<String, String> {
        &self.aggregation_ids
    }

    pub fn gate_ids(&self) -> &IndexMap<String, String> {
        &self.gate_ids
    }

    pub fn coalesce_ids(&self) -> &IndexMap<String, String> {
        &self.coalesce_ids
    }

    pub fn transform_ids(&self) -> &IndexMap<String, String> {
        &self.transform_ids
    }

    pub fn branch_to_coalesce(&self) -> &IndexMap<String, String> {
        &self.branch_to_coalesce
    }

    /// Nodos de procesamiento (transforms, gates, agregaciones, coalesces)
    /// en orden topológico.
    pub fn pipeline_nodes(&self) -> &[String] {
        &self.pipeline_nodes
    }

    /// Edge saliente por etiqueta.
    pub fn edge_from(&self, node_id: &str, label: &str) -> Option<&GraphEdge> {
        self.edges.iter().find(|e| e.from == node_id && e.label == label)
    }

    pub fn out_edges(&self, node_id: &str) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| e.from == node_id).collect()
    }

    pub fn in_edges(&self, node_id: &str) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| e.to == node_id).collect()
    }

    /// Destino resuelto de una ruta de gate.
    pub fn resolve_route(&self, gate_node_id: &str, label: &str) -> Option<&RouteDestination> {
        self.route_resolution.get(&(gate_node_id.to_string(), label.to_string()))
    }

    /// Destino de fallthrough de continue para un gate. Falla cerrado cuando
    /// hay más de un destino de procesamiento posible.
    pub fn continue_target(&self, gate_node_id: &str) -> Result<&String, EngineError> {
        if self.ambiguous_continue.contains(gate_node_id) {
            return Err(EngineError::Config(format!(
                "gate {gate_node_id} emitted continue but has multiple processing targets; failing closed"
            )));
        }
        self.continue_targets
            .get(gate_node_id)
            .ok_or_else(|| EngineError::MissingEdge { node_id: gate_node_id.to_string(),
                                                      label: "continue".to_string() })
    }

    /// Orden topológico de todos los nodos; reporta el ciclo si existe.
    pub(crate) fn topological_order(&self) -> Result<Vec<String>, GraphValidationError> {
        let mut in_degree: HashMap<&str, usize> = self.nodes.keys().map(|n| (n.as_str(), 0)).collect();
        for edge in &self.edges {
            if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                *d += 1;
            }
        }
        let mut queue: Vec<&str> = self.nodes
                                       .keys()
                                       .map(|n| n.as_str())
                                       .filter(|n| in_degree[*n] == 0)
                                       .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop() {
            order.push(node.to_string());
            for edge in self.edges.iter().filter(|e| e.from == node) {
                if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push(edge.to.as_str());
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            let cycle = self.find_cycle_path();
            return Err(GraphValidationError(format!("Pipeline contains a cycle: {}", cycle.join(" -> "))));
        }
        Ok(order)
    }

    /// Extrae un camino de ciclo para el mensaje de error.
    fn find_cycle_path(&self) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut on_stack: HashSet<&str> = HashSet::new();

        fn dfs<'a>(node: &'a str,
                   graph: &'a ExecutionGraph,
                   visited: &mut HashSet<&'a str>,
                   stack: &mut Vec<&'a str>,
                   on_stack: &mut HashSet<&'a str>)
                   -> Option<Vec<String>> {
            visited.insert(node);
            stack.push(node);
            on_stack.insert(node);
            for edge in graph.edges.iter().filter(|e| e.from == node) {
                let next = edge.to.as_str();
                if on_stack.contains(next) {
                    let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                    path.push(next.to_string());
                    return Some(path);
                }
                if !visited.contains(next) {
                    if let Some(path) = dfs(next, graph, visited, stack, on_stack) {
                        return Some(path);
                    }
                }
            }
            stack.pop();
            on_stack.remove(node);
            None
        }

        for node in self.nodes.keys() {
            if !visited.contains(node.as_str()) {
                if let Some(path) = dfs(node.as_str(), self, &mut visited, &mut stack, &mut on_stack) {
                    return path;
                }
            }
        }
        vec!["(unknown)".to_string()]
    }
}
