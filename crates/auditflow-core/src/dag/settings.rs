//! Settings de wiring que consume el builder del grafo.
//!
//! La carga desde YAML (expansión de env, fingerprints de secretos) vive en
//! `auditflow-config`; acá sólo está la forma validable que el kernel
//! entiende. Los validadores de consistencia que requieren el grafo entero
//! (sinks existentes, productores únicos) corren en el builder.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::RESERVED_EDGE_LABELS;
use crate::errors::EngineError;
use crate::expr::ExpressionParser;

/// Trigger de una agregación. Al menos uno de los tres debe configurarse;
/// end_of_source es implícito y no se configura.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TriggerSettings {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub condition: Option<String>,
}

impl TriggerSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.count.is_none() && self.timeout_seconds.is_none() && self.condition.is_none() {
            return Err(EngineError::Config("at least one trigger must be configured (count, timeout_seconds, or condition)".to_string()));
        }
        if let Some(count) = self.count {
            if count == 0 {
                return Err(EngineError::Config("trigger count must be greater than zero".to_string()));
            }
        }
        if let Some(t) = self.timeout_seconds {
            if t <= 0.0 {
                return Err(EngineError::Config("trigger timeout_seconds must be greater than zero".to_string()));
            }
        }
        if let Some(cond) = &self.condition {
            ExpressionParser::compile(cond).map_err(|e| EngineError::Config(format!("invalid trigger condition: {e}")))?;
        }
        Ok(())
    }
}

/// Wiring del source: a qué conexión publica y qué pasa con filas inválidas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub plugin: String,
    #[serde(default)]
    pub options: Value,
    /// Conexión o sink al que publica el source.
    pub on_success: String,
    /// Sink de cuarentena para filas que fallan validación, o "discard".
    #[serde(default = "default_discard")]
    pub on_validation_failure: String,
}

fn default_discard() -> String {
    "discard".to_string()
}

/// Wiring de un transform en la cadena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSettings {
    pub name: String,
    pub plugin: String,
    #[serde(default)]
    pub options: Value,
    /// Conexión que consume.
    pub input: String,
    /// Conexión o sink al que publica.
    pub on_success: String,
    /// Sink para resultados de error, o "discard".
    #[serde(default = "default_discard")]
    pub on_error: String,
}

/// Agregación config-driven: buffer estructural + plugin batch-aware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSettings {
    pub name: String,
    pub plugin: String,
    #[serde(default)]
    pub options: Value,
    pub input: String,
    /// None ⇒ publica la conexión con su propio nombre.
    #[serde(default)]
    pub on_success: Option<String>,
    pub trigger: TriggerSettings,
}

impl AggregationSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.trigger.validate().map_err(|e| EngineError::Config(format!("aggregation '{}': {e}", self.name)))
    }
}

/// Gate config-driven: expresión sandbox + mapa de rutas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    pub name: String,
    pub input: String,
    pub condition: String,
    /// label → "continue" | "fork" | nombre de sink | nombre de conexión.
    pub routes: IndexMap<String, String>,
    #[serde(default)]
    pub fork_to: Option<Vec<String>>,
}

impl GateSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        let parser = ExpressionParser::compile(&self.condition)
            .map_err(|e| EngineError::Config(format!("gate '{}': {e}", self.name)))?;

        if self.routes.is_empty() {
            return Err(EngineError::Config(format!("gate '{}': routes must have at least one entry", self.name)));
        }
        for label in self.routes.keys() {
            if RESERVED_EDGE_LABELS.contains(&label.as_str()) {
                return Err(EngineError::Config(format!("gate '{}': route label '{label}' is reserved", self.name)));
            }
        }
        if let Some(fork_to) = &self.fork_to {
            for branch in fork_to {
                if RESERVED_EDGE_LABELS.contains(&branch.as_str()) {
                    return Err(EngineError::Config(format!("gate '{}': fork branch '{branch}' is reserved", self.name)));
                }
            }
        }

        // fork_to ⟺ alguna ruta con destino "fork".
        let has_fork_route = self.routes.values().any(|d| d == "fork");
        if has_fork_route && self.fork_to.as_ref().map(|f| f.is_empty()).unwrap_or(true) {
            return Err(EngineError::Config(format!("gate '{}': fork_to is required when any route destination is 'fork'",
                                                   self.name)));
        }
        if self.fork_to.is_some() && !has_fork_route {
            return Err(EngineError::Config(format!("gate '{}': fork_to is only valid when a route destination is 'fork'",
                                                   self.name)));
        }

        // Expresiones booleanas rutean exactamente {true, false}.
        if parser.is_boolean_expression() {
            let labels: std::collections::BTreeSet<&str> = self.routes.keys().map(|s| s.as_str()).collect();
            let expected: std::collections::BTreeSet<&str> = ["true", "false"].into_iter().collect();
            if labels != expected {
                return Err(EngineError::Config(format!(
                    "gate '{}' has a boolean condition ({:?}) but route labels {:?} don't match; boolean expressions \
                     evaluate to true/false. Use routes: {{\"true\": <destination>, \"false\": <destination>}}",
                    self.name,
                    self.condition,
                    labels.into_iter().collect::<Vec<_>>()
                )));
            }
        }
        Ok(())
    }
}

/// Política de espera de un coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    RequireAll,
    Quorum,
    BestEffort,
    First,
}

/// Estrategia de merge de un coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Union,
    Nested,
    Select,
}

/// Punto de unión de ramas de fork.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceSettings {
    pub name: String,
    /// rama → conexión de entrada. Identidad cuando coinciden; transformada
    /// cuando la conexión difiere del nombre de la rama.
    pub branches: IndexMap<String, String>,
    #[serde(default = "default_policy")]
    pub policy: CoalescePolicy,
    #[serde(default = "default_merge")]
    pub merge: MergeStrategy,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub quorum_count: Option<usize>,
    #[serde(default)]
    pub select_branch: Option<String>,
    /// Sink de salida del token fusionado (None ⇒ publica conexión propia).
    #[serde(default)]
    pub on_success: Option<String>,
}

fn default_policy() -> CoalescePolicy {
    CoalescePolicy::RequireAll
}

fn default_merge() -> MergeStrategy {
    MergeStrategy::Union
}

impl CoalesceSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.branches.len() < 2 {
            return Err(EngineError::Config(format!("coalesce '{}': at least two branches are required", self.name)));
        }
        match self.policy {
            CoalescePolicy::Quorum => {
                let quorum = self.quorum_count
                                 .ok_or_else(|| EngineError::Config(format!("coalesce '{}': quorum policy requires quorum_count",
                                                                            self.name)))?;
                if quorum == 0 || quorum > self.branches.len() {
                    return Err(EngineError::Config(format!(
                        "coalesce '{}': quorum_count ({quorum}) must be between 1 and the number of branches ({})",
                        self.name,
                        self.branches.len()
                    )));
                }
            }
            CoalescePolicy::BestEffort => {
                if self.timeout_seconds.is_none() {
                    return Err(EngineError::Config(format!("coalesce '{}': best_effort policy requires timeout_seconds",
                                                           self.name)));
                }
            }
            _ => {}
        }
        if self.merge == MergeStrategy::Select {
            let select = self.select_branch
                             .as_ref()
                             .ok_or_else(|| EngineError::Config(format!("coalesce '{}': select merge requires select_branch",
                                                                        self.name)))?;
            if !self.branches.contains_key(select) {
                return Err(EngineError::Config(format!(
                    "coalesce '{}': select_branch '{select}' must be one of the expected branches: {:?}",
                    self.name,
                    self.branches.keys().collect::<Vec<_>>()
                )));
            }
        }
        Ok(())
    }
}

/// Cadencia de checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFrequency {
    EveryRow,
    EveryN,
    AggregationOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_frequency")]
    pub frequency: CheckpointFrequency,
    #[serde(default)]
    pub checkpoint_interval: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_frequency() -> CheckpointFrequency {
    CheckpointFrequency::EveryRow
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self { enabled: true,
               frequency: CheckpointFrequency::EveryRow,
               checkpoint_interval: None }
    }
}

impl CheckpointSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.frequency == CheckpointFrequency::EveryN {
            match self.checkpoint_interval {
                Some(n) if n > 0 => {}
                _ => {
                    return Err(EngineError::Config("checkpoint_interval required when frequency='every_n'".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Reintentos de transforms retryables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3,
               initial_delay_seconds: 1.0,
               max_delay_seconds: 60.0 }
    }
}

/// Concurrencia del pool de ejecución por filas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    #[serde(default = "default_workers")]
    pub max_workers: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}
