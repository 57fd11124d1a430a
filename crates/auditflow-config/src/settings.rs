//! Forma YAML de nivel superior y su validación.
//!
//! Las estructuras de wiring (gates, coalesce, agregaciones, triggers) son
//! las del kernel (`auditflow_core::dag`); acá viven las claves que sólo
//! existen a nivel de archivo: sinks nombrados, output_sink, subsistemas
//! (landscape, concurrency, retry, payload_store, checkpoint, rate_limit) y
//! el modo de ejecución.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use auditflow_core::dag::{
    AggregationSettings, CheckpointSettings, CoalesceSettings, ConcurrencySettings, GateSettings, RetrySettings,
    SourceSettings, TransformSettings,
};
use auditflow_core::orchestrator::RunMode;

use crate::env::expand_env_vars;
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkEntry {
    pub plugin: String,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandscapeExportSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sink: Option<String>,
    #[serde(default = "default_export_format")]
    pub format: String,
    #[serde(default)]
    pub sign: bool,
}

fn default_export_format() -> String {
    "csv".to_string()
}

impl Default for LandscapeExportSettings {
    fn default() -> Self {
        Self { enabled: false,
               sink: None,
               format: default_export_format(),
               sign: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandscapeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// "memory" para corridas efímeras, "postgresql" para durables.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub export: LandscapeExportSettings,
}

fn default_true() -> bool {
    true
}

fn default_backend() -> String {
    "memory".to_string()
}

impl Default for LandscapeSettings {
    fn default() -> Self {
        Self { enabled: true,
               backend: default_backend(),
               url: None,
               export: LandscapeExportSettings::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadStoreSettings {
    #[serde(default = "default_payload_backend")]
    pub backend: String,
    #[serde(default = "default_payload_path")]
    pub base_path: String,
    #[serde(default = "default_retention")]
    pub retention_days: u32,
}

fn default_payload_backend() -> String {
    "filesystem".to_string()
}

fn default_payload_path() -> String {
    ".auditflow/payloads".to_string()
}

fn default_retention() -> u32 {
    90
}

impl Default for PayloadStoreSettings {
    fn default() -> Self {
        Self { backend: default_payload_backend(),
               base_path: default_payload_path(),
               retention_days: default_retention() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRateLimit {
    pub requests_per_second: u32,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rps")]
    pub default_requests_per_second: u32,
    #[serde(default)]
    pub default_requests_per_minute: Option<u32>,
    #[serde(default)]
    pub persistence_path: Option<String>,
    #[serde(default)]
    pub services: IndexMap<String, ServiceRateLimit>,
}

fn default_rps() -> u32 {
    10
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { enabled: true,
               default_requests_per_second: default_rps(),
               default_requests_per_minute: None,
               persistence_path: None,
               services: IndexMap::new() }
    }
}

impl RateLimitSettings {
    /// Config efectiva de un servicio, con fallback a los defaults.
    pub fn service_config(&self, service: &str) -> ServiceRateLimit {
        self.services.get(service).cloned().unwrap_or(ServiceRateLimit {
            requests_per_second: self.default_requests_per_second,
            requests_per_minute: self.default_requests_per_minute,
        })
    }
}

/// `coalesce.branches` acepta lista (ramas identidad) o mapa rama→conexión.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BranchesSpec {
    List(Vec<String>),
    Map(IndexMap<String, String>),
}

impl BranchesSpec {
    pub fn into_map(self) -> IndexMap<String, String> {
        match self {
            BranchesSpec::List(items) => items.into_iter().map(|b| (b.clone(), b)).collect(),
            BranchesSpec::Map(map) => map,
        }
    }
}

/// Entrada de coalesce a nivel de archivo (branches flexible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceEntry {
    pub name: String,
    pub branches: BranchesSpec,
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub merge: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub quorum_count: Option<usize>,
    #[serde(default)]
    pub select_branch: Option<String>,
    #[serde(default)]
    pub on_success: Option<String>,
}

impl CoalesceEntry {
    fn into_settings(self) -> Result<CoalesceSettings, ConfigError> {
        let policy = match self.policy.as_deref() {
            None | Some("require_all") => auditflow_core::dag::CoalescePolicy::RequireAll,
            Some("quorum") => auditflow_core::dag::CoalescePolicy::Quorum,
            Some("best_effort") => auditflow_core::dag::CoalescePolicy::BestEffort,
            Some("first") => auditflow_core::dag::CoalescePolicy::First,
            Some(other) => {
                return Err(ConfigError::Invalid(format!("coalesce '{}': unknown policy '{other}'", self.name)));
            }
        };
        let merge = match self.merge.as_deref() {
            None | Some("union") => auditflow_core::dag::MergeStrategy::Union,
            Some("nested") => auditflow_core::dag::MergeStrategy::Nested,
            Some("select") => auditflow_core::dag::MergeStrategy::Select,
            Some(other) => {
                return Err(ConfigError::Invalid(format!("coalesce '{}': unknown merge '{other}'", self.name)));
            }
        };
        Ok(CoalesceSettings { name: self.name,
                              branches: self.branches.into_map(),
                              policy,
                              merge,
                              timeout_seconds: self.timeout_seconds,
                              quorum_count: self.quorum_count,
                              select_branch: self.select_branch,
                              on_success: self.on_success })
    }
}

/// Configuración completa del pipeline (forma YAML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub datasource: SourceSettings,
    pub sinks: IndexMap<String, SinkEntry>,
    pub output_sink: String,
    #[serde(default)]
    pub row_plugins: Vec<TransformSettings>,
    #[serde(default)]
    pub gates: Vec<GateSettings>,
    #[serde(default)]
    pub coalesce: Vec<CoalesceEntry>,
    #[serde(default)]
    pub aggregations: Vec<AggregationSettings>,
    #[serde(default)]
    pub landscape: LandscapeSettings,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub payload_store: PayloadStoreSettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default = "default_run_mode")]
    pub run_mode: RunMode,
    #[serde(default)]
    pub replay_source_run_id: Option<String>,
}

fn default_run_mode() -> RunMode {
    RunMode::Live
}

impl PipelineSettings {
    /// Validaciones que requieren la forma completa del archivo.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sinks.is_empty() {
            return Err(ConfigError::Invalid("at least one sink is required".to_string()));
        }
        if !self.sinks.contains_key(&self.output_sink) {
            return Err(ConfigError::Invalid(format!("output_sink '{}' not found in sinks. Available sinks: {:?}",
                                                    self.output_sink,
                                                    self.sinks.keys().collect::<Vec<_>>())));
        }
        if self.landscape.export.enabled {
            match &self.landscape.export.sink {
                None => {
                    return Err(ConfigError::Invalid("landscape.export.sink is required when export is enabled".to_string()));
                }
                Some(sink) if !self.sinks.contains_key(sink) => {
                    return Err(ConfigError::Invalid(format!("landscape.export.sink '{sink}' not found in sinks")));
                }
                Some(_) => {}
            }
        }
        let mut agg_names = std::collections::HashSet::new();
        for agg in &self.aggregations {
            if !agg_names.insert(&agg.name) {
                return Err(ConfigError::Invalid(format!("duplicate aggregation name: '{}'", agg.name)));
            }
            agg.validate().map_err(ConfigError::Engine)?;
        }
        for gate in &self.gates {
            gate.validate().map_err(ConfigError::Engine)?;
        }
        self.checkpoint.validate().map_err(ConfigError::Engine)?;
        if matches!(self.run_mode, RunMode::Replay | RunMode::Verify) && self.replay_source_run_id.is_none() {
            return Err(ConfigError::Invalid(format!("replay_source_run_id is required when run_mode is '{:?}'",
                                                    self.run_mode)));
        }
        Ok(())
    }

    pub fn coalesce_settings(&self) -> Result<Vec<CoalesceSettings>, ConfigError> {
        let mut out = Vec::with_capacity(self.coalesce.len());
        for entry in &self.coalesce {
            let settings = entry.clone().into_settings()?;
            settings.validate().map_err(ConfigError::Engine)?;
            out.push(settings);
        }
        Ok(out)
    }
}

/// Carga y valida un archivo YAML con expansión de variables de entorno.
pub fn load_settings(path: &Path) -> Result<PipelineSettings, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let raw: serde_yaml::Value = serde_yaml::from_str(&text)?;
    let expanded = expand_env_vars(raw);
    let settings: PipelineSettings = serde_yaml::from_value(expanded)?;
    settings.validate()?;
    Ok(settings)
}
