//! Resolución: settings validados → plugins instanciados + definición.

use indexmap::IndexMap;
use serde_json::Value;
use uuid::Uuid;

use auditflow_core::orchestrator::{PipelineDefinition, RunSettings};
use auditflow_core::plugin::PluginRegistry;

use crate::error::ConfigError;
use crate::secrets::{fingerprint_secrets, ALLOW_RAW_ENV, FINGERPRINT_KEY_ENV};
use crate::settings::PipelineSettings;

/// Fingerprinting de un bloque de options antes de instanciar el plugin.
///
/// Con secretos presentes y sin clave ni permiso explícito de secretos
/// crudos, la carga falla nombrando los campos.
fn sanitize_options(options: &Value) -> Result<Value, ConfigError> {
    let key = std::env::var(FINGERPRINT_KEY_ENV).ok();
    let allow_raw = std::env::var(ALLOW_RAW_ENV).map(|v| v == "true").unwrap_or(false);
    let scan = fingerprint_secrets(options, key.as_deref(), allow_raw);
    if !scan.secret_fields.is_empty() && key.is_none() && !allow_raw {
        return Err(ConfigError::SecretFingerprint { fields: scan.secret_fields });
    }
    Ok(scan.options)
}

/// Instancia todos los plugins y arma la definición + settings del run.
pub fn resolve_pipeline(settings: &PipelineSettings,
                        registry: &PluginRegistry)
                        -> Result<(PipelineDefinition, RunSettings), ConfigError> {
    let source_options = sanitize_options(&settings.datasource.options)?;
    let source = registry.create_source(&settings.datasource.plugin, &source_options)?;

    let mut sinks = IndexMap::new();
    for (name, entry) in &settings.sinks {
        let options = sanitize_options(&entry.options)?;
        sinks.insert(name.clone(), registry.create_sink(&entry.plugin, &options)?);
    }

    let mut transforms = Vec::with_capacity(settings.row_plugins.len());
    for ts in &settings.row_plugins {
        let options = sanitize_options(&ts.options)?;
        let plugin = registry.create_transform(&ts.plugin, &options)?;
        transforms.push((ts.clone(), plugin));
    }

    let mut aggregations = Vec::with_capacity(settings.aggregations.len());
    for agg in &settings.aggregations {
        let options = sanitize_options(&agg.options)?;
        let plugin = registry.create_transform(&agg.plugin, &options)?;
        aggregations.push((agg.clone(), plugin));
    }

    let definition = PipelineDefinition { source,
                                          source_settings: settings.datasource.clone(),
                                          transforms,
                                          sinks,
                                          aggregations,
                                          gates: settings.gates.clone(),
                                          coalesces: settings.coalesce_settings()? };

    let replay_source_run_id = match &settings.replay_source_run_id {
        Some(raw) => Some(Uuid::parse_str(raw)
                              .map_err(|_| ConfigError::Invalid(format!("replay_source_run_id is not a valid id: {raw}")))?),
        None => None,
    };

    let run_settings = RunSettings { checkpoint: settings.checkpoint.clone(),
                                     retry: settings.retry.clone(),
                                     concurrency: settings.concurrency.clone(),
                                     run_mode: settings.run_mode,
                                     replay_source_run_id,
                                     ..RunSettings::default() };

    Ok((definition, run_settings))
}
