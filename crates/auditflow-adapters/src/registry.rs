//! Registro por defecto con todos los plugins de este crate.

use auditflow_core::plugin::PluginRegistry;

use crate::sinks::{CsvSink, JsonLinesSink, MemorySink};
use crate::sources::{CsvLocalSource, InlineSource};
use crate::transforms::{BatchStatsTransform, FieldUppercaseTransform, PassthroughTransform};

/// Construye el registro con los plugins de referencia.
pub fn default_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();

    registry.register_source("csv_local", |options| Ok(Box::new(CsvLocalSource::from_options(options)?)));
    registry.register_source("inline", |options| Ok(Box::new(InlineSource::from_options(options)?)));

    registry.register_transform("passthrough", |options| Ok(Box::new(PassthroughTransform::from_options(options))));
    registry.register_transform("uppercase", |options| Ok(Box::new(FieldUppercaseTransform::from_options(options)?)));
    registry.register_transform("batch_stats", |options| Ok(Box::new(BatchStatsTransform::from_options(options))));

    registry.register_sink("csv", |options| Ok(Box::new(CsvSink::from_options(options)?)));
    registry.register_sink("json_lines", |options| Ok(Box::new(JsonLinesSink::from_options(options)?)));
    registry.register_sink("memory", |options| Ok(Box::new(MemorySink::from_options(options))));

    registry
}
