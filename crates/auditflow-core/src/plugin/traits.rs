//! Traits de capacidad para los cuatro roles de plugin.

use auditflow_domain::{PipelineRow, SchemaContract};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

use super::context::PluginContext;
use super::results::{ArtifactDescriptor, GateResult, PluginError, TransformResult};
use crate::model::Determinism;

/// Fuente de filas. Exactamente una por run.
pub trait SourcePlugin: Send {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    /// Config del plugin (hasheada para el node_id).
    fn config(&self) -> Value;

    fn determinism(&self) -> Determinism {
        Determinism::IoRead
    }

    /// Contrato de salida declarado (None para fuentes observed).
    fn output_contract(&self) -> Option<Arc<SchemaContract>>;

    /// Destino de filas que fallan validación: nombre de sink o "discard".
    fn on_validation_failure(&self) -> &str;

    fn on_start(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Próxima fila, o None al agotarse.
    fn read(&mut self) -> Result<Option<IndexMap<String, Value>>, PluginError>;

    fn close(&mut self) {}
}

/// Transform de fila única o de lote (batch-aware).
pub trait TransformPlugin: Send {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn config(&self) -> Value;

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_contract(&self) -> Option<Arc<SchemaContract>> {
        None
    }

    fn output_contract(&self) -> Option<Arc<SchemaContract>> {
        None
    }

    /// Destino de errores de procesamiento: sink, "discard" o None.
    /// None + resultado Error es un error de programación (el motor corta).
    fn on_error(&self) -> Option<&str> {
        None
    }

    /// Gobierna el despacho: true ⇒ el motor llama `process_batch`.
    fn is_batch_aware(&self) -> bool {
        false
    }

    fn on_start(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    fn process(&mut self, row: PipelineRow, ctx: &mut PluginContext) -> Result<TransformResult, PluginError>;

    /// Procesamiento de lote; sólo se invoca cuando `is_batch_aware()`.
    fn process_batch(&mut self, _rows: Vec<PipelineRow>, _ctx: &mut PluginContext) -> Result<TransformResult, PluginError> {
        Err(PluginError::Fatal(format!("transform '{}' is not batch-aware", self.name())))
    }

    fn close(&mut self) {}
}

/// Gate basado en plugin: decide ruteo por fila.
pub trait GatePlugin: Send {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn config(&self) -> Value;

    fn input_contract(&self) -> Option<Arc<SchemaContract>> {
        None
    }

    fn evaluate(&mut self, row: PipelineRow, ctx: &mut PluginContext) -> Result<GateResult, PluginError>;

    fn close(&mut self) {}
}

/// Sink de salida. Recibe mapeos planos, nunca fila+contrato.
pub trait SinkPlugin: Send {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn config(&self) -> Value;

    fn determinism(&self) -> Determinism {
        Determinism::IoWrite
    }

    fn input_contract(&self) -> Option<Arc<SchemaContract>> {
        None
    }

    fn on_start(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    fn write(&mut self, rows: &[IndexMap<String, Value>], ctx: &mut PluginContext) -> Result<ArtifactDescriptor, PluginError>;

    fn close(&mut self) {}
}
