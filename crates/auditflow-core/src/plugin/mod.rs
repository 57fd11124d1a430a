//! Contratos de plugin: los cuatro roles y su contexto.
//!
//! Los plugins son colaboradores externos del kernel. El contrato es
//! estrecho a propósito:
//! - El motor envuelve cada llamada con grabación de auditoría (executors).
//! - Los fallos de negocio fluyen como variante `Error` de los resultados
//!   (configurables vía on_error); los bugs y señales de control son
//!   `PluginError` y los maneja el motor.
//! - Los sinks reciben SIEMPRE mapeos planos, nunca el par fila+contrato.

mod context;
mod registry;
mod results;
mod traits;

pub use context::PluginContext;
pub use registry::PluginRegistry;
pub use results::{ArtifactDescriptor, AuditFields, GateResult, PluginError, TransformResult};
pub use traits::{GatePlugin, SinkPlugin, SourcePlugin, TransformPlugin};
