//! auditflow-adapters: plugins concretos sobre los contratos del kernel.
//!
//! Sources, transforms y sinks chicos y autocontenidos, pensados para
//! pipelines de archivo y para los tests de integración del motor. Cada
//! plugin declara su config (hasheada en el node_id) y su contrato.

pub mod registry;
pub mod sinks;
pub mod sources;
pub mod transforms;

pub use registry::default_registry;
pub use sinks::{CsvSink, JsonLinesSink, MemorySink, SharedRows};
pub use sources::{CsvLocalSource, InlineSource};
pub use transforms::{BatchStatsTransform, FieldUppercaseTransform, PassthroughTransform};
