//! auditflow-core: núcleo de ejecución auditable (Sense/Decide/Act)
//!
//! Propósito:
//! - Ejecutar un DAG declarativo de transforms, gates, agregaciones,
//!   fork/coalesce y sinks sobre filas estructuradas, registrando cada fila,
//!   decisión de ruteo y llamada externa en un almacén append-only.
//! - Garantizar que cualquier salida sea trazable hasta sus entradas y su
//!   configuración, y que una corrida interrumpida pueda reanudarse desde un
//!   checkpoint sin perder ni duplicar trabajo.
//!
//! Componentes principales:
//! - `hashing`: canonicalización JSON y hashes deterministas (identidad de
//!   payloads, configs y contratos).
//! - `model`: entidades de auditoría como uniones etiquetadas (nodos, edges,
//!   tokens, estados, eventos de ruteo, llamadas, lotes, outcomes, runs).
//! - `recorder`: el grabador tipado sobre un `AuditStore` (in-memory aquí,
//!   Postgres en `auditflow-persistence`) más la capa de repositorios que
//!   re-parsea filas persistidas a valores estrictos.
//! - `dag`: compilación de configuración a grafo tipado con edges resueltos,
//!   ids deterministas y propagación de esquemas.
//! - `tokens`: ciclo de vida de tokens (create/fork/coalesce/expand).
//! - `executors`: wrappers Transform/Gate/Aggregation/Sink que envuelven cada
//!   llamada de plugin con grabación de auditoría.
//! - `coalesce`: barrera de join con políticas y estrategias de merge.
//! - `pool`: ejecutor por filas con pool acotado y reintentos por capacidad.
//! - `checkpoint`: snapshot versionado + recuperación de filas sin procesar.
//! - `orchestrator`: el driver que recorre el grafo en orden topológico.

pub mod checkpoint;
pub mod coalesce;
pub mod constants;
pub mod dag;
pub mod errors;
pub mod executors;
pub mod expr;
pub mod hashing;
pub mod model;
pub mod orchestrator;
pub mod plugin;
pub mod pool;
pub mod recorder;
pub mod replay;
pub mod tokens;

// Re-exports públicos principales
pub use errors::{classify_error, EngineError, ErrorClass};
pub use hashing::{hash_str, hash_value, to_canonical_json};
pub use model::{
    ArtifactRecord, Batch, BatchMember, BatchStatus, CallRecord, CallStatus, CallType, Determinism, Edge, NodeKind,
    NodeRecord, NodeState, RoutingAction, RoutingEvent, RoutingMode, RowOutcome, RowRecord, RunRecord, RunStatus, Token,
    TokenInfo, TokenOutcome, TokenParent, TriggerType,
};
pub use recorder::{AuditStore, InMemoryAuditStore, LandscapeRecorder, PayloadStore};
pub use dag::{ExecutionGraph, GraphValidationError};
pub use orchestrator::{Orchestrator, PipelineDefinition, RunMode, RunSettings, RunSummary};
pub use plugin::{
    ArtifactDescriptor, GatePlugin, GateResult, PluginContext, PluginRegistry, SinkPlugin, SourcePlugin, TransformPlugin,
    TransformResult,
};
