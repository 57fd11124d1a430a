//! Módulo DAG: settings de wiring, grafo compilado y builder.

mod builder;
mod graph;
mod settings;
mod suggest;

pub use builder::{build_execution_graph, NodeDescriptor};
pub use graph::{ExecutionGraph, GraphEdge, GraphValidationError, NodeInfo, RouteDestination};
pub use settings::{
    AggregationSettings, CheckpointFrequency, CheckpointSettings, CoalescePolicy, CoalesceSettings, ConcurrencySettings,
    GateSettings, MergeStrategy, RetrySettings, SourceSettings, TransformSettings, TriggerSettings,
};
pub use suggest::suggest_similar;
