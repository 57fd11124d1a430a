//! Executors: los cuatro wrappers que envuelven cada llamada de plugin con
//! grabación de auditoría.
//!
//! Regla compartida: el estado de nodo SIEMPRE se abre antes de invocar al
//! plugin y SIEMPRE se cierra (completed/pending/failed) pase lo que pase.
//! El estado terminal de la fila se DERIVA de routing events, outcomes y
//! estados en sinks; nunca se guarda en el status del estado de un gate.

mod aggregation;
mod gate;
mod sink;
mod transform;
mod triggers;

pub use aggregation::{AggregationExecutor, FlushOutcome};
pub use gate::{GateDestination, GateExecutor, GateOutcome};
pub use sink::SinkExecutor;
pub use transform::{TransformExecutor, TransformOutcome};
pub use triggers::TriggerEvaluator;
