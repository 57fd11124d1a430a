//! Entidades del landscape como uniones etiquetadas.
//!
//! Cada entidad persiste en el `AuditStore` y se reconstruye estricta por la
//! capa de repositorios: variantes desconocidas o columnas inconsistentes son
//! errores de corrupción, nunca coerciones silenciosas.

mod artifact;
mod batch;
mod call;
mod edge;
mod node;
mod outcome;
mod routing;
mod row;
mod run;
mod state;
mod token;

pub use artifact::ArtifactRecord;
pub use batch::{Batch, BatchMember, BatchStatus, TriggerType};
pub use call::{CallRecord, CallStatus, CallType};
pub use edge::{Edge, RoutingMode};
pub use node::{Determinism, NodeKind, NodeRecord};
pub use outcome::{RowOutcome, TokenOutcome};
pub use routing::{RoutingAction, RoutingEvent};
pub use row::RowRecord;
pub use run::{ExportStatus, ReproducibilityGrade, RunRecord, RunStatus};
pub use state::{NodeState, NodeStateCommon};
pub use token::{Token, TokenInfo, TokenParent};
