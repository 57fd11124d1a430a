//! Módulo recorder: almacén de auditoría, grabador tipado y repositorios.
//!
//! - `store`: trait `AuditStore` con filas crudas + backend en memoria. El
//!   backend Postgres vive en `auditflow-persistence` e implementa el mismo
//!   trait.
//! - `recorder`: `LandscapeRecorder`, los creadores tipados y las queries de
//!   linaje con orden garantizado.
//! - `repos`: parseo estricto fila cruda → valor de dominio (errores de
//!   corrupción, nunca coerciones).
//! - `payload`: blobs direccionados por contenido referenciados desde el
//!   landscape.

pub mod payload;
pub mod repos;
#[allow(clippy::module_inception)]
pub mod recorder;
pub mod store;

pub use payload::{FilesystemPayloadStore, InMemoryPayloadStore, PayloadStore};
pub use recorder::{LandscapeRecorder, RoutingSpec, RowLineage, StateCompletion};
pub use store::{AuditStore, InMemoryAuditStore};
