//! auditflow-persistence
//!
//! Backend Postgres (Diesel) del `AuditStore` del kernel, con paridad 1:1
//! respecto al backend en memoria: la capa de repositorios del core hace el
//! mismo parseo estricto sobre las filas que devuelve este crate.
//!
//! Módulos:
//! - `pg`: implementación del trait sobre Postgres (append-only, retry con
//!   backoff en errores transitorios).
//! - `migrations`: runner embebido de migraciones Diesel.
//! - `config`: carga de configuración de conexión desde .env.
//! - `schema`: tablas Diesel declaradas para compilar queries.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_pool, PgAuditStore, PgPool};
