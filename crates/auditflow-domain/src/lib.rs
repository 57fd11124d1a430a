// auditflow-domain library entry point
pub mod contract;
pub mod errors;
pub mod field;
pub mod row;
pub use contract::{ContractMode, SchemaContract};
pub use errors::DomainError;
pub use field::{FieldContract, FieldSource, FieldType};
pub use row::PipelineRow;
