//! Registro de run: cabecera del landscape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    Completed,
    Failed,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Pending => "pending",
            ExportStatus::Completed => "completed",
            ExportStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<ExportStatus> {
        match s {
            "pending" => Some(ExportStatus::Pending),
            "completed" => Some(ExportStatus::Completed),
            "failed" => Some(ExportStatus::Failed),
            _ => None,
        }
    }
}

/// Grado de reproducibilidad del run, derivado de las clases de determinismo
/// de los nodos registrados.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReproducibilityGrade {
    Full,
    Partial,
    NonReproducible,
}

impl ReproducibilityGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReproducibilityGrade::Full => "full",
            ReproducibilityGrade::Partial => "partial",
            ReproducibilityGrade::NonReproducible => "non_reproducible",
        }
    }

    pub fn parse(s: &str) -> Option<ReproducibilityGrade> {
        match s {
            "full" => Some(ReproducibilityGrade::Full),
            "partial" => Some(ReproducibilityGrade::Partial),
            "non_reproducible" => Some(ReproducibilityGrade::NonReproducible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub config_hash: String,
    pub settings_json: Value,
    pub canonical_version: String,
    pub status: RunStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub reproducibility: ReproducibilityGrade,
    pub export_status: Option<ExportStatus>,
    pub export_metadata: Option<Value>,
}
