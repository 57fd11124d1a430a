//! Artifacts producidos por sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Artifact registrado en el landscape, ligado al primer estado del grupo de
/// escrituras que lo produjo (linaje).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: Uuid,
    pub run_id: Uuid,
    pub produced_by_state_id: Uuid,
    pub sink_node_id: String,
    pub artifact_type: String,
    pub path_or_uri: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}
