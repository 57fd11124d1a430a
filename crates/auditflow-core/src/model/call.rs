//! Llamadas externas hechas durante la ejecución de un nodo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Llm,
    Http,
    HttpRedirect,
    Sql,
    Filesystem,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Llm => "llm",
            CallType::Http => "http",
            CallType::HttpRedirect => "http_redirect",
            CallType::Sql => "sql",
            CallType::Filesystem => "filesystem",
        }
    }

    pub fn parse(s: &str) -> Option<CallType> {
        match s {
            "llm" => Some(CallType::Llm),
            "http" => Some(CallType::Http),
            "http_redirect" => Some(CallType::HttpRedirect),
            "sql" => Some(CallType::Sql),
            "filesystem" => Some(CallType::Filesystem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<CallStatus> {
        match s {
            "success" => Some(CallStatus::Success),
            "error" => Some(CallStatus::Error),
            _ => None,
        }
    }
}

/// Registro de llamada externa.
///
/// `call_index` lo asigna el recorder con un contador atómico por padre
/// (state_id): los plugins no eligen índices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: Uuid,
    pub state_id: Uuid,
    pub call_index: u32,
    pub call_type: CallType,
    pub status: CallStatus,
    pub request_hash: String,
    pub request_ref: Option<String>,
    pub response_hash: Option<String>,
    pub response_ref: Option<String>,
    pub error: Option<Value>,
    pub latency_ms: f64,
    pub created_at: DateTime<Utc>,
}
