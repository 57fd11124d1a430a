//! Sinks: CSV, JSON Lines y memoria (tests).
//!
//! Los sinks reciben mapeos planos; el descriptor devuelto lleva el hash
//! canónico del contenido escrito para el registro de artifacts.

use auditflow_core::hashing::hash_str;
use auditflow_core::plugin::{ArtifactDescriptor, PluginContext, PluginError, SinkPlugin};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};

fn value_to_csv_field(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Sink CSV: cabecera con las claves de la primera fila, append por llamada.
pub struct CsvSink {
    options: Value,
    path: String,
    wrote_header: bool,
}

impl CsvSink {
    pub fn from_options(options: &Value) -> Result<Self, auditflow_core::EngineError> {
        let path = options.get("path")
                          .and_then(|p| p.as_str())
                          .ok_or_else(|| auditflow_core::EngineError::Config("csv sink requires 'path'".to_string()))?
                          .to_string();
        Ok(Self { path,
                  options: options.clone(),
                  wrote_header: false })
    }
}

impl SinkPlugin for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn config(&self) -> Value {
        self.options.clone()
    }

    fn write(&mut self, rows: &[IndexMap<String, Value>], _ctx: &mut PluginContext) -> Result<ArtifactDescriptor, PluginError> {
        if rows.is_empty() {
            return Err(PluginError::Fatal("csv sink received no rows".to_string()));
        }
        let file = std::fs::OpenOptions::new().create(true)
                                              .append(true)
                                              .open(&self.path)
                                              .map_err(|e| PluginError::Fatal(format!("cannot open '{}': {e}", self.path)))?;
        let mut writer = csv::Writer::from_writer(file);
        let headers: Vec<&String> = rows[0].keys().collect();
        if !self.wrote_header {
            writer.write_record(headers.iter().map(|h| h.as_str()))
                  .map_err(|e| PluginError::Fatal(format!("csv header write failed: {e}")))?;
            self.wrote_header = true;
        }
        let mut written = String::new();
        for row in rows {
            let record: Vec<String> = headers.iter()
                                             .map(|h| row.get(*h).map(value_to_csv_field).unwrap_or_default())
                                             .collect();
            written.push_str(&record.join(","));
            written.push('\n');
            writer.write_record(&record)
                  .map_err(|e| PluginError::Fatal(format!("csv record write failed: {e}")))?;
        }
        writer.flush().map_err(|e| PluginError::Fatal(format!("csv flush failed: {e}")))?;

        let size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(ArtifactDescriptor { artifact_type: "csv".to_string(),
                                path_or_uri: self.path.clone(),
                                content_hash: hash_str(&written),
                                size_bytes: size,
                                idempotency_key: None })
    }
}

/// Sink JSON Lines: un objeto por línea.
pub struct JsonLinesSink {
    options: Value,
    path: String,
}

impl JsonLinesSink {
    pub fn from_options(options: &Value) -> Result<Self, auditflow_core::EngineError> {
        let path = options.get("path")
                          .and_then(|p| p.as_str())
                          .ok_or_else(|| auditflow_core::EngineError::Config("json sink requires 'path'".to_string()))?
                          .to_string();
        Ok(Self { path,
                  options: options.clone() })
    }
}

impl SinkPlugin for JsonLinesSink {
    fn name(&self) -> &str {
        "json_lines"
    }

    fn config(&self) -> Value {
        self.options.clone()
    }

    fn write(&mut self, rows: &[IndexMap<String, Value>], _ctx: &mut PluginContext) -> Result<ArtifactDescriptor, PluginError> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true)
                                                  .append(true)
                                                  .open(&self.path)
                                                  .map_err(|e| PluginError::Fatal(format!("cannot open '{}': {e}", self.path)))?;
        let mut written = String::new();
        for row in rows {
            let mut obj = serde_json::Map::new();
            for (k, v) in row {
                obj.insert(k.clone(), v.clone());
            }
            let line = serde_json::to_string(&Value::Object(obj))
                .map_err(|e| PluginError::Fatal(format!("json serialize failed: {e}")))?;
            written.push_str(&line);
            written.push('\n');
        }
        file.write_all(written.as_bytes())
            .map_err(|e| PluginError::Fatal(format!("json write failed: {e}")))?;
        let size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(ArtifactDescriptor { artifact_type: "json_lines".to_string(),
                                path_or_uri: self.path.clone(),
                                content_hash: hash_str(&written),
                                size_bytes: size,
                                idempotency_key: None })
    }
}

/// Handle compartido a las filas capturadas por un `MemorySink`.
pub type SharedRows = Arc<Mutex<Vec<IndexMap<String, Value>>>>;

/// Sink en memoria: captura filas para inspección en tests.
pub struct MemorySink {
    options: Value,
    label: String,
    rows: SharedRows,
}

impl MemorySink {
    pub fn from_options(options: &Value) -> Self {
        let label = options.get("label").and_then(|l| l.as_str()).unwrap_or("memory").to_string();
        Self { label,
               options: options.clone(),
               rows: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Variante con buffer inyectado, para que el test lea lo escrito.
    pub fn with_shared(options: &Value, rows: SharedRows) -> Self {
        let label = options.get("label").and_then(|l| l.as_str()).unwrap_or("memory").to_string();
        Self { label,
               options: options.clone(),
               rows }
    }

    pub fn rows(&self) -> SharedRows {
        Arc::clone(&self.rows)
    }
}

impl SinkPlugin for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn config(&self) -> Value {
        self.options.clone()
    }

    fn write(&mut self, rows: &[IndexMap<String, Value>], _ctx: &mut PluginContext) -> Result<ArtifactDescriptor, PluginError> {
        let mut guard = self.rows.lock().map_err(|_| PluginError::Fatal("memory sink poisoned".to_string()))?;
        for row in rows {
            guard.push(row.clone());
        }
        let serialized = serde_json::to_string(&rows.iter()
                                                    .map(|r| {
                                                        let mut obj = serde_json::Map::new();
                                                        for (k, v) in r {
                                                            obj.insert(k.clone(), v.clone());
                                                        }
                                                        Value::Object(obj)
                                                    })
                                                    .collect::<Vec<_>>())
            .map_err(|e| PluginError::Fatal(format!("memory sink serialize: {e}")))?;
        Ok(ArtifactDescriptor { artifact_type: "memory".to_string(),
                                path_or_uri: format!("memory://{}", self.label),
                                content_hash: hash_str(&serialized),
                                size_bytes: serialized.len() as u64,
                                idempotency_key: None })
    }
}
