//! Sources: CSV local e inline (filas embebidas en las options).

use auditflow_core::model::Determinism;
use auditflow_core::plugin::{PluginError, SourcePlugin};
use auditflow_domain::SchemaContract;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

fn contract_from_options(options: &Value) -> Option<Arc<SchemaContract>> {
    options.get("schema")
           .and_then(|schema| SchemaContract::from_schema_json(schema).ok())
           .map(Arc::new)
}

fn validation_failure_from_options(options: &Value) -> String {
    options.get("on_validation_failure")
           .and_then(|v| v.as_str())
           .unwrap_or("discard")
           .to_string()
}

/// Source CSV local: una fila por registro, valores como strings.
pub struct CsvLocalSource {
    options: Value,
    path: String,
    contract: Option<Arc<SchemaContract>>,
    on_validation_failure: String,
    reader: Option<csv::StringRecordsIntoIter<std::fs::File>>,
    headers: Vec<String>,
}

impl CsvLocalSource {
    pub fn from_options(options: &Value) -> Result<Self, auditflow_core::EngineError> {
        let path = options.get("path")
                          .and_then(|p| p.as_str())
                          .ok_or_else(|| auditflow_core::EngineError::Config("csv_local source requires 'path'".to_string()))?
                          .to_string();
        Ok(Self { path,
                  contract: contract_from_options(options),
                  on_validation_failure: validation_failure_from_options(options),
                  options: options.clone(),
                  reader: None,
                  headers: Vec::new() })
    }
}

impl SourcePlugin for CsvLocalSource {
    fn name(&self) -> &str {
        "csv_local"
    }

    fn config(&self) -> Value {
        self.options.clone()
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoRead
    }

    fn output_contract(&self) -> Option<Arc<SchemaContract>> {
        self.contract.clone()
    }

    fn on_validation_failure(&self) -> &str {
        &self.on_validation_failure
    }

    fn read(&mut self) -> Result<Option<IndexMap<String, Value>>, PluginError> {
        if self.reader.is_none() {
            let file = std::fs::File::open(&self.path)
                .map_err(|e| PluginError::Fatal(format!("cannot open csv '{}': {e}", self.path)))?;
            let mut reader = csv::Reader::from_reader(file);
            self.headers = reader.headers()
                                 .map_err(|e| PluginError::Fatal(format!("cannot read csv headers: {e}")))?
                                 .iter()
                                 .map(|h| h.to_string())
                                 .collect();
            self.reader = Some(reader.into_records());
        }
        let records = self.reader.as_mut().expect("reader initialized");
        match records.next() {
            None => Ok(None),
            Some(Err(e)) => Err(PluginError::Fatal(format!("csv record error: {e}"))),
            Some(Ok(record)) => {
                let mut row = IndexMap::with_capacity(self.headers.len());
                for (header, field) in self.headers.iter().zip(record.iter()) {
                    row.insert(header.clone(), Value::String(field.to_string()));
                }
                Ok(Some(row))
            }
        }
    }
}

/// Source inline: filas declaradas en `options.rows`. Determinista; útil en
/// demos y tests.
pub struct InlineSource {
    options: Value,
    rows: std::vec::IntoIter<IndexMap<String, Value>>,
    contract: Option<Arc<SchemaContract>>,
    on_validation_failure: String,
}

impl InlineSource {
    pub fn from_options(options: &Value) -> Result<Self, auditflow_core::EngineError> {
        let rows_json = options.get("rows")
                               .and_then(|r| r.as_array())
                               .ok_or_else(|| auditflow_core::EngineError::Config("inline source requires 'rows'".to_string()))?;
        let mut rows = Vec::with_capacity(rows_json.len());
        for row in rows_json {
            let obj = row.as_object()
                         .ok_or_else(|| auditflow_core::EngineError::Config("inline rows must be objects".to_string()))?;
            let mut map = IndexMap::with_capacity(obj.len());
            for (k, v) in obj {
                map.insert(k.clone(), v.clone());
            }
            rows.push(map);
        }
        Ok(Self { contract: contract_from_options(options),
                  on_validation_failure: validation_failure_from_options(options),
                  options: options.clone(),
                  rows: rows.into_iter() })
    }
}

impl SourcePlugin for InlineSource {
    fn name(&self) -> &str {
        "inline"
    }

    fn config(&self) -> Value {
        self.options.clone()
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn output_contract(&self) -> Option<Arc<SchemaContract>> {
        self.contract.clone()
    }

    fn on_validation_failure(&self) -> &str {
        &self.on_validation_failure
    }

    fn read(&mut self) -> Result<Option<IndexMap<String, Value>>, PluginError> {
        Ok(self.rows.next())
    }
}
