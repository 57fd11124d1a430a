//! Transforms de referencia: passthrough, normalización de un campo y un
//! agregador batch-aware de estadísticas.

use auditflow_core::plugin::{PluginContext, PluginError, TransformPlugin, TransformResult};
use auditflow_domain::PipelineRow;
use indexmap::IndexMap;
use serde_json::Value;

/// Deja la fila intacta. Útil como eslabón neutro y en tests.
pub struct PassthroughTransform {
    options: Value,
}

impl PassthroughTransform {
    pub fn from_options(options: &Value) -> Self {
        Self { options: options.clone() }
    }
}

impl TransformPlugin for PassthroughTransform {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn config(&self) -> Value {
        self.options.clone()
    }

    fn process(&mut self, row: PipelineRow, _ctx: &mut PluginContext) -> Result<TransformResult, PluginError> {
        Ok(TransformResult::success(row.to_dict()))
    }
}

/// Pasa a mayúsculas el campo configurado. Campo ausente ⇒ resultado Error
/// (fallo de procesamiento legítimo, ruteable vía on_error).
pub struct FieldUppercaseTransform {
    options: Value,
    field: String,
}

impl FieldUppercaseTransform {
    pub fn from_options(options: &Value) -> Result<Self, auditflow_core::EngineError> {
        let field = options.get("field")
                           .and_then(|f| f.as_str())
                           .ok_or_else(|| auditflow_core::EngineError::Config("uppercase transform requires 'field'".to_string()))?
                           .to_string();
        Ok(Self { options: options.clone(),
                  field })
    }
}

impl TransformPlugin for FieldUppercaseTransform {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn config(&self) -> Value {
        self.options.clone()
    }

    fn process(&mut self, row: PipelineRow, _ctx: &mut PluginContext) -> Result<TransformResult, PluginError> {
        let mut data = row.to_dict();
        match data.get(&self.field) {
            Some(Value::String(s)) => {
                let upper = s.to_uppercase();
                data.insert(self.field.clone(), Value::String(upper));
                Ok(TransformResult::success(data))
            }
            Some(other) => Ok(TransformResult::error(serde_json::json!({
                                  "reason": "field is not a string",
                                  "field": self.field,
                                  "value": other,
                              }))),
            None => Ok(TransformResult::error(serde_json::json!({
                           "reason": "field missing",
                           "field": self.field,
                       }))),
        }
    }
}

/// Agregador batch-aware: una fila resumen por lote con conteo y sumas de
/// los campos numéricos configurados.
pub struct BatchStatsTransform {
    options: Value,
    fields: Vec<String>,
}

impl BatchStatsTransform {
    pub fn from_options(options: &Value) -> Self {
        let fields = options.get("fields")
                            .and_then(|f| f.as_array())
                            .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                            .unwrap_or_default();
        Self { options: options.clone(),
               fields }
    }
}

impl TransformPlugin for BatchStatsTransform {
    fn name(&self) -> &str {
        "batch_stats"
    }

    fn config(&self) -> Value {
        self.options.clone()
    }

    fn is_batch_aware(&self) -> bool {
        true
    }

    fn process(&mut self, _row: PipelineRow, _ctx: &mut PluginContext) -> Result<TransformResult, PluginError> {
        Err(PluginError::Fatal("batch_stats only supports batch dispatch".to_string()))
    }

    fn process_batch(&mut self, rows: Vec<PipelineRow>, _ctx: &mut PluginContext) -> Result<TransformResult, PluginError> {
        let mut summary: IndexMap<String, Value> = IndexMap::new();
        summary.insert("row_count".to_string(), Value::from(rows.len() as u64));
        for field in &self.fields {
            let mut sum = 0.0;
            let mut seen = 0u64;
            for row in &rows {
                if let Some(value) = row.get(field).and_then(|v| v.as_f64()) {
                    sum += value;
                    seen += 1;
                }
            }
            let sum_value = serde_json::Number::from_f64(sum)
                .ok_or_else(|| PluginError::Fatal(format!("sum of field '{field}' is not representable")))?;
            summary.insert(format!("{field}_sum"), Value::Number(sum_value));
            summary.insert(format!("{field}_count"), Value::from(seen));
        }
        Ok(TransformResult::success(summary))
    }
}
