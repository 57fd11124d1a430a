//! Demo binario: un pipeline inline con gate booleano y store en memoria.
//!
//! Muestra el flujo completo sin YAML ni base de datos: source inline →
//! transform passthrough → gate por monto → sinks en memoria, y al final
//! imprime el linaje de cada fila desde el landscape.

use std::process::ExitCode;
use std::sync::Arc;

use auditflow_adapters::{InlineSource, MemorySink, PassthroughTransform};
use auditflow_core::dag::{GateSettings, SourceSettings, TransformSettings};
use auditflow_core::recorder::{InMemoryAuditStore, LandscapeRecorder};
use auditflow_core::{Orchestrator, PipelineDefinition, RunSettings};
use indexmap::IndexMap;

fn main() -> ExitCode {
    env_logger::init();

    let source_options = serde_json::json!({
        "rows": [
            {"id": "1", "amount": 1500},
            {"id": "2", "amount": 10},
            {"id": "3", "amount": 2200},
        ],
    });
    let source = InlineSource::from_options(&source_options).expect("inline source options");

    let high = MemorySink::from_options(&serde_json::json!({"label": "high"}));
    let regular = MemorySink::from_options(&serde_json::json!({"label": "regular"}));
    let high_rows = high.rows();
    let regular_rows = regular.rows();

    let mut sinks: IndexMap<String, Box<dyn auditflow_core::plugin::SinkPlugin>> = IndexMap::new();
    sinks.insert("high_sink".to_string(), Box::new(high));
    sinks.insert("output".to_string(), Box::new(regular));

    let definition = PipelineDefinition {
        source: Box::new(source),
        source_settings: SourceSettings { plugin: "inline".to_string(),
                                          options: source_options,
                                          on_success: "raw_rows".to_string(),
                                          on_validation_failure: "discard".to_string() },
        transforms: vec![(TransformSettings { name: "identity".to_string(),
                                              plugin: "passthrough".to_string(),
                                              options: serde_json::json!({}),
                                              input: "raw_rows".to_string(),
                                              on_success: "checked_rows".to_string(),
                                              on_error: "discard".to_string() },
                         Box::new(PassthroughTransform::from_options(&serde_json::json!({}))))],
        sinks,
        aggregations: vec![],
        gates: vec![GateSettings { name: "amount_gate".to_string(),
                                   input: "checked_rows".to_string(),
                                   condition: "row['amount'] > 1000".to_string(),
                                   routes: [("true".to_string(), "high_sink".to_string()),
                                            ("false".to_string(), "output".to_string())].into_iter().collect(),
                                   fork_to: None }],
        coalesces: vec![],
    };

    let recorder = Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())));
    let orchestrator = Orchestrator::new(definition, RunSettings::default(), Arc::clone(&recorder));

    let summary = match orchestrator.run() {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("run failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("run {} -> {} ({} rows)", summary.run_id, summary.status.as_str(), summary.rows_read);
    println!("high_sink rows: {:?}", high_rows.lock().expect("high rows").len());
    println!("output rows: {:?}", regular_rows.lock().expect("regular rows").len());

    let rows = recorder.get_rows(summary.run_id).expect("rows");
    for row in rows {
        let lineage = recorder.explain_row(row.row_id).expect("lineage");
        println!("row {} -> tokens={} states={} outcomes={:?}",
                 row.row_index,
                 lineage.tokens.len(),
                 lineage.states.len(),
                 lineage.outcomes.iter().map(|o| o.outcome.as_str()).collect::<Vec<_>>());
    }
    ExitCode::SUCCESS
}
