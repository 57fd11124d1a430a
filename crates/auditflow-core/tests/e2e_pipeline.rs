//! Escenarios de punta a punta sobre el store en memoria.

use auditflow_adapters::{CsvLocalSource, CsvSink, InlineSource, MemorySink, PassthroughTransform};
use auditflow_core::dag::{GateSettings, SourceSettings, TransformSettings};
use auditflow_core::model::{NodeState, RowOutcome, RunStatus};
use auditflow_core::recorder::{InMemoryAuditStore, LandscapeRecorder};
use auditflow_core::{Orchestrator, PipelineDefinition, RunSettings};
use indexmap::IndexMap;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;

fn recorder() -> Arc<LandscapeRecorder> {
    Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())))
}

/// S1: una fila, passthrough, CSV de entrada y salida.
#[test]
fn single_row_transform_records_full_lineage() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("input.csv");
    let output_path = dir.path().join("output.csv");
    let mut input = std::fs::File::create(&input_path).unwrap();
    writeln!(input, "id,v").unwrap();
    writeln!(input, "1,a").unwrap();

    let source_options = json!({"path": input_path.to_string_lossy()});
    let sink_options = json!({"path": output_path.to_string_lossy()});

    let mut sinks: IndexMap<String, Box<dyn auditflow_core::plugin::SinkPlugin>> = IndexMap::new();
    sinks.insert("csv_out".to_string(), Box::new(CsvSink::from_options(&sink_options).unwrap()));

    let definition = PipelineDefinition {
        source: Box::new(CsvLocalSource::from_options(&source_options).unwrap()),
        source_settings: SourceSettings { plugin: "csv_local".to_string(),
                                          options: source_options,
                                          on_success: "raw_rows".to_string(),
                                          on_validation_failure: "discard".to_string() },
        transforms: vec![(TransformSettings { name: "identity".to_string(),
                                              plugin: "passthrough".to_string(),
                                              options: json!({}),
                                              input: "raw_rows".to_string(),
                                              on_success: "csv_out".to_string(),
                                              on_error: "discard".to_string() },
                         Box::new(PassthroughTransform::from_options(&json!({}))))],
        sinks,
        aggregations: vec![],
        gates: vec![],
        coalesces: vec![],
    };

    let recorder = recorder();
    let summary = Orchestrator::new(definition, RunSettings::default(), Arc::clone(&recorder)).run().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rows_read, 1);

    let rows = recorder.get_rows(summary.run_id).unwrap();
    assert_eq!(rows.len(), 1);
    let tokens = recorder.get_tokens(rows[0].row_id).unwrap();
    assert_eq!(tokens.len(), 1);

    // Tres estados (source, transform, sink), todos completed.
    let states = recorder.get_node_states_for_token(tokens[0].token_id).unwrap();
    assert_eq!(states.len(), 3, "expected source+transform+sink states");
    for state in &states {
        assert!(matches!(state, NodeState::Completed { .. }), "state {} not completed", state.state_id());
    }

    let artifacts = recorder.get_artifacts(summary.run_id).unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].artifact_type, "csv");

    let outcomes = recorder.get_outcomes_for_token(tokens[0].token_id).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].outcome, RowOutcome::Completed);
    assert_eq!(outcomes[0].sink_name.as_deref(), Some("csv_out"));
    assert!(recorder.row_is_complete(rows[0].row_id).unwrap());

    let written = std::fs::read_to_string(&output_path).unwrap();
    assert!(written.contains("1,a"));
}

fn gate_pipeline(recorder: &Arc<LandscapeRecorder>,
                 rows: serde_json::Value)
                 -> (auditflow_core::RunSummary, auditflow_adapters::SharedRows, auditflow_adapters::SharedRows) {
    let source_options = json!({"rows": rows});
    let high = MemorySink::from_options(&json!({"label": "high"}));
    let low = MemorySink::from_options(&json!({"label": "low"}));
    let high_rows = high.rows();
    let low_rows = low.rows();

    let mut sinks: IndexMap<String, Box<dyn auditflow_core::plugin::SinkPlugin>> = IndexMap::new();
    sinks.insert("high_sink".to_string(), Box::new(high));
    sinks.insert("output".to_string(), Box::new(low));

    let definition = PipelineDefinition {
        source: Box::new(InlineSource::from_options(&source_options).unwrap()),
        source_settings: SourceSettings { plugin: "inline".to_string(),
                                          options: source_options,
                                          on_success: "raw_rows".to_string(),
                                          on_validation_failure: "discard".to_string() },
        transforms: vec![(TransformSettings { name: "after_gate".to_string(),
                                              plugin: "passthrough".to_string(),
                                              options: json!({}),
                                              input: "low_conn".to_string(),
                                              on_success: "output".to_string(),
                                              on_error: "discard".to_string() },
                         Box::new(PassthroughTransform::from_options(&json!({}))))],
        sinks,
        aggregations: vec![],
        gates: vec![GateSettings { name: "amount_gate".to_string(),
                                   input: "raw_rows".to_string(),
                                   condition: "row['amount'] > 1000".to_string(),
                                   routes: [("true".to_string(), "high_sink".to_string()),
                                            ("false".to_string(), "low_conn".to_string())].into_iter().collect(),
                                   fork_to: None }],
        coalesces: vec![],
    };

    let summary = Orchestrator::new(definition, RunSettings::default(), Arc::clone(recorder)).run().unwrap();
    (summary, high_rows, low_rows)
}

/// S3: gate booleano; el monto alto va al sink dedicado, el bajo sigue al
/// próximo nodo.
#[test]
fn boolean_gate_routes_high_and_continues_low() {
    let recorder = recorder();
    let (summary, high_rows, low_rows) =
        gate_pipeline(&recorder, json!([{"id": "1", "amount": 1500}, {"id": "2", "amount": 10}]));

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(high_rows.lock().unwrap().len(), 1);
    assert_eq!(low_rows.lock().unwrap().len(), 1);
    assert_eq!(high_rows.lock().unwrap()[0]["id"], json!("1"));
    assert_eq!(low_rows.lock().unwrap()[0]["id"], json!("2"));

    // El token ruteado al sink del gate queda ROUTED; el que siguió y
    // completó la cadena queda COMPLETED.
    let rows = recorder.get_rows(summary.run_id).unwrap();
    let outcomes_high = recorder.get_outcomes_for_token(recorder.get_tokens(rows[0].row_id).unwrap()[0].token_id)
                                .unwrap();
    assert_eq!(outcomes_high[0].outcome, RowOutcome::Routed);
    assert_eq!(outcomes_high[0].sink_name.as_deref(), Some("high_sink"));

    let outcomes_low = recorder.get_outcomes_for_token(recorder.get_tokens(rows[1].row_id).unwrap()[0].token_id)
                               .unwrap();
    assert_eq!(outcomes_low[0].outcome, RowOutcome::Completed);
    assert_eq!(outcomes_low[0].sink_name.as_deref(), Some("output"));

    // Todas las filas completas.
    for row in &rows {
        assert!(recorder.row_is_complete(row.row_id).unwrap());
    }
}

/// Validación de source: la fila que no cumple el contrato va a cuarentena.
#[test]
fn source_validation_failure_routes_to_quarantine_sink() {
    let source_options = json!({
        "rows": [{"id": "ok", "amount": 5}, {"amount": "not-an-int"}],
        "schema": {
            "mode": "fixed",
            "fields": [
                {"name": "id", "type": "str", "required": true},
                {"name": "amount", "type": "int", "required": true},
            ],
        },
        "on_validation_failure": "quarantine",
    });
    let quarantine = MemorySink::from_options(&json!({"label": "quarantine"}));
    let output = MemorySink::from_options(&json!({"label": "output"}));
    let quarantine_rows = quarantine.rows();
    let output_rows = output.rows();

    let mut sinks: IndexMap<String, Box<dyn auditflow_core::plugin::SinkPlugin>> = IndexMap::new();
    sinks.insert("quarantine".to_string(), Box::new(quarantine));
    sinks.insert("output".to_string(), Box::new(output));

    let definition = PipelineDefinition {
        source: Box::new(InlineSource::from_options(&source_options).unwrap()),
        source_settings: SourceSettings { plugin: "inline".to_string(),
                                          options: source_options,
                                          on_success: "raw_rows".to_string(),
                                          on_validation_failure: "quarantine".to_string() },
        transforms: vec![(TransformSettings { name: "identity".to_string(),
                                              plugin: "passthrough".to_string(),
                                              options: json!({}),
                                              input: "raw_rows".to_string(),
                                              on_success: "output".to_string(),
                                              on_error: "discard".to_string() },
                         Box::new(PassthroughTransform::from_options(&json!({}))))],
        sinks,
        aggregations: vec![],
        gates: vec![],
        coalesces: vec![],
    };

    let recorder = recorder();
    let summary = Orchestrator::new(definition, RunSettings::default(), Arc::clone(&recorder)).run().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(output_rows.lock().unwrap().len(), 1);
    assert_eq!(quarantine_rows.lock().unwrap().len(), 1);

    let rows = recorder.get_rows(summary.run_id).unwrap();
    assert_eq!(rows.len(), 2);
    let bad_tokens = recorder.get_tokens(rows[1].row_id).unwrap();
    let outcomes = recorder.get_outcomes_for_token(bad_tokens[0].token_id).unwrap();
    assert_eq!(outcomes[0].outcome, RowOutcome::Quarantined);
    assert_eq!(outcomes[0].sink_name.as_deref(), Some("quarantine"));
}

/// Un error de transform con on_error configurado rutea la fila original al
/// sink de errores.
#[test]
fn transform_error_routes_original_row_to_error_sink() {
    let source_options = json!({"rows": [{"id": "1", "name": 42}]});
    let errors = MemorySink::from_options(&json!({"label": "errors"}));
    let output = MemorySink::from_options(&json!({"label": "output"}));
    let error_rows = errors.rows();
    let output_rows = output.rows();

    let mut sinks: IndexMap<String, Box<dyn auditflow_core::plugin::SinkPlugin>> = IndexMap::new();
    sinks.insert("errors".to_string(), Box::new(errors));
    sinks.insert("output".to_string(), Box::new(output));

    let definition = PipelineDefinition {
        source: Box::new(InlineSource::from_options(&source_options).unwrap()),
        source_settings: SourceSettings { plugin: "inline".to_string(),
                                          options: source_options,
                                          on_success: "raw_rows".to_string(),
                                          on_validation_failure: "discard".to_string() },
        // uppercase sobre un campo no-string devuelve resultado Error.
        transforms: vec![(TransformSettings { name: "shout".to_string(),
                                              plugin: "uppercase".to_string(),
                                              options: json!({"field": "name"}),
                                              input: "raw_rows".to_string(),
                                              on_success: "output".to_string(),
                                              on_error: "errors".to_string() },
                         Box::new(auditflow_adapters::FieldUppercaseTransform::from_options(&json!({"field": "name"}))
                                      .unwrap()))],
        sinks,
        aggregations: vec![],
        gates: vec![],
        coalesces: vec![],
    };

    let recorder = recorder();
    let summary = Orchestrator::new(definition, RunSettings::default(), Arc::clone(&recorder)).run().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(output_rows.lock().unwrap().len(), 0);
    assert_eq!(error_rows.lock().unwrap().len(), 1);

    let rows = recorder.get_rows(summary.run_id).unwrap();
    let tokens = recorder.get_tokens(rows[0].row_id).unwrap();
    let outcomes = recorder.get_outcomes_for_token(tokens[0].token_id).unwrap();
    assert_eq!(outcomes[0].outcome, RowOutcome::Routed);
    assert_eq!(outcomes[0].sink_name.as_deref(), Some("errors"));
    // El estado del transform quedó failed con el motivo.
    let states = recorder.get_node_states_for_token(tokens[0].token_id).unwrap();
    assert!(states.iter().any(|s| matches!(s, NodeState::Failed { .. })));
}
