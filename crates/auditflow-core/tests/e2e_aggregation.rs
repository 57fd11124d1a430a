//! S4: agregación con trigger por conteo + lote final de end_of_source.

use auditflow_adapters::{BatchStatsTransform, InlineSource, MemorySink};
use auditflow_core::dag::{AggregationSettings, SourceSettings, TriggerSettings};
use auditflow_core::model::{BatchStatus, RowOutcome, RunStatus, TriggerType};
use auditflow_core::recorder::{InMemoryAuditStore, LandscapeRecorder};
use auditflow_core::{Orchestrator, PipelineDefinition, RunSettings};
use indexmap::IndexMap;
use serde_json::json;
use std::sync::Arc;

#[test]
fn count_trigger_flushes_batches_and_end_of_source_closes_the_tail() {
    let rows: Vec<serde_json::Value> = (0..7).map(|i| json!({"id": i.to_string(), "value": i})).collect();
    let source_options = json!({"rows": rows});

    let sink = MemorySink::from_options(&json!({"label": "summaries"}));
    let summary_rows = sink.rows();
    let mut sinks: IndexMap<String, Box<dyn auditflow_core::plugin::SinkPlugin>> = IndexMap::new();
    sinks.insert("output".to_string(), Box::new(sink));

    let definition = PipelineDefinition {
        source: Box::new(InlineSource::from_options(&source_options).unwrap()),
        source_settings: SourceSettings { plugin: "inline".to_string(),
                                          options: source_options,
                                          on_success: "raw_rows".to_string(),
                                          on_validation_failure: "discard".to_string() },
        transforms: vec![],
        sinks,
        aggregations: vec![(AggregationSettings { name: "stats".to_string(),
                                                  plugin: "batch_stats".to_string(),
                                                  options: json!({"fields": ["value"]}),
                                                  input: "raw_rows".to_string(),
                                                  on_success: Some("output".to_string()),
                                                  trigger: TriggerSettings { count: Some(3),
                                                                             timeout_seconds: None,
                                                                             condition: None } },
                            Box::new(BatchStatsTransform::from_options(&json!({"fields": ["value"]}))))],
        gates: vec![],
        coalesces: vec![],
    };

    let recorder = Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())));
    let summary = Orchestrator::new(definition, RunSettings::default(), Arc::clone(&recorder)).run().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rows_read, 7);

    // Dos lotes por conteo (3, 3) y uno final por end_of_source (1).
    let batches = recorder.get_batches(summary.run_id).unwrap();
    assert_eq!(batches.len(), 3);
    for batch in &batches {
        assert_eq!(batch.status, BatchStatus::Completed);
    }
    assert_eq!(batches[0].trigger_type, Some(TriggerType::Count));
    assert_eq!(batches[1].trigger_type, Some(TriggerType::Count));
    assert_eq!(batches[2].trigger_type, Some(TriggerType::EndOfSource));

    // Ordinales de membresía estables 0..N-1 por lote.
    let member_counts: Vec<usize> = batches.iter()
                                           .map(|b| recorder.get_batch_members(b.batch_id).unwrap().len())
                                           .collect();
    assert_eq!(member_counts, vec![3, 3, 1]);
    for batch in &batches {
        let members = recorder.get_batch_members(batch.batch_id).unwrap();
        for (i, member) in members.iter().enumerate() {
            assert_eq!(member.ordinal, i as u32);
        }
    }

    // Tres filas resumen en el sink.
    let written = summary_rows.lock().unwrap();
    assert_eq!(written.len(), 3);
    assert_eq!(written[0]["row_count"], json!(3));
    assert_eq!(written[2]["row_count"], json!(1));

    // Los 7 tokens fuente quedaron CONSUMED_IN_BATCH y sus filas completas.
    let rows = recorder.get_rows(summary.run_id).unwrap();
    assert_eq!(rows.len(), 7);
    for row in &rows {
        let tokens = recorder.get_tokens(row.row_id).unwrap();
        let source_token = &tokens[0];
        let outcomes = recorder.get_outcomes_for_token(source_token.token_id).unwrap();
        assert!(outcomes.iter().any(|o| o.outcome == RowOutcome::ConsumedInBatch),
                "row {} source token lacks consumed_in_batch: {outcomes:?}",
                row.row_index);
        assert!(recorder.row_is_complete(row.row_id).unwrap(), "row {} incomplete", row.row_index);
    }
}
