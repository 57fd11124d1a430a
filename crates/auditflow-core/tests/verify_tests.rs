//! Verify: los hashes son la superficie de comparación entre corridas.

use auditflow_adapters::{InlineSource, MemorySink, PassthroughTransform};
use auditflow_core::dag::{SourceSettings, TransformSettings};
use auditflow_core::recorder::{InMemoryAuditStore, LandscapeRecorder};
use auditflow_core::replay::compare_runs;
use auditflow_core::{Orchestrator, PipelineDefinition, RunSettings};
use indexmap::IndexMap;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn run_pipeline(recorder: &Arc<LandscapeRecorder>, rows: serde_json::Value) -> Uuid {
    let source_options = json!({"rows": rows});
    let sink = MemorySink::from_options(&json!({"label": "out"}));
    let mut sinks: IndexMap<String, Box<dyn auditflow_core::plugin::SinkPlugin>> = IndexMap::new();
    sinks.insert("output".to_string(), Box::new(sink));

    let definition = PipelineDefinition {
        source: Box::new(InlineSource::from_options(&source_options).unwrap()),
        source_settings: SourceSettings { plugin: "inline".to_string(),
                                          options: source_options,
                                          on_success: "raw_rows".to_string(),
                                          on_validation_failure: "discard".to_string() },
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
    Orchestrator::new(definition, RunSettings::default(), Arc::clone(recorder)).run().unwrap().run_id
}

#[test]
fn identical_reruns_verify_clean() {
    let recorder = Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())));
    let rows = json!([{"id": "1", "v": "a"}, {"id": "2", "v": "b"}]);
    let baseline = run_pipeline(&recorder, rows.clone());
    let candidate = run_pipeline(&recorder, rows);

    let report = compare_runs(&recorder, baseline, candidate).unwrap();
    assert!(report.is_clean(), "mismatches: {:?}", report.mismatches);
    assert!(report.compared_states > 0);
}

#[test]
fn diverging_payloads_surface_as_hash_mismatches() {
    let recorder = Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())));
    let baseline = run_pipeline(&recorder, json!([{"id": "1", "v": "a"}]));
    let candidate = run_pipeline(&recorder, json!([{"id": "1", "v": "CHANGED"}]));

    let report = compare_runs(&recorder, baseline, candidate).unwrap();
    assert!(!report.is_clean());
    assert!(!report.mismatches.is_empty());
    // El mismatch identifica nodo y fila, no state_ids crudos.
    let first = &report.mismatches[0];
    assert_eq!(first.row_index, 0);
    assert!(first.baseline_hash.is_some());
    assert_ne!(first.baseline_hash, first.candidate_hash);
}
