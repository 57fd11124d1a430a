use auditflow_adapters::{default_registry, CsvLocalSource, CsvSink, FieldUppercaseTransform};
use auditflow_core::plugin::{PluginContext, SinkPlugin, SourcePlugin, TransformPlugin, TransformResult};
use auditflow_core::recorder::{InMemoryAuditStore, LandscapeRecorder};
use auditflow_domain::{PipelineRow, SchemaContract};
use indexmap::IndexMap;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;

fn ctx() -> PluginContext {
    let recorder = Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())));
    PluginContext::new(uuid::Uuid::new_v4(), recorder)
}

#[test]
fn csv_source_reads_headered_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("in.csv");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "id,name").unwrap();
    writeln!(file, "1,ada").unwrap();
    writeln!(file, "2,grace").unwrap();

    let mut source = CsvLocalSource::from_options(&json!({"path": path.to_string_lossy()})).unwrap();
    let first = source.read().unwrap().unwrap();
    assert_eq!(first["id"], json!("1"));
    assert_eq!(first["name"], json!("ada"));
    let second = source.read().unwrap().unwrap();
    assert_eq!(second["name"], json!("grace"));
    assert!(source.read().unwrap().is_none());
}

#[test]
fn csv_sink_appends_and_reports_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.csv");
    let mut sink = CsvSink::from_options(&json!({"path": path.to_string_lossy()})).unwrap();

    let mut row = IndexMap::new();
    row.insert("id".to_string(), json!("1"));
    row.insert("v".to_string(), json!("a"));
    let descriptor = sink.write(&[row], &mut ctx()).unwrap();
    assert_eq!(descriptor.artifact_type, "csv");
    assert_eq!(descriptor.content_hash.len(), 64);
    assert!(descriptor.size_bytes > 0);

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.starts_with("id,v"));
    assert!(contents.contains("1,a"));
}

#[test]
fn uppercase_transform_errors_on_missing_field() {
    let mut transform = FieldUppercaseTransform::from_options(&json!({"field": "name"})).unwrap();
    let contract = Arc::new(SchemaContract::observed().locked());
    let mut data = IndexMap::new();
    data.insert("other".to_string(), json!("x"));
    let row = PipelineRow::from_trusted(data, contract);

    let result = transform.process(row, &mut ctx()).unwrap();
    match result {
        TransformResult::Error { reason, retryable, .. } => {
            assert!(!retryable);
            assert_eq!(reason["field"], json!("name"));
        }
        other => panic!("expected error result, got {other:?}"),
    }
}

#[test]
fn registry_resolves_known_plugins_and_suggests_on_typos() {
    let registry = default_registry();
    assert!(registry.create_transform("passthrough", &json!({})).is_ok());
    let err = registry.create_transform("passthrouh", &json!({})).err().unwrap();
    assert!(err.to_string().contains("Did you mean"), "got: {err}");
    assert!(err.to_string().contains("passthrough"));
}
