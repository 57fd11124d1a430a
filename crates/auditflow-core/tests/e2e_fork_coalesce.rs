//! S6: fork a tres ramas, coalesce por quórum de dos, merge union.

use auditflow_adapters::{InlineSource, MemorySink};
use auditflow_core::dag::{CoalescePolicy, CoalesceSettings, GateSettings, MergeStrategy, SourceSettings};
use auditflow_core::model::{RowOutcome, RunStatus};
use auditflow_core::recorder::{InMemoryAuditStore, LandscapeRecorder};
use auditflow_core::{Orchestrator, PipelineDefinition, RunSettings};
use indexmap::IndexMap;
use serde_json::json;
use std::sync::Arc;

#[test]
fn quorum_coalesce_merges_two_branches_and_drops_the_third() {
    let source_options = json!({"rows": [{"id": "1", "x": 1, "y": 2}]});
    let sink = MemorySink::from_options(&json!({"label": "merged"}));
    let merged_rows = sink.rows();
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
        gates: vec![GateSettings { name: "splitter".to_string(),
                                   input: "raw_rows".to_string(),
                                   condition: "True".to_string(),
                                   routes: [("true".to_string(), "fork".to_string()),
                                            ("false".to_string(), "fork".to_string())].into_iter().collect(),
                                   fork_to: Some(vec!["fast".to_string(), "slow".to_string(), "fallback".to_string()]) }],
        aggregations: vec![],
        coalesces: vec![CoalesceSettings { name: "merge_paths".to_string(),
                                           branches: [("fast".to_string(), "fast".to_string()),
                                                      ("slow".to_string(), "slow".to_string()),
                                                      ("fallback".to_string(), "fallback".to_string())].into_iter()
                                                                                                       .collect(),
                                           policy: CoalescePolicy::Quorum,
                                           merge: MergeStrategy::Union,
                                           timeout_seconds: None,
                                           quorum_count: Some(2),
                                           select_branch: None,
                                           on_success: Some("output".to_string()) }],
    };

    let recorder = Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())));
    let summary = Orchestrator::new(definition, RunSettings::default(), Arc::clone(&recorder)).run().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);

    // La fila fusionada llegó una sola vez al sink.
    assert_eq!(merged_rows.lock().unwrap().len(), 1);
    assert_eq!(merged_rows.lock().unwrap()[0]["x"], json!(1));
    assert_eq!(merged_rows.lock().unwrap()[0]["y"], json!(2));

    let rows = recorder.get_rows(summary.run_id).unwrap();
    assert_eq!(rows.len(), 1);
    let tokens = recorder.get_tokens(rows[0].row_id).unwrap();
    // raíz + 3 hijos de fork + 1 fusionado.
    assert_eq!(tokens.len(), 5);

    let mut outcome_kinds: Vec<RowOutcome> = Vec::new();
    for token in &tokens {
        for outcome in recorder.get_outcomes_for_token(token.token_id).unwrap() {
            outcome_kinds.push(outcome.outcome);
        }
    }
    let coalesced = outcome_kinds.iter().filter(|o| **o == RowOutcome::Coalesced).count();
    let dropped = outcome_kinds.iter().filter(|o| **o == RowOutcome::DroppedAtCoalesce).count();
    let forked = outcome_kinds.iter().filter(|o| **o == RowOutcome::Forked).count();
    let completed = outcome_kinds.iter().filter(|o| **o == RowOutcome::Completed).count();
    assert_eq!(forked, 1, "parent token must be FORKED");
    assert_eq!(coalesced, 2, "two branches consumed by the quorum merge");
    assert_eq!(dropped, 1, "late branch dropped at coalesce");
    assert_eq!(completed, 1, "merged child completed at sink");

    // Grupos: los dos COALESCED comparten join_group_id con el hijo
    // fusionado vía token_parents.
    let parents = recorder.get_all_token_parents_for_run(summary.run_id).unwrap();
    let merged_token = tokens.iter().find(|t| t.join_group_id.is_some()).expect("merged token exists");
    let merged_parent_links: Vec<_> = parents.iter()
                                             .filter(|p| p.child_token_id == merged_token.token_id)
                                             .collect();
    assert_eq!(merged_parent_links.len(), 2);

    assert!(recorder.row_is_complete(rows[0].row_id).unwrap());
}

#[test]
fn nested_merge_publishes_each_branch_as_a_field() {
    // Unidad del motor de coalesce vía pipeline: merge nested con dos ramas.
    let source_options = json!({"rows": [{"id": "7"}]});
    let sink = MemorySink::from_options(&json!({"label": "nested"}));
    let merged_rows = sink.rows();
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
        gates: vec![GateSettings { name: "splitter".to_string(),
                                   input: "raw_rows".to_string(),
                                   condition: "True".to_string(),
                                   routes: [("true".to_string(), "fork".to_string()),
                                            ("false".to_string(), "fork".to_string())].into_iter().collect(),
                                   fork_to: Some(vec!["left".to_string(), "right".to_string()]) }],
        aggregations: vec![],
        coalesces: vec![CoalesceSettings { name: "pair".to_string(),
                                           branches: [("left".to_string(), "left".to_string()),
                                                      ("right".to_string(), "right".to_string())].into_iter().collect(),
                                           policy: CoalescePolicy::RequireAll,
                                           merge: MergeStrategy::Nested,
                                           timeout_seconds: None,
                                           quorum_count: None,
                                           select_branch: None,
                                           on_success: Some("output".to_string()) }],
    };

    let recorder = Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())));
    let summary = Orchestrator::new(definition, RunSettings::default(), recorder).run().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);

    let written = merged_rows.lock().unwrap();
    assert_eq!(written.len(), 1);
    // Cada rama aparece como campo anidado con la fila completa.
    assert_eq!(written[0]["left"]["id"], json!("7"));
    assert_eq!(written[0]["right"]["id"], json!("7"));
}
