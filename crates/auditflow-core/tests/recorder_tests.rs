//! Recorder: integridad de edges citados y orden garantizado de queries.

use auditflow_core::model::{Determinism, NodeKind, RoutingMode};
use auditflow_core::recorder::{InMemoryAuditStore, LandscapeRecorder, RoutingSpec, StateCompletion};
use auditflow_core::EngineError;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn recorder() -> Arc<LandscapeRecorder> {
    Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())))
}

fn seed_row_and_token(recorder: &LandscapeRecorder, run_id: Uuid, index: u64) -> Uuid {
    let row = recorder.create_row(run_id, "source_inline_abc", index, &json!({"i": index})).unwrap();
    let token = auditflow_core::model::Token { token_id: Uuid::new_v4(),
                                               row_id: row.row_id,
                                               fork_group_id: None,
                                               join_group_id: None,
                                               expand_group_id: None,
                                               branch_name: None,
                                               step_in_pipeline: Some(1),
                                               created_at: chrono::Utc::now() };
    recorder.insert_token(&token).unwrap();
    token.token_id
}

#[test]
fn routing_event_with_unregistered_edge_crashes() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    recorder.register_node(run.run_id, "gate_g_abc", NodeKind::Gate, "config_gate:g", "1.0.0",
                           json!({}), Determinism::Deterministic, None, None, Some(1))
            .unwrap();
    let token_id = seed_row_and_token(&recorder, run.run_id, 0);
    let state = recorder.begin_node_state(token_id, "gate_g_abc", 1, 0, &json!({"a": 1})).unwrap();

    let err = recorder.record_routing_event(state.state_id(), "edge_ghost", RoutingMode::Move, None)
                      .unwrap_err();
    assert!(matches!(err, EngineError::AuditIntegrity(_)), "got: {err:?}");
}

#[test]
fn routing_events_share_group_and_ordinals_in_record_order() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    recorder.register_node(run.run_id, "gate_g_abc", NodeKind::Gate, "config_gate:g", "1.0.0",
                           json!({}), Determinism::Deterministic, None, None, Some(1))
            .unwrap();
    let e1 = recorder.register_edge(run.run_id, "gate_g_abc", "sink_a", "a", RoutingMode::Copy).unwrap();
    let e2 = recorder.register_edge(run.run_id, "gate_g_abc", "sink_b", "b", RoutingMode::Copy).unwrap();
    let token_id = seed_row_and_token(&recorder, run.run_id, 0);
    let state = recorder.begin_node_state(token_id, "gate_g_abc", 1, 0, &json!({"a": 1})).unwrap();

    let events = recorder.record_routing_events(state.state_id(),
                                                &[RoutingSpec { edge_id: e1.edge_id.clone(), mode: RoutingMode::Copy },
                                                  RoutingSpec { edge_id: e2.edge_id.clone(), mode: RoutingMode::Copy }],
                                                Some(&json!({"why": "fork"})))
                         .unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].routing_group_id, events[1].routing_group_id);
    assert_eq!(events[0].ordinal, 0);
    assert_eq!(events[1].ordinal, 1);
    assert_eq!(events[0].edge_id, e1.edge_id);
}

#[test]
fn run_scoped_routing_events_order_by_step_attempt_ordinal() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    recorder.register_node(run.run_id, "gate_g_abc", NodeKind::Gate, "config_gate:g", "1.0.0",
                           json!({}), Determinism::Deterministic, None, None, Some(1))
            .unwrap();
    let edge = recorder.register_edge(run.run_id, "gate_g_abc", "sink_a", "a", RoutingMode::Move).unwrap();
    let token_id = seed_row_and_token(&recorder, run.run_id, 0);

    // Grabamos primero el estado del paso 3 y después el del paso 1: el
    // orden global debe salir por step_index, no por orden de inserción ni
    // por orden lexicográfico de state_id.
    let late = recorder.begin_node_state(token_id, "gate_g_abc", 3, 0, &json!({})).unwrap();
    recorder.record_routing_event(late.state_id(), &edge.edge_id, RoutingMode::Move, None).unwrap();
    let early = recorder.begin_node_state(token_id, "gate_g_abc", 1, 0, &json!({})).unwrap();
    recorder.record_routing_event(early.state_id(), &edge.edge_id, RoutingMode::Move, None).unwrap();
    let retry = recorder.begin_node_state(token_id, "gate_g_abc", 1, 1, &json!({})).unwrap();
    recorder.record_routing_event(retry.state_id(), &edge.edge_id, RoutingMode::Move, None).unwrap();

    let events = recorder.get_all_routing_events_for_run(run.run_id).unwrap();
    let order: Vec<Uuid> = events.iter().map(|e| e.state_id).collect();
    assert_eq!(order, vec![early.state_id(), retry.state_id(), late.state_id()]);
}

#[test]
fn call_indices_are_allocated_per_state() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    recorder.register_node(run.run_id, "transform_t_abc", NodeKind::Transform, "t", "1.0.0",
                           json!({}), Determinism::ExternalCall, None, None, Some(1))
            .unwrap();
    let token_id = seed_row_and_token(&recorder, run.run_id, 0);
    let s1 = recorder.begin_node_state(token_id, "transform_t_abc", 1, 0, &json!({})).unwrap();
    let s2 = recorder.begin_node_state(token_id, "transform_t_abc", 2, 0, &json!({})).unwrap();

    use auditflow_core::model::{CallStatus, CallType};
    let c0 = recorder.record_call(s1.state_id(), CallType::Http, CallStatus::Success, &json!({"q": 1}), None, None, 3.0)
                     .unwrap();
    let c1 = recorder.record_call(s1.state_id(), CallType::Http, CallStatus::Success, &json!({"q": 2}), None, None, 3.0)
                     .unwrap();
    let other = recorder.record_call(s2.state_id(), CallType::Http, CallStatus::Error, &json!({"q": 3}), None,
                                     Some(json!({"status": 500})), 3.0)
                        .unwrap();
    assert_eq!(c0.call_index, 0);
    assert_eq!(c1.call_index, 1);
    // Contador independiente por estado padre.
    assert_eq!(other.call_index, 0);
}

#[test]
fn state_transitions_are_single_shot() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    recorder.register_node(run.run_id, "transform_t_abc", NodeKind::Transform, "t", "1.0.0",
                           json!({}), Determinism::Deterministic, None, None, Some(1))
            .unwrap();
    let token_id = seed_row_and_token(&recorder, run.run_id, 0);
    let state = recorder.begin_node_state(token_id, "transform_t_abc", 1, 0, &json!({})).unwrap();

    recorder.complete_node_state(state.state_id(),
                                 StateCompletion::Completed { output_data: json!({"ok": true}), duration_ms: 2.0 })
            .unwrap();
    // Un estado terminal no admite segunda transición.
    let err = recorder.complete_node_state(state.state_id(),
                                           StateCompletion::Failed { error: None, duration_ms: 2.0, output_hash: None })
                      .unwrap_err();
    assert!(matches!(err, EngineError::AuditIntegrity(_)));
}

#[test]
fn pending_state_can_resume_to_completed() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    recorder.register_node(run.run_id, "aggregation_a_abc", NodeKind::Aggregation, "batch", "1.0.0",
                           json!({}), Determinism::ExternalCall, None, None, Some(1))
            .unwrap();
    let token_id = seed_row_and_token(&recorder, run.run_id, 0);
    let state = recorder.begin_node_state(token_id, "aggregation_a_abc", 1, 0, &json!({})).unwrap();

    recorder.complete_node_state(state.state_id(), StateCompletion::Pending { duration_ms: 9.0 }).unwrap();
    let resumed = recorder.complete_node_state(state.state_id(),
                                               StateCompletion::Completed { output_data: json!({"done": 1}),
                                                                            duration_ms: 20.0 })
                          .unwrap();
    assert_eq!(resumed.status_str(), "completed");
}

#[test]
fn node_id_length_cap_is_enforced() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    let long_id = "transform_".to_string() + &"x".repeat(120);
    let err = recorder.register_node(run.run_id, &long_id, NodeKind::Transform, "t", "1.0.0",
                                     json!({}), Determinism::Deterministic, None, None, None)
                      .unwrap_err();
    assert!(matches!(err, EngineError::AuditIntegrity(_)));
}

#[test]
fn reproducibility_grade_downgrades_with_external_calls() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    recorder.register_node(run.run_id, "source_s_abc", NodeKind::Source, "inline", "1.0.0",
                           json!({}), Determinism::Deterministic, None, None, Some(0))
            .unwrap();
    recorder.register_node(run.run_id, "transform_llm_abc", NodeKind::Transform, "llm", "1.0.0",
                           json!({}), Determinism::ExternalCall, None, None, Some(1))
            .unwrap();
    let finished = recorder.complete_run(run.run_id, auditflow_core::model::RunStatus::Completed).unwrap();
    assert_eq!(finished.reproducibility, auditflow_core::model::ReproducibilityGrade::Partial);
}
