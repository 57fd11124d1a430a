//! S2/recuperación: una fila bifurcada con un hijo completo y otro
//! crasheado DEBE aparecer como sin procesar.

use auditflow_core::checkpoint::{CheckpointManager, RecoveryManager};
use auditflow_core::model::{Determinism, NodeKind, RowOutcome, Token};
use auditflow_core::recorder::{InMemoryAuditStore, LandscapeRecorder};
use auditflow_core::EngineError;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn recorder() -> Arc<LandscapeRecorder> {
    Arc::new(LandscapeRecorder::new(Arc::new(InMemoryAuditStore::new())))
}

fn token(row_id: Uuid, branch: Option<&str>, fork_group: Option<Uuid>) -> Token {
    Token { token_id: Uuid::new_v4(),
            row_id,
            fork_group_id: fork_group,
            join_group_id: None,
            expand_group_id: None,
            branch_name: branch.map(String::from),
            step_in_pipeline: Some(1),
            created_at: Utc::now() }
}

#[test]
fn fork_one_child_completes_one_crashes_row_is_unprocessed() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    recorder.register_node(run.run_id, "source_csv_x", NodeKind::Source, "csv_local", "1.0.0", json!({}),
                           Determinism::IoRead, None, None, Some(0))
            .unwrap();

    let row = recorder.create_row(run.run_id, "source_csv_x", 0, &json!({"id": "0"})).unwrap();
    let fork_group = Uuid::new_v4();

    // Padre bifurcado: FORKED es terminal para el token pero NO completa la
    // fila.
    let parent = token(row.row_id, None, Some(fork_group));
    recorder.insert_token(&parent).unwrap();
    recorder.record_token_outcome(run.run_id, parent.token_id, RowOutcome::Forked, None, None, Some(fork_group),
                                  None, None)
            .unwrap();

    // Hijo a: completo en sink_a.
    let child_a = token(row.row_id, Some("fork_a"), Some(fork_group));
    recorder.insert_token(&child_a).unwrap();
    recorder.record_token_outcome(run.run_id, child_a.token_id, RowOutcome::Completed,
                                  Some("sink_a".to_string()), None, None, None, None)
            .unwrap();

    // Hijo b: SIN outcome (el proceso murió antes de completar).
    let child_b = token(row.row_id, Some("fork_b"), Some(fork_group));
    recorder.insert_token(&child_b).unwrap();

    let recovery = RecoveryManager::new(Arc::clone(&recorder));
    let unprocessed = recovery.get_unprocessed_rows(run.run_id).unwrap();
    assert_eq!(unprocessed, vec![row.row_id],
               "row must be unprocessed because child b lacks a terminal outcome");

    // Sólo el subgrafo del hijo b debe re-ejecutarse.
    let incomplete = recovery.get_incomplete_tokens(row.row_id).unwrap();
    assert_eq!(incomplete, vec![child_b.token_id]);
}

#[test]
fn fully_terminal_rows_are_not_unprocessed() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    recorder.register_node(run.run_id, "source_csv_x", NodeKind::Source, "csv_local", "1.0.0", json!({}),
                           Determinism::IoRead, None, None, Some(0))
            .unwrap();

    let complete_row = recorder.create_row(run.run_id, "source_csv_x", 0, &json!({"id": "0"})).unwrap();
    let done = token(complete_row.row_id, None, None);
    recorder.insert_token(&done).unwrap();
    recorder.record_token_outcome(run.run_id, done.token_id, RowOutcome::Completed, Some("out".to_string()),
                                  None, None, None, None)
            .unwrap();

    let failed_row = recorder.create_row(run.run_id, "source_csv_x", 1, &json!({"id": "1"})).unwrap();
    let failed = token(failed_row.row_id, None, None);
    recorder.insert_token(&failed).unwrap();
    recorder.record_token_outcome(run.run_id, failed.token_id, RowOutcome::Failed, None, None, None,
                                  Some("e".repeat(64)), None)
            .unwrap();

    let recovery = RecoveryManager::new(Arc::clone(&recorder));
    // completed y failed completan fila: nada para re-procesar.
    assert!(recovery.get_unprocessed_rows(run.run_id).unwrap().is_empty());
}

#[test]
fn forked_parent_alone_does_not_complete_the_row() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    let row = recorder.create_row(run.run_id, "source_csv_x", 0, &json!({"id": "0"})).unwrap();
    let fork_group = Uuid::new_v4();
    let parent = token(row.row_id, None, Some(fork_group));
    recorder.insert_token(&parent).unwrap();
    recorder.record_token_outcome(run.run_id, parent.token_id, RowOutcome::Forked, None, None, Some(fork_group),
                                  None, None)
            .unwrap();

    assert!(!recorder.row_is_complete(row.row_id).unwrap());
    let recovery = RecoveryManager::new(Arc::clone(&recorder));
    assert_eq!(recovery.get_unprocessed_rows(run.run_id).unwrap(), vec![row.row_id]);
}

#[test]
fn checkpoint_version_mismatch_refuses_to_restore() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();

    // Un checkpoint de una versión futura, escrito a mano en el store.
    use auditflow_core::recorder::store::CheckpointRow;
    recorder.store()
            .insert_checkpoint(CheckpointRow { checkpoint_id: Uuid::new_v4().to_string(),
                                               run_id: run.run_id.to_string(),
                                               token_id: Uuid::new_v4().to_string(),
                                               node_id: "sink_x".to_string(),
                                               sequence_number: 0,
                                               payload_json:
                                                   r#"{"aggregations":{},"plugin_checkpoints":[],"version":99}"#.to_string(),
                                               created_at: Utc::now() })
            .unwrap();

    let manager = CheckpointManager::new(Arc::clone(&recorder));
    let err = manager.latest_checkpoint(run.run_id).unwrap_err();
    assert!(matches!(err, EngineError::CheckpointVersionMismatch { found: 99, .. }), "got: {err:?}");
}

#[test]
fn checkpoint_round_trip_restores_position() {
    let recorder = recorder();
    let run = recorder.begin_run("cfg", json!({})).unwrap();
    let token_id = Uuid::new_v4();
    let manager = CheckpointManager::new(Arc::clone(&recorder));
    manager.create_checkpoint(run.run_id, token_id, "sink_out_x", 3, json!({}), vec![]).unwrap();
    manager.create_checkpoint(run.run_id, token_id, "sink_out_x", 4, json!({}), vec![]).unwrap();

    let restored = manager.latest_checkpoint(run.run_id).unwrap().unwrap();
    assert_eq!(restored.sequence_number, 4);
    assert_eq!(restored.token_id, token_id);
    assert_eq!(restored.node_id, "sink_out_x");
}
