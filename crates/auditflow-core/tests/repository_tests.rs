//! Carga estricta: toda fila persistida parsea al valor de dominio correcto
//! o es error de corrupción. Nunca coerciones ni defaults.

use auditflow_core::recorder::repos;
use auditflow_core::recorder::store::{NodeStateRow, RunRow, TokenOutcomeRow};
use auditflow_core::EngineError;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

fn valid_state_row() -> NodeStateRow {
    NodeStateRow { state_id: Uuid::new_v4().to_string(),
                   token_id: Uuid::new_v4().to_string(),
                   node_id: "transform_x_abc123".to_string(),
                   step_index: 1,
                   attempt: 0,
                   status: "completed".to_string(),
                   input_hash: "a".repeat(64),
                   started_at: Utc::now(),
                   completed_at: Some(Utc::now()),
                   duration_ms: Some(1.5),
                   output_hash: Some("b".repeat(64)),
                   error_json: None,
                   context_before: None,
                   context_after: None }
}

#[test]
fn completed_state_loads_with_all_columns() {
    let state = repos::parse_node_state(&valid_state_row()).unwrap();
    assert_eq!(state.status_str(), "completed");
    assert!(state.output_hash().is_some());
}

#[test]
fn completed_state_without_output_hash_is_corruption() {
    let mut row = valid_state_row();
    row.output_hash = None;
    let err = repos::parse_node_state(&row).unwrap_err();
    assert!(matches!(err, EngineError::Corruption(_)), "got: {err:?}");
}

#[test]
fn open_state_with_completion_columns_is_corruption() {
    let mut row = valid_state_row();
    row.status = "open".to_string();
    // completed_at/duration quedaron seteados: inconsistencia.
    let err = repos::parse_node_state(&row).unwrap_err();
    assert!(matches!(err, EngineError::Corruption(_)));
}

#[test]
fn pending_state_must_not_carry_output_hash() {
    let mut row = valid_state_row();
    row.status = "pending".to_string();
    let err = repos::parse_node_state(&row).unwrap_err();
    assert!(err.to_string().contains("output_hash"));

    row.output_hash = None;
    let state = repos::parse_node_state(&row).unwrap();
    assert_eq!(state.status_str(), "pending");
}

#[test]
fn unknown_state_status_is_corruption() {
    let mut row = valid_state_row();
    row.status = "half-done".to_string();
    let err = repos::parse_node_state(&row).unwrap_err();
    assert!(err.to_string().contains("half-done"));
}

#[test]
fn failed_state_keeps_optional_error_payload() {
    let mut row = valid_state_row();
    row.status = "failed".to_string();
    row.output_hash = None;
    row.error_json = Some(json!({"exception": "boom"}));
    let state = repos::parse_node_state(&row).unwrap();
    assert_eq!(state.status_str(), "failed");
}

fn valid_outcome_row() -> TokenOutcomeRow {
    TokenOutcomeRow { outcome_id: Uuid::new_v4().to_string(),
                      run_id: Uuid::new_v4().to_string(),
                      token_id: Uuid::new_v4().to_string(),
                      outcome: "completed".to_string(),
                      is_terminal: 1,
                      recorded_at: Utc::now(),
                      sink_name: Some("output".to_string()),
                      batch_id: None,
                      fork_group_id: None,
                      join_group_id: None,
                      expand_group_id: None,
                      error_hash: None,
                      context_json: None,
                      expected_branches_json: None }
}

#[test]
fn outcome_terminality_must_match_static_table() {
    let row = valid_outcome_row();
    assert!(repos::parse_token_outcome(&row).is_ok());

    // completed marcado no-terminal: corrupción.
    let mut bad = valid_outcome_row();
    bad.is_terminal = 0;
    let err = repos::parse_token_outcome(&bad).unwrap_err();
    assert!(matches!(err, EngineError::Corruption(_)));

    // buffered marcado terminal: corrupción.
    let mut bad = valid_outcome_row();
    bad.outcome = "buffered".to_string();
    bad.is_terminal = 1;
    assert!(repos::parse_token_outcome(&bad).is_err());
}

#[test]
fn boolean_columns_accept_only_zero_or_one() {
    let mut row = valid_outcome_row();
    row.is_terminal = 2;
    let err = repos::parse_token_outcome(&row).unwrap_err();
    assert!(err.to_string().contains("expected 0 or 1"));
}

#[test]
fn unknown_outcome_code_is_corruption() {
    let mut row = valid_outcome_row();
    row.outcome = "teleported".to_string();
    assert!(repos::parse_token_outcome(&row).is_err());
}

#[test]
fn run_row_with_unknown_status_is_corruption() {
    let row = RunRow { run_id: Uuid::new_v4().to_string(),
                       started_at: Utc::now(),
                       config_hash: "c".repeat(64),
                       settings_json: json!({}),
                       canonical_version: "blake3-rfc8785-v1".to_string(),
                       status: "paused".to_string(),
                       completed_at: None,
                       reproducibility: "full".to_string(),
                       export_status: None,
                       export_metadata: None };
    assert!(repos::parse_run(&row).is_err());
}

#[test]
fn invalid_uuid_is_corruption_not_coercion() {
    let mut row = valid_outcome_row();
    row.token_id = "not-a-uuid".to_string();
    let err = repos::parse_token_outcome(&row).unwrap_err();
    assert!(matches!(err, EngineError::Corruption(_)));
}
