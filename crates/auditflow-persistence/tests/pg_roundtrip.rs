//! Paridad con el backend en memoria: roundtrip básico contra Postgres.
//! Se saltea sin DATABASE_URL (mismo patrón que el resto de la suite).

use auditflow_core::recorder::store::{NodeStateRow, RunRow};
use auditflow_core::recorder::{repos, AuditStore};
use auditflow_persistence::{build_pool, DbConfig, PgAuditStore};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

fn store() -> Option<PgAuditStore> {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("skip (no DATABASE_URL)");
        return None;
    }
    let cfg = DbConfig::from_env();
    match build_pool(&cfg.url, 1, 2) {
        Ok(pool) => Some(PgAuditStore::new(pool)),
        Err(e) => {
            eprintln!("no se pudo construir pool de test: {e}");
            None
        }
    }
}

fn run_row() -> RunRow {
    RunRow { run_id: Uuid::new_v4().to_string(),
             started_at: Utc::now(),
             config_hash: "c".repeat(64),
             settings_json: json!({"demo": true}),
             canonical_version: "blake3-rfc8785-v1".to_string(),
             status: "running".to_string(),
             completed_at: None,
             reproducibility: "full".to_string(),
             export_status: None,
             export_metadata: None }
}

#[test]
fn run_roundtrip_and_strict_parse() {
    let Some(store) = store() else { return };
    let row = run_row();
    store.insert_run(row.clone()).unwrap();

    let loaded = store.get_run(&row.run_id).unwrap().expect("run persisted");
    let parsed = repos::parse_run(&loaded).unwrap();
    assert_eq!(parsed.run_id.to_string(), row.run_id);
    assert_eq!(parsed.status.as_str(), "running");

    // Transición de cierre.
    let mut closed = loaded;
    closed.status = "completed".to_string();
    closed.completed_at = Some(Utc::now());
    store.update_run(closed).unwrap();
    let final_row = store.get_run(&row.run_id).unwrap().unwrap();
    assert_eq!(final_row.status, "completed");
}

#[test]
fn node_state_roundtrip_preserves_variant_columns() {
    let Some(store) = store() else { return };
    let run = run_row();
    store.insert_run(run.clone()).unwrap();

    // Fila + token para las FKs.
    store.insert_row(auditflow_core::recorder::store::RowRow { row_id: Uuid::new_v4().to_string(),
                                                               run_id: run.run_id.clone(),
                                                               source_node_id: "source_x".to_string(),
                                                               row_index: 0,
                                                               source_data_hash: "d".repeat(64),
                                                               source_data_ref: None,
                                                               created_at: Utc::now() })
         .unwrap();
    let rows = store.list_rows(&run.run_id).unwrap();
    let token_id = Uuid::new_v4().to_string();
    store.insert_token(auditflow_core::recorder::store::TokenRow { token_id: token_id.clone(),
                                                                   row_id: rows[0].row_id.clone(),
                                                                   fork_group_id: None,
                                                                   join_group_id: None,
                                                                   expand_group_id: None,
                                                                   branch_name: None,
                                                                   step_in_pipeline: Some(1),
                                                                   created_at: Utc::now() })
         .unwrap();

    let state = NodeStateRow { state_id: Uuid::new_v4().to_string(),
                               token_id,
                               node_id: "transform_t_x".to_string(),
                               step_index: 1,
                               attempt: 0,
                               status: "open".to_string(),
                               input_hash: "a".repeat(64),
                               started_at: Utc::now(),
                               completed_at: None,
                               duration_ms: None,
                               output_hash: None,
                               error_json: None,
                               context_before: None,
                               context_after: None };
    store.insert_node_state(state.clone()).unwrap();

    // open → completed.
    let mut completed = state.clone();
    completed.status = "completed".to_string();
    completed.completed_at = Some(Utc::now());
    completed.duration_ms = Some(4.2);
    completed.output_hash = Some("b".repeat(64));
    store.update_node_state(completed).unwrap();

    let loaded = store.get_node_state(&state.state_id).unwrap().unwrap();
    let parsed = repos::parse_node_state(&loaded).unwrap();
    assert_eq!(parsed.status_str(), "completed");
    assert!(parsed.output_hash().is_some());
}
