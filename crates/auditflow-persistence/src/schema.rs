//! Esquema Diesel del landscape (generado manualmente; reemplazable con
//! `diesel print-schema`).
//!
//! Notas de forma:
//! - Ids como Text (uuid serializado): la capa de repositorios del core los
//!   re-parsea estricto.
//! - Booleans como Int4 0/1 (`is_terminal`): la carga exige exactamente esos
//!   valores.
//! - Columnas JSON como Jsonb; null vs ausente es distinción semántica.

diesel::table! {
    runs (run_id) {
        run_id -> Text,
        started_at -> Timestamptz,
        config_hash -> Text,
        settings_json -> Jsonb,
        canonical_version -> Text,
        status -> Text,
        completed_at -> Nullable<Timestamptz>,
        reproducibility -> Text,
        export_status -> Nullable<Text>,
        export_metadata -> Nullable<Jsonb>,
    }
}

diesel::table! {
    nodes (run_id, node_id) {
        node_id -> Text,
        run_id -> Text,
        kind -> Text,
        plugin_name -> Text,
        plugin_version -> Text,
        config_json -> Jsonb,
        config_hash -> Text,
        determinism -> Text,
        input_schema -> Nullable<Jsonb>,
        output_schema -> Nullable<Jsonb>,
        sequence -> Nullable<Int8>,
        registered_at -> Timestamptz,
    }
}

diesel::table! {
    edges (run_id, edge_id) {
        edge_id -> Text,
        run_id -> Text,
        from_node -> Text,
        to_node -> Text,
        label -> Text,
        mode -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    rows (row_id) {
        row_id -> Text,
        run_id -> Text,
        source_node_id -> Text,
        row_index -> Int8,
        source_data_hash -> Text,
        source_data_ref -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tokens (token_id) {
        token_id -> Text,
        row_id -> Text,
        fork_group_id -> Nullable<Text>,
        join_group_id -> Nullable<Text>,
        expand_group_id -> Nullable<Text>,
        branch_name -> Nullable<Text>,
        step_in_pipeline -> Nullable<Int8>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    token_parents (child_token_id, parent_token_id, ordinal) {
        child_token_id -> Text,
        parent_token_id -> Text,
        ordinal -> Int8,
    }
}

diesel::table! {
    node_states (state_id) {
        state_id -> Text,
        token_id -> Text,
        node_id -> Text,
        step_index -> Int8,
        attempt -> Int8,
        status -> Text,
        input_hash -> Text,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
        duration_ms -> Nullable<Float8>,
        output_hash -> Nullable<Text>,
        error_json -> Nullable<Jsonb>,
        context_before -> Nullable<Jsonb>,
        context_after -> Nullable<Jsonb>,
    }
}

diesel::table! {
    routing_events (event_id) {
        event_id -> Text,
        state_id -> Text,
        edge_id -> Text,
        routing_group_id -> Text,
        ordinal -> Int8,
        mode -> Text,
        reason_hash -> Nullable<Text>,
        reason_ref -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    calls (call_id) {
        call_id -> Text,
        state_id -> Text,
        call_index -> Int8,
        call_type -> Text,
        status -> Text,
        request_hash -> Text,
        request_ref -> Nullable<Text>,
        response_hash -> Nullable<Text>,
        response_ref -> Nullable<Text>,
        error_json -> Nullable<Jsonb>,
        latency_ms -> Float8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    batches (batch_id) {
        batch_id -> Text,
        run_id -> Text,
        aggregation_node_id -> Text,
        attempt -> Int8,
        status -> Text,
        created_at -> Timestamptz,
        state_id -> Nullable<Text>,
        trigger_type -> Nullable<Text>,
        trigger_reason -> Nullable<Jsonb>,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    batch_members (batch_id, token_id) {
        batch_id -> Text,
        token_id -> Text,
        ordinal -> Int8,
    }
}

diesel::table! {
    token_outcomes (outcome_id) {
        outcome_id -> Text,
        run_id -> Text,
        token_id -> Text,
        outcome -> Text,
        is_terminal -> Int4,
        recorded_at -> Timestamptz,
        sink_name -> Nullable<Text>,
        batch_id -> Nullable<Text>,
        fork_group_id -> Nullable<Text>,
        join_group_id -> Nullable<Text>,
        expand_group_id -> Nullable<Text>,
        error_hash -> Nullable<Text>,
        context_json -> Nullable<Jsonb>,
        expected_branches_json -> Nullable<Jsonb>,
    }
}

diesel::table! {
    artifacts (artifact_id) {
        artifact_id -> Text,
        run_id -> Text,
        produced_by_state_id -> Text,
        sink_node_id -> Text,
        artifact_type -> Text,
        path_or_uri -> Text,
        content_hash -> Text,
        size_bytes -> Int8,
        idempotency_key -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    checkpoints (checkpoint_id) {
        checkpoint_id -> Text,
        run_id -> Text,
        token_id -> Text,
        node_id -> Text,
        sequence_number -> Int8,
        payload_json -> Text,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    runs,
    nodes,
    edges,
    rows,
    tokens,
    token_parents,
    node_states,
    routing_events,
    calls,
    batches,
    batch_members,
    token_outcomes,
    artifacts,
    checkpoints,
);
