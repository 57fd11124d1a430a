//! Carga YAML: expansión de entorno, validaciones de forma y secretos.

use auditflow_config::{load_settings, ConfigError};
use std::io::Write;

fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    (dir, path)
}

const MINIMAL: &str = r#"
datasource:
  plugin: inline
  options:
    rows: []
  on_success: raw_rows
sinks:
  output:
    plugin: memory
    options: {}
output_sink: output
row_plugins:
  - name: identity
    plugin: passthrough
    input: raw_rows
    on_success: output
"#;

#[test]
fn minimal_config_loads() {
    let (_dir, path) = write_config(MINIMAL);
    let settings = load_settings(&path).unwrap();
    assert_eq!(settings.datasource.plugin, "inline");
    assert_eq!(settings.output_sink, "output");
    assert_eq!(settings.row_plugins.len(), 1);
    assert_eq!(settings.row_plugins[0].on_error, "discard");
}

#[test]
fn unknown_output_sink_fails_at_load() {
    let broken = MINIMAL.replace("output_sink: output", "output_sink: outpt");
    let (_dir, path) = write_config(&broken);
    let err = load_settings(&path).unwrap_err();
    assert!(err.to_string().contains("outpt"));
}

#[test]
fn boolean_gate_with_wrong_labels_fails_at_load() {
    let config = format!("{MINIMAL}gates:\n  - name: g\n    input: raw_rows\n    condition: \"row['amount'] > 1000\"\n    routes:\n      above: output\n      below: output\n");
    let (_dir, path) = write_config(&config);
    let err = load_settings(&path).unwrap_err();
    assert!(err.to_string().contains("boolean"), "got: {err}");
}

#[test]
fn reserved_route_label_fails_at_load() {
    let config = format!("{MINIMAL}gates:\n  - name: g\n    input: raw_rows\n    condition: \"row['band']\"\n    routes:\n      continue: output\n");
    let (_dir, path) = write_config(&config);
    assert!(load_settings(&path).is_err());
}

#[test]
fn trigger_without_any_condition_fails_at_load() {
    let config = format!("{MINIMAL}aggregations:\n  - name: agg\n    plugin: batch_stats\n    input: raw_rows\n    on_success: output\n    trigger: {{}}\n");
    let (_dir, path) = write_config(&config);
    let err = load_settings(&path).unwrap_err();
    assert!(err.to_string().contains("at least one trigger"));
}

#[test]
fn replay_mode_requires_source_run_id() {
    let config = format!("{MINIMAL}run_mode: replay\n");
    let (_dir, path) = write_config(&config);
    let err = load_settings(&path).unwrap_err();
    assert!(err.to_string().contains("replay_source_run_id"));
}

#[test]
fn env_vars_expand_with_defaults() {
    std::env::set_var("AUDITFLOW_TEST_SINK_PATH", "/tmp/af-output.csv");
    let config = r#"
datasource:
  plugin: inline
  options:
    rows: []
  on_success: raw_rows
sinks:
  output:
    plugin: csv
    options:
      path: "${AUDITFLOW_TEST_SINK_PATH}"
      label: "${AUDITFLOW_TEST_MISSING:-fallback}"
output_sink: output
"#;
    let (_dir, path) = write_config(config);
    let settings = load_settings(&path).unwrap();
    let options = &settings.sinks["output"].options;
    assert_eq!(options["path"], serde_json::json!("/tmp/af-output.csv"));
    assert_eq!(options["label"], serde_json::json!("fallback"));
    std::env::remove_var("AUDITFLOW_TEST_SINK_PATH");
}

#[test]
fn coalesce_branch_list_becomes_identity_map() {
    let config = format!(
        "{MINIMAL}gates:\n  - name: splitter\n    input: raw_rows\n    condition: \"True\"\n    routes:\n      \
         \"true\": fork\n      \"false\": fork\n    fork_to: [a, b]\ncoalesce:\n  - name: merge\n    branches: [a, b]\n    \
         policy: require_all\n    merge: union\n    on_success: output\n"
    );
    let (_dir, path) = write_config(&config);
    let settings = load_settings(&path).unwrap();
    let resolved = settings.coalesce_settings().unwrap();
    assert_eq!(resolved[0].branches.get("a"), Some(&"a".to_string()));
    assert_eq!(resolved[0].branches.get("b"), Some(&"b".to_string()));
}

#[test]
fn quorum_without_count_fails() {
    let config = format!(
        "{MINIMAL}gates:\n  - name: splitter\n    input: raw_rows\n    condition: \"True\"\n    routes:\n      \
         \"true\": fork\n      \"false\": fork\n    fork_to: [a, b]\ncoalesce:\n  - name: merge\n    branches: [a, b]\n    \
         policy: quorum\n    merge: union\n    on_success: output\n"
    );
    let (_dir, path) = write_config(&config);
    let settings = load_settings(&path).unwrap();
    let err = settings.coalesce_settings().unwrap_err();
    assert!(err.to_string().contains("quorum_count"));
}

#[test]
fn secrets_without_key_fail_loudly() {
    // Sin clave de fingerprint ni permiso de secretos crudos, un api_key en
    // options corta la resolución.
    std::env::remove_var("AUDITFLOW_FINGERPRINT_KEY");
    std::env::remove_var("AUDITFLOW_ALLOW_RAW_SECRETS");
    let options = serde_json::json!({"api_key": "sk-123", "endpoint": "https://x"});
    let scan = auditflow_config::secrets::fingerprint_secrets(&options, None, false);
    assert_eq!(scan.secret_fields, vec!["api_key"]);

    // Con clave, el valor se reemplaza por un fingerprint estable.
    let scan = auditflow_config::secrets::fingerprint_secrets(&options, Some("k1"), false);
    let fp = scan.options["api_key"].as_str().unwrap().to_string();
    assert!(fp.starts_with("fingerprint:"));
    let again = auditflow_config::secrets::fingerprint_secrets(&options, Some("k1"), false);
    assert_eq!(again.options["api_key"].as_str().unwrap(), fp);
    // El endpoint no es secreto y queda intacto.
    assert_eq!(scan.options["endpoint"], options["endpoint"]);
}

#[test]
fn nested_secrets_are_detected() {
    let options = serde_json::json!({"service": {"auth": {"client_secret": "s3"}}});
    let scan = auditflow_config::secrets::fingerprint_secrets(&options, Some("k"), false);
    assert_eq!(scan.secret_fields, vec!["service.auth.client_secret"]);
    assert!(scan.options["service"]["auth"]["client_secret"].as_str().unwrap().starts_with("fingerprint:"));
}

#[test]
fn error_type_names_offending_fields() {
    let err = ConfigError::SecretFingerprint { fields: vec!["api_key".to_string()] };
    assert!(err.to_string().contains("api_key"));
}
