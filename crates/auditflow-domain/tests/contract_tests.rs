use auditflow_domain::{ContractMode, FieldContract, FieldType, PipelineRow, SchemaContract};
use indexmap::IndexMap;
use serde_json::json;
use std::sync::Arc;

fn sample_contract() -> SchemaContract {
    SchemaContract::new(ContractMode::Fixed,
                        vec![FieldContract::declared("id", FieldType::Str, true),
                             FieldContract::declared("amount", FieldType::Int, true),
                             FieldContract::declared("note", FieldType::Str, false)])
}

#[test]
fn fixed_contract_rejects_extras() {
    let contract = sample_contract();
    let mut data = IndexMap::new();
    data.insert("id".to_string(), json!("1"));
    data.insert("amount".to_string(), json!(5));
    data.insert("sneaky".to_string(), json!("x"));
    let err = contract.validate(data.iter()).unwrap_err();
    assert!(err.to_string().contains("sneaky"), "error should name the extra field: {err}");
}

#[test]
fn fixed_contract_requires_declared_fields() {
    let contract = sample_contract();
    let mut data = IndexMap::new();
    data.insert("id".to_string(), json!("1"));
    let err = contract.validate(data.iter()).unwrap_err();
    assert!(err.to_string().contains("amount"));
}

#[test]
fn flexible_contract_allows_extras_but_checks_types() {
    let contract = SchemaContract::new(ContractMode::Flexible,
                                       vec![FieldContract::declared("amount", FieldType::Int, true)]);
    let mut data = IndexMap::new();
    data.insert("amount".to_string(), json!(10));
    data.insert("extra".to_string(), json!("ok"));
    assert!(contract.validate(data.iter()).is_ok());

    let mut bad = IndexMap::new();
    bad.insert("amount".to_string(), json!("not a number"));
    let err = contract.validate(bad.iter()).unwrap_err();
    assert!(err.to_string().contains("amount"));
}

#[test]
fn observed_contract_infers_fields_from_data() {
    let mut contract = SchemaContract::observed();
    let mut data = IndexMap::new();
    data.insert("count".to_string(), json!(3));
    data.insert("name".to_string(), json!("a"));
    contract.observe(data.iter()).unwrap();
    assert_eq!(contract.field("count").unwrap().field_type, FieldType::Int);
    assert_eq!(contract.field("name").unwrap().field_type, FieldType::Str);

    // Una observación posterior con otro tipo degrada a any, nunca adivina.
    let mut second = IndexMap::new();
    second.insert("count".to_string(), json!("three"));
    contract.observe(second.iter()).unwrap();
    assert_eq!(contract.field("count").unwrap().field_type, FieldType::Any);
}

#[test]
fn locked_contract_refuses_observation() {
    let mut contract = SchemaContract::observed().locked();
    let data: IndexMap<String, serde_json::Value> = IndexMap::new();
    assert!(contract.observe(data.iter()).is_err());
}

#[test]
fn version_is_stable_and_sensitive_to_structure() {
    let a = sample_contract();
    let b = sample_contract();
    assert_eq!(a.version(), b.version());

    // Cambiar el flag required cambia la versión.
    let c = SchemaContract::new(ContractMode::Fixed,
                                vec![FieldContract::declared("id", FieldType::Str, false),
                                     FieldContract::declared("amount", FieldType::Int, true),
                                     FieldContract::declared("note", FieldType::Str, false)]);
    assert_ne!(a.version(), c.version());
}

#[test]
fn schema_json_round_trip_preserves_fields() {
    let original = sample_contract().locked();
    let restored = SchemaContract::from_schema_json(&original.to_schema_json()).unwrap();
    assert_eq!(original.mode(), restored.mode());
    assert_eq!(original.fields().len(), restored.fields().len());
    for (a, b) in original.fields().iter().zip(restored.fields()) {
        assert_eq!(a.normalized_name, b.normalized_name);
        assert_eq!(a.field_type, b.field_type);
        assert_eq!(a.required, b.required);
    }
}

#[test]
fn row_extraction_is_a_plain_mapping() {
    let contract = Arc::new(SchemaContract::new(ContractMode::Flexible,
                                                vec![FieldContract::declared("id", FieldType::Str, true)]).locked());
    let mut data = IndexMap::new();
    data.insert("id".to_string(), json!("7"));
    data.insert("extra".to_string(), json!(1));
    let row = PipelineRow::new(data, contract).unwrap();
    let dict = row.to_dict();
    assert_eq!(dict.len(), 2);
    // El orden de inserción se preserva (prioridad de campos declarados).
    let keys: Vec<&String> = dict.keys().collect();
    assert_eq!(keys, vec!["id", "extra"]);
}
