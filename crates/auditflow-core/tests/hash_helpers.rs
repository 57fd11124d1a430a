use auditflow_core::hashing::{finite_number, hash_value, to_canonical_json};
use serde_json::json;

#[test]
fn hash_value_produces_hex_64() {
    let v = json!({"b": 2, "a": 1});
    let h = hash_value(&v);
    // blake3 hex length is 64
    assert_eq!(h.len(), 64);
    // deterministic: same value with different key order yields same hash
    let v2 = json!({"a": 1, "b": 2});
    assert_eq!(h, hash_value(&v2));
}

#[test]
fn canonical_json_sorts_keys_and_preserves_arrays() {
    let v = json!({"z": [3, 1, 2], "a": {"y": true, "x": null}});
    assert_eq!(to_canonical_json(&v), r#"{"a":{"x":null,"y":true},"z":[3,1,2]}"#);
}

#[test]
fn deep_copy_hashes_equal() {
    let v = json!({"rows": [{"id": "1", "v": 1.5}], "meta": {"k": "x"}});
    let copy = v.clone();
    assert_eq!(hash_value(&v), hash_value(&copy));
}

#[test]
fn non_finite_numbers_are_rejected() {
    assert!(finite_number(f64::NAN).is_err());
    assert!(finite_number(f64::INFINITY).is_err());
    assert!(finite_number(f64::NEG_INFINITY).is_err());
    assert!(finite_number(1.25).is_ok());
}
