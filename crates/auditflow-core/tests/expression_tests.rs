use auditflow_core::expr::{ExpressionError, ExpressionParser};
use indexmap::IndexMap;
use serde_json::{json, Value};

fn row(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[test]
fn comparison_over_row_field() {
    let parser = ExpressionParser::compile("row['amount'] > 1000").unwrap();
    assert!(parser.is_boolean_expression());
    assert_eq!(parser.evaluate(&row(&[("amount", json!(1500))])).unwrap(), json!(true));
    assert_eq!(parser.evaluate(&row(&[("amount", json!(10))])).unwrap(), json!(false));
}

#[test]
fn string_result_routes_by_value() {
    let parser = ExpressionParser::compile("row['band']").unwrap();
    assert!(!parser.is_boolean_expression());
    assert_eq!(parser.evaluate(&row(&[("band", json!("high"))])).unwrap(), json!("high"));
}

#[test]
fn boolean_operators_short_circuit() {
    let parser = ExpressionParser::compile("row['a'] == 1 and row['b'] == 2").unwrap();
    assert_eq!(parser.evaluate(&row(&[("a", json!(1)), ("b", json!(2))])).unwrap(), json!(true));
    // Con a != 1, b ni se mira: no debe fallar aunque falte.
    assert_eq!(parser.evaluate(&row(&[("a", json!(0))])).unwrap(), json!(false));
}

#[test]
fn not_and_parentheses() {
    let parser = ExpressionParser::compile("not (row['x'] == 1 or row['x'] == 2)").unwrap();
    assert_eq!(parser.evaluate(&row(&[("x", json!(3))])).unwrap(), json!(true));
    assert_eq!(parser.evaluate(&row(&[("x", json!(2))])).unwrap(), json!(false));
}

#[test]
fn int_and_float_compare_equal() {
    let parser = ExpressionParser::compile("row['v'] == 1").unwrap();
    assert_eq!(parser.evaluate(&row(&[("v", json!(1.0))])).unwrap(), json!(true));
}

#[test]
fn attribute_access_is_a_security_error() {
    let err = ExpressionParser::compile("row.amount > 1").unwrap_err();
    assert!(matches!(err, ExpressionError::Security(_)), "got: {err:?}");
}

#[test]
fn foreign_names_are_security_errors() {
    let err = ExpressionParser::compile("os == 1").unwrap_err();
    assert!(matches!(err, ExpressionError::Security(_)));
    let err = ExpressionParser::compile("row['x'] == open").unwrap_err();
    assert!(matches!(err, ExpressionError::Security(_)));
}

#[test]
fn comparison_chaining_is_rejected() {
    let err = ExpressionParser::compile("1 < row['x'] < 10").unwrap_err();
    assert!(matches!(err, ExpressionError::Syntax(_)));
}

#[test]
fn missing_field_is_an_eval_error() {
    let parser = ExpressionParser::compile("row['ghost'] == 1").unwrap();
    let err = parser.evaluate(&row(&[])).unwrap_err();
    assert!(matches!(err, ExpressionError::Eval(_)));
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn boolean_literal_is_boolean_expression() {
    let parser = ExpressionParser::compile("True").unwrap();
    assert!(parser.is_boolean_expression());
    assert_eq!(parser.evaluate(&row(&[])).unwrap(), json!(true));
}
