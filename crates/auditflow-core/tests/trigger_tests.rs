//! Triggers: primero en disparar gana, y la restauración reproduce la
//! próxima decisión pre-crash.

use auditflow_core::dag::TriggerSettings;
use auditflow_core::executors::TriggerEvaluator;
use auditflow_core::model::TriggerType;
use indexmap::IndexMap;
use serde_json::{json, Value};

fn row(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn count_trigger(n: u64) -> TriggerSettings {
    TriggerSettings { count: Some(n),
                      timeout_seconds: None,
                      condition: None }
}

#[test]
fn count_fires_exactly_at_threshold() {
    let mut evaluator = TriggerEvaluator::new(&count_trigger(3)).unwrap();
    evaluator.record_accept(&row(&[])).unwrap();
    evaluator.record_accept(&row(&[])).unwrap();
    assert!(!evaluator.should_trigger());
    evaluator.record_accept(&row(&[])).unwrap();
    assert!(evaluator.should_trigger());
    assert_eq!(evaluator.trigger_type(), Some(TriggerType::Count));
}

#[test]
fn condition_fires_on_matching_row() {
    let settings = TriggerSettings { count: None,
                                     timeout_seconds: None,
                                     condition: Some("row['type'] == 'flush_signal'".to_string()) };
    let mut evaluator = TriggerEvaluator::new(&settings).unwrap();
    evaluator.record_accept(&row(&[("type", json!("data"))])).unwrap();
    assert!(!evaluator.should_trigger());
    evaluator.record_accept(&row(&[("type", json!("flush_signal"))])).unwrap();
    assert_eq!(evaluator.trigger_type(), Some(TriggerType::Condition));
}

#[test]
fn first_to_fire_wins_and_is_sticky() {
    // count: 2 y condition que también matchea en la segunda fila: count se
    // evalúa primero en el mismo instante y queda fijo.
    let settings = TriggerSettings { count: Some(2),
                                     timeout_seconds: None,
                                     condition: Some("row['type'] == 'x'".to_string()) };
    let mut evaluator = TriggerEvaluator::new(&settings).unwrap();
    evaluator.record_accept(&row(&[("type", json!("y"))])).unwrap();
    evaluator.record_accept(&row(&[("type", json!("x"))])).unwrap();
    assert_eq!(evaluator.trigger_type(), Some(TriggerType::Count));
    // Más accepts no cambian el tipo disparado.
    evaluator.record_accept(&row(&[("type", json!("x"))])).unwrap();
    assert_eq!(evaluator.trigger_type(), Some(TriggerType::Count));
}

#[test]
fn timeout_fires_between_accepts() {
    let settings = TriggerSettings { count: Some(1000),
                                     timeout_seconds: Some(0.02),
                                     condition: None };
    let mut evaluator = TriggerEvaluator::new(&settings).unwrap();
    evaluator.record_accept(&row(&[])).unwrap();
    assert!(!evaluator.should_trigger());
    std::thread::sleep(std::time::Duration::from_millis(40));
    assert!(evaluator.should_trigger());
    assert_eq!(evaluator.trigger_type(), Some(TriggerType::Timeout));
}

#[test]
fn at_least_one_trigger_is_required() {
    let settings = TriggerSettings::default();
    assert!(TriggerEvaluator::new(&settings).is_err());
}

#[test]
fn restore_reproduces_next_decision() {
    // Pre-crash: 2 de 3 accepts hechos.
    let mut original = TriggerEvaluator::new(&count_trigger(3)).unwrap();
    original.record_accept(&row(&[])).unwrap();
    original.record_accept(&row(&[])).unwrap();
    let snapshot = original.checkpoint_state();

    // Post-restore: el tercer accept debe disparar Count, igual que el
    // proceso original lo habría hecho.
    let mut restored = TriggerEvaluator::new(&count_trigger(3)).unwrap();
    restored.restore(&snapshot).unwrap();
    assert_eq!(restored.accepted(), 2);
    assert!(!restored.should_trigger());
    restored.record_accept(&row(&[])).unwrap();
    assert_eq!(restored.trigger_type(), Some(TriggerType::Count));
}

#[test]
fn restore_preserves_already_fired_state() {
    let mut original = TriggerEvaluator::new(&count_trigger(2)).unwrap();
    original.record_accept(&row(&[])).unwrap();
    original.record_accept(&row(&[])).unwrap();
    assert!(original.should_trigger());
    let snapshot = original.checkpoint_state();

    let mut restored = TriggerEvaluator::new(&count_trigger(2)).unwrap();
    restored.restore(&snapshot).unwrap();
    assert!(restored.should_trigger());
    assert_eq!(restored.trigger_type(), Some(TriggerType::Count));
}

#[test]
fn restore_with_missing_keys_is_corruption() {
    let mut evaluator = TriggerEvaluator::new(&count_trigger(2)).unwrap();
    let err = evaluator.restore(&json!({"accepted": 1})).unwrap_err();
    assert!(err.to_string().contains("first_accept_at"));
}

#[test]
fn reset_starts_a_fresh_batch() {
    let mut evaluator = TriggerEvaluator::new(&count_trigger(2)).unwrap();
    evaluator.record_accept(&row(&[])).unwrap();
    evaluator.record_accept(&row(&[])).unwrap();
    assert!(evaluator.should_trigger());
    evaluator.reset();
    assert!(!evaluator.should_trigger());
    assert_eq!(evaluator.accepted(), 0);
}
