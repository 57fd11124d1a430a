//! Pool acotado: orden FIFO y reintentos por capacidad.

use auditflow_core::dag::RetrySettings;
use auditflow_core::plugin::PluginError;
use auditflow_core::pool::PooledExecutor;
use auditflow_core::EngineError;
use std::sync::atomic::{AtomicU32, Ordering};

fn fast_retry() -> RetrySettings {
    RetrySettings { max_attempts: 4,
                    initial_delay_seconds: 0.001,
                    max_delay_seconds: 0.01 }
}

#[test]
fn results_come_back_in_submission_order() {
    let pool = PooledExecutor::new(4, 8, fast_retry());
    let items: Vec<u64> = (0..20).collect();
    let results = pool.execute(items, |item| {
                          // Los primeros terminan más tarde: si el orden
                          // fuese de finalización, saldría invertido.
                          std::thread::sleep(std::time::Duration::from_millis(20u64.saturating_sub(*item)));
                          Ok(item * 2)
                      })
                      .unwrap();
    let expected: Vec<u64> = (0..20).map(|i| i * 2).collect();
    assert_eq!(results, expected);
}

#[test]
fn capacity_errors_retry_with_backoff() {
    let pool = PooledExecutor::new(2, 4, fast_retry());
    let failures = AtomicU32::new(0);
    let results = pool.execute(vec![1u32, 2, 3], |item| {
                          if *item == 2 && failures.fetch_add(1, Ordering::SeqCst) < 2 {
                              return Err(PluginError::Capacity { status: 429 });
                          }
                          Ok(*item)
                      })
                      .unwrap();
    assert_eq!(results, vec![1, 2, 3]);
    assert!(failures.load(Ordering::SeqCst) >= 2, "item 2 must have been retried");
}

#[test]
fn capacity_exhaustion_surfaces_the_status() {
    let pool = PooledExecutor::new(1, 2, RetrySettings { max_attempts: 2,
                                                         initial_delay_seconds: 0.001,
                                                         max_delay_seconds: 0.002 });
    let err = pool.execute(vec![1u32], |_| -> Result<u32, PluginError> {
                      Err(PluginError::Capacity { status: 529 })
                  })
                  .unwrap_err();
    assert!(matches!(err, EngineError::Capacity { status: 529 }), "got: {err:?}");
}

#[test]
fn fatal_errors_abort_the_batch() {
    let pool = PooledExecutor::new(2, 4, fast_retry());
    let err = pool.execute(vec![1u32, 2], |item| {
                      if *item == 2 {
                          Err(PluginError::Fatal("boom".to_string()))
                      } else {
                          Ok(*item)
                      }
                  })
                  .unwrap_err();
    assert!(err.to_string().contains("boom"));
}

#[test]
fn empty_input_returns_empty() {
    let pool = PooledExecutor::new(2, 4, fast_retry());
    let results: Vec<u32> = pool.execute(Vec::<u32>::new(), |_| Ok(1)).unwrap();
    assert!(results.is_empty());
}
