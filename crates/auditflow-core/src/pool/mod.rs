//! Ejecutor por filas con pool acotado: pipelining para plugins que llaman
//! servicios externos pagos.
//!
//! Modelo:
//! - Pool de workers de tamaño fijo con cola de envío bloqueante (sin
//!   corrutinas: hilos + canal síncrono acotado).
//! - Control de admisión AIMD: un `CapacityError` (HTTP 429/503/529) reduce
//!   la ventana a la mitad y reintenta con backoff; cada éxito la crece de a
//!   uno hasta el máximo.
//! - La emisión preserva el orden de envío (FIFO) aunque las finalizaciones
//!   compitan: los resultados se reordenan por índice.

use std::sync::mpsc;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::dag::RetrySettings;
use crate::errors::EngineError;
use crate::plugin::PluginError;

/// Ventana de admisión AIMD compartida por los workers.
struct AdmissionControl {
    state: Mutex<AdmissionState>,
    available: Condvar,
}

struct AdmissionState {
    limit: usize,
    in_flight: usize,
}

impl AdmissionControl {
    fn new(limit: usize) -> Self {
        Self { state: Mutex::new(AdmissionState { limit, in_flight: 0 }),
               available: Condvar::new() }
    }

    fn acquire(&self) {
        let mut state = self.state.lock().expect("admission lock");
        while state.in_flight >= state.limit {
            state = self.available.wait(state).expect("admission wait");
        }
        state.in_flight += 1;
    }

    fn release_success(&self, max_limit: usize) {
        let mut state = self.state.lock().expect("admission lock");
        state.in_flight -= 1;
        if state.limit < max_limit {
            state.limit += 1;
        }
        drop(state);
        self.available.notify_all();
    }

    fn release_capacity_error(&self) {
        let mut state = self.state.lock().expect("admission lock");
        state.in_flight -= 1;
        state.limit = (state.limit / 2).max(1);
        drop(state);
        self.available.notify_all();
    }
}

/// Pool de ejecución por filas.
pub struct PooledExecutor {
    max_workers: usize,
    max_pending: usize,
    retry: RetrySettings,
}

impl PooledExecutor {
    pub fn new(max_workers: usize, max_pending: usize, retry: RetrySettings) -> Self {
        Self { max_workers: max_workers.max(1),
               max_pending: max_pending.max(1),
               retry }
    }

    /// Ejecuta `work` por item en paralelo, preservando el orden de envío.
    ///
    /// - `Capacity` se reintenta con backoff dentro del pool (AIMD).
    /// - Cualquier otro `PluginError` aborta el lote y se propaga.
    pub fn execute<T, R, F>(&self, items: Vec<T>, work: F) -> Result<Vec<R>, EngineError>
        where T: Send,
              R: Send,
              F: Fn(&T) -> Result<R, PluginError> + Send + Sync
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let total = items.len();
        let admission = AdmissionControl::new(self.max_workers);
        let (submit_tx, submit_rx) = mpsc::sync_channel::<(usize, T)>(self.max_pending);
        let submit_rx = Mutex::new(submit_rx);
        let (result_tx, result_rx) = mpsc::channel::<(usize, Result<R, EngineError>)>();

        let outputs = std::thread::scope(|scope| -> Result<Vec<Option<R>>, EngineError> {
            for _ in 0..self.max_workers {
                let submit_rx = &submit_rx;
                let result_tx = result_tx.clone();
                let admission = &admission;
                let work = &work;
                let retry = &self.retry;
                let max_workers = self.max_workers;
                scope.spawn(move || {
                    loop {
                        let next = {
                            let rx = submit_rx.lock().expect("submit lock");
                            rx.recv()
                        };
                        let (index, item) = match next {
                            Ok(pair) => pair,
                            Err(_) => break,
                        };
                        let outcome = run_with_capacity_retry(&item, work, admission, retry, max_workers);
                        if result_tx.send((index, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            // Cola de envío bloqueante: el productor espera cuando hay
            // max_pending items en vuelo.
            let producer = scope.spawn(move || {
                for (index, item) in items.into_iter().enumerate() {
                    if submit_tx.send((index, item)).is_err() {
                        break;
                    }
                }
            });

            let mut slots: Vec<Option<R>> = Vec::with_capacity(total);
            slots.resize_with(total, || None);
            let mut first_error: Option<EngineError> = None;
            for _ in 0..total {
                match result_rx.recv() {
                    Ok((index, Ok(result))) => slots[index] = Some(result),
                    Ok((_, Err(e))) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = producer.join();
            match first_error {
                Some(e) => Err(e),
                None => Ok(slots),
            }
        })?;

        // Reordenamiento FIFO: índice de envío, no orden de finalización.
        let mut out = Vec::with_capacity(total);
        for (index, slot) in outputs.into_iter().enumerate() {
            match slot {
                Some(r) => out.push(r),
                None => return Err(EngineError::Internal(format!("pooled executor lost result for item {index}"))),
            }
        }
        Ok(out)
    }
}

fn run_with_capacity_retry<T, R, F>(item: &T,
                                    work: &F,
                                    admission: &AdmissionControl,
                                    retry: &RetrySettings,
                                    max_workers: usize)
                                    -> Result<R, EngineError>
    where F: Fn(&T) -> Result<R, PluginError>
{
    let mut delay = retry.initial_delay_seconds;
    let mut attempts = 0u32;
    loop {
        admission.acquire();
        match work(item) {
            Ok(result) => {
                admission.release_success(max_workers);
                return Ok(result);
            }
            Err(PluginError::Capacity { status }) => {
                admission.release_capacity_error();
                attempts += 1;
                if attempts >= retry.max_attempts {
                    return Err(EngineError::Capacity { status });
                }
                std::thread::sleep(Duration::from_secs_f64(delay));
                delay = (delay * 2.0).min(retry.max_delay_seconds);
            }
            Err(other) => {
                admission.release_success(max_workers);
                return Err(EngineError::PluginContract { plugin: "pooled".to_string(),
                                                         message: other.to_string() });
            }
        }
    }
}
