//! Evaluador de triggers de agregación.
//!
//! Política: el primer trigger en disparar (en tiempo de pared) gana y
//! reporta su tipo. end_of_source es implícito: el orchestrator lo chequea
//! al agotarse el source, sin configurarlo acá.
//!
//! Restauración: el evaluador preserva el timestamp del primer accept, el
//! conteo acumulado y el trigger ya disparado. Con esos offsets, la próxima
//! decisión tras un restore coincide con la que habría tomado el proceso
//! original antes del crash.

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde_json::Value;

use crate::dag::TriggerSettings;
use crate::errors::EngineError;
use crate::expr::ExpressionParser;
use crate::model::TriggerType;

#[derive(Debug)]
pub struct TriggerEvaluator {
    settings: TriggerSettings,
    condition: Option<ExpressionParser>,
    accepted: u64,
    first_accept_at: Option<DateTime<Utc>>,
    fired: Option<TriggerType>,
}

impl TriggerEvaluator {
    pub fn new(settings: &TriggerSettings) -> Result<Self, EngineError> {
        settings.validate()?;
        let condition = match &settings.condition {
            Some(src) => Some(ExpressionParser::compile(src).map_err(EngineError::from)?),
            None => None,
        };
        Ok(Self { settings: settings.clone(),
                  condition,
                  accepted: 0,
                  first_accept_at: None,
                  fired: None })
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn first_accept_at(&self) -> Option<DateTime<Utc>> {
        self.first_accept_at
    }

    fn timeout_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.first_accept_at, self.settings.timeout_seconds) {
            (Some(first), Some(secs)) => Some(first + Duration::milliseconds((secs * 1000.0) as i64)),
            _ => None,
        }
    }

    /// Registra un accept y evalúa los triggers en orden de disparo real:
    /// un timeout vencido ENTRE accepts ganó antes que el count/condition de
    /// este accept.
    pub fn record_accept(&mut self, row: &IndexMap<String, Value>) -> Result<(), EngineError> {
        let now = Utc::now();
        if self.fired.is_some() {
            self.accepted += 1;
            return Ok(());
        }
        // El timeout corre desde el primer accept; si venció antes de este
        // accept, disparó primero en tiempo de pared.
        if let Some(deadline) = self.timeout_deadline() {
            if now >= deadline {
                self.fired = Some(TriggerType::Timeout);
            }
        }
        if self.first_accept_at.is_none() {
            self.first_accept_at = Some(now);
        }
        self.accepted += 1;

        if self.fired.is_none() {
            if let Some(count) = self.settings.count {
                if self.accepted >= count {
                    self.fired = Some(TriggerType::Count);
                }
            }
        }
        if self.fired.is_none() {
            if let Some(parser) = &self.condition {
                let fired = parser.evaluate(row)
                                  .map(|v| matches!(v, Value::Bool(true)))
                                  .map_err(|e| EngineError::Config(format!("trigger condition: {e}")))?;
                if fired {
                    self.fired = Some(TriggerType::Condition);
                }
            }
        }
        Ok(())
    }

    /// Chequeo entre accepts (el orchestrator lo usa para timeouts).
    pub fn check(&mut self) -> Option<TriggerType> {
        if self.fired.is_none() {
            if let Some(deadline) = self.timeout_deadline() {
                if Utc::now() >= deadline {
                    self.fired = Some(TriggerType::Timeout);
                }
            }
        }
        self.fired
    }

    pub fn should_trigger(&mut self) -> bool {
        self.check().is_some()
    }

    pub fn trigger_type(&self) -> Option<TriggerType> {
        self.fired
    }

    /// Reset tras un flush: el próximo lote arranca de cero.
    pub fn reset(&mut self) {
        self.accepted = 0;
        self.first_accept_at = None;
        self.fired = None;
    }

    /// Offsets serializables para el checkpoint.
    pub fn checkpoint_state(&self) -> Value {
        serde_json::json!({
            "accepted": self.accepted,
            "first_accept_at": self.first_accept_at.map(|t| t.to_rfc3339()),
            "fired": self.fired.map(|t| t.as_str()),
        })
    }

    /// Reconstruye los offsets desde un checkpoint. Claves ausentes son
    /// corrupción: un checkpoint válido siempre las escribe.
    pub fn restore(&mut self, state: &Value) -> Result<(), EngineError> {
        let accepted = state.get("accepted")
                            .and_then(|v| v.as_u64())
                            .ok_or_else(|| EngineError::Corruption("trigger checkpoint missing 'accepted'".to_string()))?;
        let first_accept_at = match state.get("first_accept_at") {
            Some(Value::Null) => None,
            Some(Value::String(s)) => Some(DateTime::parse_from_rfc3339(s)
                    .map_err(|e| EngineError::Corruption(format!("trigger checkpoint first_accept_at: {e}")))?
                    .with_timezone(&Utc)),
            Some(other) => {
                return Err(EngineError::Corruption(format!("trigger checkpoint first_accept_at has wrong type: {other}")));
            }
            None => return Err(EngineError::Corruption("trigger checkpoint missing 'first_accept_at'".to_string())),
        };
        let fired = match state.get("fired") {
            Some(Value::Null) => None,
            Some(Value::String(s)) => Some(TriggerType::parse(s).ok_or_else(|| {
                                               EngineError::Corruption(format!("trigger checkpoint unknown fired type '{s}'"))
                                           })?),
            Some(other) => {
                return Err(EngineError::Corruption(format!("trigger checkpoint fired has wrong type: {other}")));
            }
            None => return Err(EngineError::Corruption("trigger checkpoint missing 'fired'".to_string())),
        };
        self.accepted = accepted;
        self.first_accept_at = first_accept_at;
        self.fired = fired;
        Ok(())
    }
}
