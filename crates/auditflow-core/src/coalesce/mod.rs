//! Motor de coalesce: la barrera de join de ramas de fork.
//!
//! Un nodo coalesce espera los tokens que llegan por cada rama declarada
//! (mismo row_id de origen). La política decide cuándo fusionar; la
//! estrategia decide cómo combinar las filas. Llegadas posteriores a una
//! fusión ya resuelta reciben el terminal `dropped_at_coalesce` (distinto en
//! auditoría, completa fila).
//!
//! Políticas:
//! - `require_all`: espera todas las ramas; fusiona con la última llegada.
//! - `quorum`: fusiona apenas llegan `quorum_count` ramas.
//! - `best_effort`: espera todas, pero fusiona en el primero de (todas
//!   llegaron, venció `timeout_seconds`).
//! - `first`: fusiona con la primera llegada.

use auditflow_domain::{ContractMode, PipelineRow, SchemaContract};
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::dag::{CoalescePolicy, CoalesceSettings, MergeStrategy};
use crate::errors::EngineError;
use crate::model::TokenInfo;

/// Resultado de una llegada al join.
#[derive(Debug)]
pub enum CoalesceOutcome {
    /// El join sigue esperando ramas.
    Waiting,
    /// El join disparó: padres consumidos (en orden de rama declarada) y
    /// fila fusionada.
    Merged { parents: Vec<TokenInfo>, merged_row: PipelineRow },
    /// El join ya había resuelto; esta llegada sobra y debe marcarse
    /// dropped_at_coalesce.
    Dropped,
}

/// Join vencido por timeout.
#[derive(Debug)]
pub struct ExpiredJoin {
    pub node_id: String,
    pub row_id: Uuid,
    /// Fusión parcial (best_effort) o None si la política falla el set.
    pub merged: Option<(Vec<TokenInfo>, PipelineRow)>,
    /// Tokens que esperaban y no fusionaron.
    pub stranded: Vec<TokenInfo>,
}

struct JoinState {
    arrivals: IndexMap<String, TokenInfo>,
    first_arrival_at: DateTime<Utc>,
}

pub struct CoalesceEngine {
    /// node_id → settings del coalesce.
    settings: HashMap<String, CoalesceSettings>,
    /// node_id → esquema del nodo (para el contrato de la fila fusionada).
    schemas: HashMap<String, Option<Value>>,
    pending: HashMap<(String, Uuid), JoinState>,
    resolved: HashSet<(String, Uuid)>,
}

impl CoalesceEngine {
    pub fn new(settings: HashMap<String, CoalesceSettings>, schemas: HashMap<String, Option<Value>>) -> Self {
        Self { settings,
               schemas,
               pending: HashMap::new(),
               resolved: HashSet::new() }
    }

    /// Registra la llegada de un token a su coalesce.
    pub fn accept(&mut self, node_id: &str, token: TokenInfo) -> Result<CoalesceOutcome, EngineError> {
        let settings = self.settings
                           .get(node_id)
                           .ok_or_else(|| EngineError::AuditIntegrity(format!("token arrived at unknown coalesce node \
                                                                               {node_id}")))?
                           .clone();
        let branch = token.branch_name
                          .clone()
                          .ok_or_else(|| EngineError::AuditIntegrity(format!("token {} arrived at coalesce {node_id} \
                                                                              without a branch name",
                                                                             token.token_id)))?;
        if !settings.branches.contains_key(&branch) {
            return Err(EngineError::AuditIntegrity(format!("branch '{branch}' is not declared by coalesce {node_id}")));
        }

        let key = (node_id.to_string(), token.row_id);
        if self.resolved.contains(&key) {
            return Ok(CoalesceOutcome::Dropped);
        }

        let state = self.pending.entry(key.clone()).or_insert_with(|| JoinState { arrivals: IndexMap::new(),
                                                                                  first_arrival_at: Utc::now() });
        state.arrivals.insert(branch, token);

        let fire = match settings.policy {
            CoalescePolicy::First => true,
            CoalescePolicy::RequireAll | CoalescePolicy::BestEffort => state.arrivals.len() == settings.branches.len(),
            CoalescePolicy::Quorum => {
                state.arrivals.len() >= settings.quorum_count.expect("validated: quorum requires quorum_count")
            }
        };

        if !fire {
            return Ok(CoalesceOutcome::Waiting);
        }

        let state = self.pending.remove(&key).expect("join state present");
        self.resolved.insert(key);
        let (parents, merged_row) = self.merge(node_id, &settings, state.arrivals)?;
        Ok(CoalesceOutcome::Merged { parents, merged_row })
    }

    /// Vencimientos: best_effort fusiona parcial; quorum con timeout falla
    /// el set (sin hijo fusionado). Políticas sin timeout no vencen.
    pub fn check_timeouts(&mut self) -> Result<Vec<ExpiredJoin>, EngineError> {
        let now = Utc::now();
        let mut expired_keys = Vec::new();
        for (key, state) in &self.pending {
            let Some(settings) = self.settings.get(&key.0) else { continue };
            let Some(timeout) = settings.timeout_seconds else { continue };
            let deadline = state.first_arrival_at + Duration::milliseconds((timeout * 1000.0) as i64);
            if now >= deadline {
                expired_keys.push(key.clone());
            }
        }

        let mut out = Vec::new();
        for key in expired_keys {
            let state = self.pending.remove(&key).expect("expired join present");
            self.resolved.insert(key.clone());
            let settings = self.settings[&key.0].clone();
            match settings.policy {
                CoalescePolicy::BestEffort => {
                    let stranded: Vec<TokenInfo> = Vec::new();
                    let (parents, merged_row) = self.merge(&key.0, &settings, state.arrivals)?;
                    out.push(ExpiredJoin { node_id: key.0.clone(),
                                           row_id: key.1,
                                           merged: Some((parents, merged_row)),
                                           stranded });
                }
                _ => {
                    // Sin fusión: el set queda varado y se marca failed.
                    out.push(ExpiredJoin { node_id: key.0.clone(),
                                           row_id: key.1,
                                           merged: None,
                                           stranded: state.arrivals.into_iter().map(|(_, t)| t).collect() });
                }
            }
        }
        Ok(out)
    }

    /// Joins aún pendientes (diagnóstico al finalizar el run).
    pub fn pending_joins(&self) -> Vec<(String, Uuid, Vec<String>)> {
        self.pending
            .iter()
            .map(|((node_id, row_id), state)| {
                (node_id.clone(), *row_id, state.arrivals.keys().cloned().collect())
            })
            .collect()
    }

    /// Drena los tokens de todos los joins pendientes (cierre del run).
    pub fn drain_pending(&mut self) -> Vec<(String, Vec<TokenInfo>)> {
        let mut out = Vec::new();
        for ((node_id, _), state) in self.pending.drain() {
            out.push((node_id, state.arrivals.into_iter().map(|(_, t)| t).collect()));
        }
        out
    }

    fn merge(&self,
             node_id: &str,
             settings: &CoalesceSettings,
             arrivals: IndexMap<String, TokenInfo>)
             -> Result<(Vec<TokenInfo>, PipelineRow), EngineError> {
        // Padres en orden de rama declarada; llegados pero no declarados es
        // imposible (validado en accept).
        let mut parents: Vec<TokenInfo> = Vec::with_capacity(arrivals.len());
        for branch in settings.branches.keys() {
            if let Some(token) = arrivals.get(branch) {
                parents.push(token.clone());
            }
        }

        let merged_map: IndexMap<String, Value> = match settings.merge {
            MergeStrategy::Union => {
                // Aplanar en orden de rama declarada; tipos compatibles en
                // solapes garantizados por el builder.
                let mut out = IndexMap::new();
                for parent in &parents {
                    for (k, v) in parent.row.iter() {
                        out.insert(k.clone(), v.clone());
                    }
                }
                out
            }
            MergeStrategy::Nested => {
                let mut out = IndexMap::new();
                for parent in &parents {
                    let branch = parent.branch_name.clone().expect("coalesce parents carry branch names");
                    out.insert(branch, parent.row.to_value());
                }
                out
            }
            MergeStrategy::Select => {
                let select = settings.select_branch.as_ref().expect("validated: select requires select_branch");
                let chosen = arrivals.get(select).ok_or_else(|| EngineError::CoalesceTimeout {
                                                      name: settings.name.clone(),
                                                      missing: vec![select.clone()],
                                                  })?;
                chosen.row.to_dict()
            }
        };

        let contract = self.merged_contract(node_id, settings, &parents)?;
        let merged_row = PipelineRow::from_trusted(merged_map, contract);
        Ok((parents, merged_row))
    }

    fn merged_contract(&self,
                       node_id: &str,
                       settings: &CoalesceSettings,
                       parents: &[TokenInfo])
                       -> Result<Arc<SchemaContract>, EngineError> {
        // select adopta el contrato de la rama elegida tal cual.
        if settings.merge == MergeStrategy::Select {
            let select = settings.select_branch.as_ref().expect("validated");
            if let Some(parent) = parents.iter().find(|p| p.branch_name.as_deref() == Some(select)) {
                return Ok(Arc::clone(parent.row.contract()));
            }
        }
        match self.schemas.get(node_id).and_then(|s| s.as_ref()) {
            Some(schema) => Ok(Arc::new(SchemaContract::from_schema_json(schema)
                .map_err(|e| EngineError::Corruption(format!("coalesce {node_id} schema: {e}")))?)),
            None => Ok(Arc::new(SchemaContract::new(ContractMode::Observed, Vec::new()).locked())),
        }
    }
}
