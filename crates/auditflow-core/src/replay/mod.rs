//! Verificación de re-ejecuciones: los hashes son la superficie de
//! comparación.
//!
//! En modo `verify`, el run candidato se compara contra un run base por
//! estado de nodo, correlacionando por (node_id, row_index, step_index,
//! attempt). Cualquier diferencia de output_hash es un mismatch; el reporte
//! se adjunta al run y un mismatch ⇒ run failed.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::model::NodeState;
use crate::recorder::LandscapeRecorder;

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyMismatch {
    pub node_id: String,
    pub row_index: u64,
    pub step_index: u32,
    pub attempt: u32,
    pub baseline_hash: Option<String>,
    pub candidate_hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub mismatches: Vec<VerifyMismatch>,
    pub compared_states: usize,
    /// Estados del baseline sin contraparte en el candidato.
    pub missing_in_candidate: usize,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.missing_in_candidate == 0
    }
}

/// Compara los output_hash de dos runs estado por estado.
pub fn compare_runs(recorder: &Arc<LandscapeRecorder>,
                    baseline_run: Uuid,
                    candidate_run: Uuid)
                    -> Result<VerifyReport, EngineError> {
    let baseline = index_states(recorder, baseline_run)?;
    let candidate = index_states(recorder, candidate_run)?;

    let mut report = VerifyReport::default();
    for (key, base_hash) in &baseline {
        match candidate.get(key) {
            Some(cand_hash) => {
                report.compared_states += 1;
                if base_hash != cand_hash {
                    let (node_id, row_index, step_index, attempt) = key.clone();
                    report.mismatches.push(VerifyMismatch { node_id,
                                                            row_index,
                                                            step_index,
                                                            attempt,
                                                            baseline_hash: base_hash.clone(),
                                                            candidate_hash: cand_hash.clone() });
                }
            }
            None => report.missing_in_candidate += 1,
        }
    }
    Ok(report)
}

type StateKey = (String, u64, u32, u32);

fn index_states(recorder: &Arc<LandscapeRecorder>,
                run_id: Uuid)
                -> Result<HashMap<StateKey, Option<String>>, EngineError> {
    // token → row_index para correlacionar estados entre runs.
    let rows = recorder.get_rows(run_id)?;
    let mut token_to_row_index: HashMap<Uuid, u64> = HashMap::new();
    for row in &rows {
        for token in recorder.get_tokens(row.row_id)? {
            token_to_row_index.insert(token.token_id, row.row_index);
        }
    }

    let mut out = HashMap::new();
    for state in recorder.get_all_node_states_for_run(run_id)? {
        let common = state.common();
        let Some(row_index) = token_to_row_index.get(&common.token_id) else { continue };
        let hash = match &state {
            NodeState::Completed { output_hash, .. } => Some(output_hash.clone()),
            NodeState::Failed { output_hash, .. } => output_hash.clone(),
            _ => None,
        };
        out.insert((common.node_id.clone(), *row_index, common.step_index, common.attempt), hash);
    }
    Ok(out)
}
