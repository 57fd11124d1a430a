//! Token manager: ciclo de vida de tokens y su contabilidad padre/outcome.
//!
//! Tres operaciones estructurales:
//! - `fork_token`: un padre → un hijo por rama, mismo fork_group_id; el
//!   padre queda FORKED (terminal para el token, NO completa la fila).
//! - `coalesce_tokens`: N padres con un join_group_id → un hijo fusionado;
//!   los padres quedan COALESCED.
//! - `expand_token`: una agregación emite varias filas; un hijo por fila con
//!   expand_group_id compartido; el padre queda EXPANDED (marcador de
//!   delegación, no completa la fila).

use auditflow_domain::PipelineRow;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::model::{RowOutcome, RowRecord, Token, TokenInfo, TokenParent};
use crate::recorder::LandscapeRecorder;

pub struct TokenManager {
    recorder: Arc<LandscapeRecorder>,
    run_id: Uuid,
}

impl TokenManager {
    pub fn new(recorder: Arc<LandscapeRecorder>, run_id: Uuid) -> Self {
        Self { recorder, run_id }
    }

    /// Token raíz de una fila recién leída del source.
    pub fn create_token(&self, row_record: &RowRecord, row: PipelineRow) -> Result<TokenInfo, EngineError> {
        let token = Token { token_id: Uuid::new_v4(),
                            row_id: row_record.row_id,
                            fork_group_id: None,
                            join_group_id: None,
                            expand_group_id: None,
                            branch_name: None,
                            step_in_pipeline: Some(1),
                            created_at: Utc::now() };
        self.recorder.insert_token(&token)?;
        Ok(TokenInfo::new(token.token_id, token.row_id, row))
    }

    /// Bifurca un padre hacia `branches`. Devuelve un hijo por rama, en el
    /// orden declarado; graba TokenParent por hijo y el outcome FORKED del
    /// padre.
    pub fn fork_token(&self,
                      parent: &TokenInfo,
                      branches: &[String],
                      step_in_pipeline: u32,
                      row: &PipelineRow)
                      -> Result<Vec<TokenInfo>, EngineError> {
        if branches.is_empty() {
            return Err(EngineError::Internal("fork_token with no branches".to_string()));
        }
        let fork_group_id = Uuid::new_v4();
        let mut children = Vec::with_capacity(branches.len());
        for (ordinal, branch) in branches.iter().enumerate() {
            let token = Token { token_id: Uuid::new_v4(),
                                row_id: parent.row_id,
                                fork_group_id: Some(fork_group_id),
                                join_group_id: None,
                                expand_group_id: None,
                                branch_name: Some(branch.clone()),
                                step_in_pipeline: Some(step_in_pipeline),
                                created_at: Utc::now() };
            self.recorder.insert_token(&token)?;
            self.recorder.insert_token_parent(&TokenParent { child_token_id: token.token_id,
                                                             parent_token_id: parent.token_id,
                                                             ordinal: ordinal as u32 })?;
            let mut child = TokenInfo::new(token.token_id, token.row_id, row.clone());
            child.branch_name = Some(branch.clone());
            children.push(child);
        }
        self.recorder.record_token_outcome(self.run_id,
                                           parent.token_id,
                                           RowOutcome::Forked,
                                           None,
                                           None,
                                           Some(fork_group_id),
                                           None,
                                           None)?;
        Ok(children)
    }

    /// Fusiona N padres en un hijo. Los padres quedan COALESCED bajo el
    /// join_group_id; el hijo registra una fila TokenParent por padre en
    /// orden de llegada.
    pub fn coalesce_tokens(&self,
                           parents: &[TokenInfo],
                           merged_row: PipelineRow,
                           step_in_pipeline: u32)
                           -> Result<TokenInfo, EngineError> {
        if parents.is_empty() {
            return Err(EngineError::Internal("coalesce_tokens with no parents".to_string()));
        }
        let join_group_id = Uuid::new_v4();
        let row_id = parents[0].row_id;
        let token = Token { token_id: Uuid::new_v4(),
                            row_id,
                            fork_group_id: None,
                            join_group_id: Some(join_group_id),
                            expand_group_id: None,
                            branch_name: None,
                            step_in_pipeline: Some(step_in_pipeline),
                            created_at: Utc::now() };
        self.recorder.insert_token(&token)?;
        for (ordinal, parent) in parents.iter().enumerate() {
            self.recorder.insert_token_parent(&TokenParent { child_token_id: token.token_id,
                                                             parent_token_id: parent.token_id,
                                                             ordinal: ordinal as u32 })?;
            self.recorder.record_token_outcome(self.run_id,
                                               parent.token_id,
                                               RowOutcome::Coalesced,
                                               None,
                                               None,
                                               Some(join_group_id),
                                               None,
                                               None)?;
        }
        Ok(TokenInfo::new(token.token_id, row_id, merged_row))
    }

    /// Hijos de salida de un lote: un hijo por fila, expand_group_id
    /// compartido, SIN outcome sobre el padre (los tokens consumidos del
    /// lote ya quedaron CONSUMED_IN_BATCH).
    pub fn create_output_tokens(&self,
                                parent: &TokenInfo,
                                rows: Vec<PipelineRow>,
                                step_in_pipeline: u32)
                                -> Result<Vec<TokenInfo>, EngineError> {
        let expand_group_id = Uuid::new_v4();
        let mut children = Vec::with_capacity(rows.len());
        for (ordinal, row) in rows.into_iter().enumerate() {
            let token = Token { token_id: Uuid::new_v4(),
                                row_id: parent.row_id,
                                fork_group_id: None,
                                join_group_id: None,
                                expand_group_id: Some(expand_group_id),
                                branch_name: None,
                                step_in_pipeline: Some(step_in_pipeline),
                                created_at: Utc::now() };
            self.recorder.insert_token(&token)?;
            self.recorder.insert_token_parent(&TokenParent { child_token_id: token.token_id,
                                                             parent_token_id: parent.token_id,
                                                             ordinal: ordinal as u32 })?;
            children.push(TokenInfo::new(token.token_id, token.row_id, row));
        }
        Ok(children)
    }

    /// Expansión post-transform multi-fila: un hijo por fila de salida. El
    /// padre queda EXPANDED (marcador de delegación, no completa la fila).
    pub fn expand_token(&self,
                        parent: &TokenInfo,
                        rows: Vec<PipelineRow>,
                        step_in_pipeline: u32)
                        -> Result<Vec<TokenInfo>, EngineError> {
        let expand_group_id = Uuid::new_v4();
        let mut children = Vec::with_capacity(rows.len());
        for (ordinal, row) in rows.into_iter().enumerate() {
            let token = Token { token_id: Uuid::new_v4(),
                                row_id: parent.row_id,
                                fork_group_id: None,
                                join_group_id: None,
                                expand_group_id: Some(expand_group_id),
                                branch_name: None,
                                step_in_pipeline: Some(step_in_pipeline),
                                created_at: Utc::now() };
            self.recorder.insert_token(&token)?;
            self.recorder.insert_token_parent(&TokenParent { child_token_id: token.token_id,
                                                             parent_token_id: parent.token_id,
                                                             ordinal: ordinal as u32 })?;
            children.push(TokenInfo::new(token.token_id, token.row_id, row));
        }
        self.recorder.record_token_outcome(self.run_id,
                                           parent.token_id,
                                           RowOutcome::Expanded,
                                           None,
                                           None,
                                           Some(expand_group_id),
                                           None,
                                           None)?;
        Ok(children)
    }
}
