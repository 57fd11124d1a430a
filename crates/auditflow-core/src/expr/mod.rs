//! Sandbox de expresiones para gates y triggers de configuración.
//!
//! Gramática permitida (validada al cargar config, compilada una vez):
//! - Literales: números, strings, true/false/True/False, null/None.
//! - Indexación de mapeo sobre `row`: `row['campo']` o `row["campo"]`.
//! - Comparaciones: == != < <= > >=.
//! - Operadores booleanos: and, or, not. Paréntesis.
//!
//! Construcciones rechazadas (error de seguridad, no de sintaxis): acceso a
//! atributos, llamadas, cualquier nombre distinto de `row`. La expresión no
//! puede tocar nada fuera de los campos de la fila.

mod lexer;
mod parser;

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

pub use parser::Expr;

use crate::errors::EngineError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("syntax error in expression: {0}")] Syntax(String),
    #[error("forbidden construct in expression: {0}")] Security(String),
    #[error("expression evaluation error: {0}")] Eval(String),
}

impl From<ExpressionError> for EngineError {
    fn from(e: ExpressionError) -> Self {
        EngineError::Config(e.to_string())
    }
}

/// Expresión compilada, lista para evaluarse contra filas.
#[derive(Debug, Clone)]
pub struct ExpressionParser {
    source: String,
    expr: Expr,
}

impl ExpressionParser {
    /// Compila la expresión. Sintaxis inválida y construcciones prohibidas
    /// se detectan acá, en tiempo de carga de configuración.
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        let tokens = lexer::tokenize(source)?;
        let expr = parser::parse(&tokens)?;
        Ok(Self { source: source.to_string(),
                  expr })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Una expresión es booleana cuando su nodo raíz produce bool por
    /// construcción (comparación, and/or/not o literal booleano). Gobierna
    /// la validación de labels {true,false} en gates.
    pub fn is_boolean_expression(&self) -> bool {
        self.expr.is_boolean()
    }

    /// Evalúa contra los campos de una fila.
    pub fn evaluate(&self, row: &IndexMap<String, Value>) -> Result<Value, ExpressionError> {
        self.expr.evaluate(row)
    }

    /// Evalúa esperando bool; cualquier otro resultado es error del llamador.
    pub fn evaluate_bool(&self, row: &IndexMap<String, Value>) -> Result<bool, ExpressionError> {
        match self.evaluate(row)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::Eval(format!("expected boolean result, got: {other}"))),
        }
    }
}
