//! Parser descendente recursivo del sandbox.
//!
//! Precedencia (menor a mayor): or, and, not, comparación, primario.
//! No hay encadenamiento de comparaciones: `a < b < c` es error de sintaxis.

use indexmap::IndexMap;
use serde_json::Value;

use super::lexer::Token;
use super::ExpressionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// AST tipado del sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    RowIndex(String),
    Compare { op: CmpOp, left: Box<Expr>, right: Box<Expr> },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// El nodo produce bool por construcción.
    pub fn is_boolean(&self) -> bool {
        match self {
            Expr::Compare { .. } | Expr::And(..) | Expr::Or(..) | Expr::Not(..) => true,
            Expr::Literal(Value::Bool(_)) => true,
            _ => false,
        }
    }

    pub fn evaluate(&self, row: &IndexMap<String, Value>) -> Result<Value, ExpressionError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::RowIndex(field) => row.get(field)
                                        .cloned()
                                        .ok_or_else(|| ExpressionError::Eval(format!("row has no field '{field}'"))),
            Expr::Compare { op, left, right } => {
                let l = left.evaluate(row)?;
                let r = right.evaluate(row)?;
                compare(*op, &l, &r).map(Value::Bool)
            }
            Expr::And(a, b) => {
                // Cortocircuito como en el lenguaje fuente de las configs.
                if !truthy(&a.evaluate(row)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&b.evaluate(row)?)))
            }
            Expr::Or(a, b) => {
                if truthy(&a.evaluate(row)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&b.evaluate(row)?)))
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&inner.evaluate(row)?))),
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, ExpressionError> {
    match op {
        CmpOp::Eq => Ok(json_eq(l, r)),
        CmpOp::Ne => Ok(!json_eq(l, r)),
        _ => {
            // Comparaciones de orden: números entre sí, strings entre sí.
            if let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) {
                Ok(match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                })
            } else if let (Value::String(a), Value::String(b)) = (l, r) {
                Ok(match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                })
            } else {
                Err(ExpressionError::Eval(format!("cannot order-compare {l} and {r}")))
            }
        }
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn json_eq(l: &Value, r: &Value) -> bool {
    // Igualdad numérica tolerante a int/float (1 == 1.0).
    if let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) {
        return a == b;
    }
    l == r
}

pub fn parse(tokens: &[Token]) -> Result<Expr, ExpressionError> {
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.parse_or()?;
    if p.pos != tokens.len() {
        return Err(ExpressionError::Syntax("trailing tokens after expression".to_string()));
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ExpressionError> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            other => Err(ExpressionError::Syntax(format!("expected {what}, got {other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            let right = self.parse_primary()?;
            // Sin encadenamiento: un segundo operador de comparación es error.
            if matches!(self.peek(),
                        Some(Token::Eq | Token::Ne | Token::Lt | Token::Le | Token::Gt | Token::Ge))
            {
                return Err(ExpressionError::Syntax("comparison chaining is not supported".to_string()));
            }
            return Ok(Expr::Compare { op,
                                      left: Box::new(left),
                                      right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Row) => {
                self.expect(&Token::LBracket, "'[' after row")?;
                let field = match self.next() {
                    Some(Token::Str(s)) => s.clone(),
                    other => {
                        return Err(ExpressionError::Syntax(format!("expected string key in row[...], got {other:?}")));
                    }
                };
                self.expect(&Token::RBracket, "']' after row key")?;
                Ok(Expr::RowIndex(field))
            }
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(*n))),
            Some(Token::Number(f)) => {
                let n = serde_json::Number::from_f64(*f)
                    .ok_or_else(|| ExpressionError::Syntax(format!("number not representable: {f}")))?;
                Ok(Expr::Literal(Value::Number(n)))
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s.clone()))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            other => Err(ExpressionError::Syntax(format!("unexpected token: {other:?}"))),
        }
    }
}
