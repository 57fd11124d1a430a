//! Tokenizador del sandbox de expresiones.
//!
//! Distingue errores de sintaxis (malformación) de errores de seguridad
//! (construcciones prohibidas): un `.` o un identificador desconocido no es
//! un typo cualquiera, es un intento de salir del sandbox y se reporta como
//! tal.

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Row,
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Number(f64),
    Int(i64),
    Str(String),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                return Err(ExpressionError::Security("attribute access is not allowed".to_string()));
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(ExpressionError::Syntax("'=' is not an operator; use '=='".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(ExpressionError::Syntax("unexpected '!'".to_string()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(ExpressionError::Syntax("unterminated string literal".to_string())),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                if c == '-' {
                    i += 1;
                    if !chars.get(i).map(|ch| ch.is_ascii_digit()).unwrap_or(false) {
                        return Err(ExpressionError::Syntax("unexpected '-'".to_string()));
                    }
                }
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        if is_float {
                            return Err(ExpressionError::Syntax("malformed number".to_string()));
                        }
                        is_float = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let f = text.parse::<f64>()
                                .map_err(|_| ExpressionError::Syntax(format!("malformed number: {text}")))?;
                    tokens.push(Token::Number(f));
                } else {
                    let n = text.parse::<i64>()
                                .map_err(|_| ExpressionError::Syntax(format!("malformed number: {text}")))?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "row" => tokens.push(Token::Row),
                    "true" | "True" => tokens.push(Token::True),
                    "false" | "False" => tokens.push(Token::False),
                    "null" | "None" => tokens.push(Token::Null),
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    other => {
                        return Err(ExpressionError::Security(format!("name '{other}' is not allowed; only 'row' may be referenced")));
                    }
                }
            }
            other => {
                return Err(ExpressionError::Syntax(format!("unexpected character: '{other}'")));
            }
        }
    }

    if tokens.is_empty() {
        return Err(ExpressionError::Syntax("empty expression".to_string()));
    }
    Ok(tokens)
}
