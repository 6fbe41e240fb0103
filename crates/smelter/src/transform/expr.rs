//! Restricted expression grammar for calculated columns and row filters.
//!
//! Arithmetic and comparison operators over column references and literals,
//! nothing else. No function calls, no indexing, no code execution.
//!
//! ```text
//! expr    := cmp
//! cmp     := add (("<" | "<=" | ">" | ">=" | "==" | "!=") add)?
//! add     := mul (("+" | "-") mul)*
//! mul     := unary (("*" | "/") unary)*
//! unary   := "-" unary | primary
//! primary := number | string | ident | "(" expr ")"
//! ```

use serde_json::Value;

use crate::table::cell_to_f64;

/// A parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Column(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Expr {
    /// Parse an expression, or explain why it is malformed.
    pub fn parse(input: &str) -> Result<Expr, String> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_cmp()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!(
                "unexpected trailing token {:?}",
                parser.tokens[parser.pos]
            ));
        }
        Ok(expr)
    }

    /// Column names referenced anywhere in the tree.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Column(name) => out.push(name),
            Expr::Neg(inner) => inner.collect_columns(out),
            Expr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Number(_) | Expr::Str(_) => {}
        }
    }

    /// Evaluate against one row. A null operand propagates to a null result.
    pub fn eval(&self, lookup: &dyn Fn(&str) -> Value) -> Value {
        match self.eval_inner(lookup) {
            Some(Operand::Num(n)) => Value::from(n),
            Some(Operand::Str(s)) => Value::String(s),
            Some(Operand::Bool(b)) => Value::Bool(b),
            None => Value::Null,
        }
    }

    fn eval_inner(&self, lookup: &dyn Fn(&str) -> Value) -> Option<Operand> {
        match self {
            Expr::Number(n) => Some(Operand::Num(*n)),
            Expr::Str(s) => Some(Operand::Str(s.clone())),
            Expr::Column(name) => Operand::from_value(lookup(name)),
            Expr::Neg(inner) => match inner.eval_inner(lookup)? {
                Operand::Num(n) => Some(Operand::Num(-n)),
                _ => None,
            },
            Expr::Binary { op, left, right } => {
                let left = left.eval_inner(lookup)?;
                let right = right.eval_inner(lookup)?;
                apply(*op, left, right)
            }
        }
    }
}

/// Runtime operand during evaluation.
enum Operand {
    Num(f64),
    Str(String),
    Bool(bool),
}

impl Operand {
    fn from_value(value: Value) -> Option<Operand> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Operand::Bool(b)),
            Value::Number(_) => cell_to_f64(&value).map(Operand::Num),
            Value::String(s) => Some(Operand::Str(s)),
            // Structured cells never participate in expressions.
            _ => None,
        }
    }
}

fn apply(op: BinOp, left: Operand, right: Operand) -> Option<Operand> {
    use BinOp::*;
    use Operand::*;

    // Numeric strings participate in arithmetic like numbers do.
    let as_num = |operand: &Operand| match operand {
        Num(n) => Some(*n),
        Str(s) => s.trim().parse::<f64>().ok(),
        Bool(_) => None,
    };

    match op {
        Add | Sub | Mul | Div => {
            let (l, r) = (as_num(&left)?, as_num(&right)?);
            let value = match op {
                Add => l + r,
                Sub => l - r,
                Mul => l * r,
                Div => {
                    if r == 0.0 {
                        return None;
                    }
                    l / r
                }
                _ => unreachable!(),
            };
            Some(Num(value))
        }
        Lt | Le | Gt | Ge => {
            let (l, r) = (as_num(&left)?, as_num(&right)?);
            let value = match op {
                Lt => l < r,
                Le => l <= r,
                Gt => l > r,
                Ge => l >= r,
                _ => unreachable!(),
            };
            Some(Bool(value))
        }
        Eq | Ne => {
            let equal = match (&left, &right) {
                (Str(a), Str(b)) => a == b,
                (Bool(a), Bool(b)) => a == b,
                _ => match (as_num(&left), as_num(&right)) {
                    (Some(a), Some(b)) => a == b,
                    _ => return None,
                },
            };
            Some(Bool(if op == Eq { equal } else { !equal }))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(BinOp),
    Minus,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Op(BinOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinOp::Div));
                i += 1;
            }
            '<' | '>' | '=' | '!' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let (op, len) = match two.as_str() {
                    "<=" => (BinOp::Le, 2),
                    ">=" => (BinOp::Ge, 2),
                    "==" => (BinOp::Eq, 2),
                    "!=" => (BinOp::Ne, 2),
                    _ if c == '<' => (BinOp::Lt, 1),
                    _ if c == '>' => (BinOp::Gt, 1),
                    _ => return Err(format!("unexpected character '{c}'")),
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            '\'' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&c| c == '\'')
                    .ok_or("unterminated string literal")?;
                tokens.push(Token::Str(chars[start..start + end].iter().collect()));
                i = start + end + 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse().map_err(|_| format!("bad number '{text}'"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_cmp(&mut self) -> Result<Expr, String> {
        let left = self.parse_add()?;
        if let Some(Token::Op(op)) = self.peek() {
            if matches!(
                op,
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
            ) {
                let op = *op;
                self.pos += 1;
                let right = self.parse_add()?;
                return Ok(Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                });
            }
        }
        Ok(left)
    }

    fn parse_add(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(BinOp::Add)) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_mul()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(op @ (BinOp::Mul | BinOp::Div))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => Ok(Expr::Column(name)),
            Some(Token::LParen) => {
                let inner = self.parse_cmp()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, cells: &[(&str, Value)]) -> Value {
        let parsed = Expr::parse(expr).unwrap();
        parsed.eval(&|name| {
            cells
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null)
        })
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[]), json!(7.0));
        assert_eq!(eval("(1 + 2) * 3", &[]), json!(9.0));
        assert_eq!(eval("-2 * 3", &[]), json!(-6.0));
    }

    #[test]
    fn test_column_references() {
        let cells = [("cd", json!(45.0)), ("target", json!(50.0))];
        assert_eq!(eval("cd / target", &cells), json!(0.9));
        assert_eq!(eval("cd - target", &cells), json!(-5.0));
    }

    #[test]
    fn test_comparisons() {
        let cells = [("cd", json!(45.0))];
        assert_eq!(eval("cd < 50", &cells), json!(true));
        assert_eq!(eval("cd >= 50", &cells), json!(false));
        assert_eq!(eval("cd == 45", &cells), json!(true));
    }

    #[test]
    fn test_string_equality() {
        let cells = [("status", json!("pass"))];
        assert_eq!(eval("status == 'pass'", &cells), json!(true));
        assert_eq!(eval("status != 'fail'", &cells), json!(true));
    }

    #[test]
    fn test_null_propagates() {
        assert_eq!(eval("cd * 2", &[("cd", Value::Null)]), Value::Null);
        assert_eq!(eval("1 / 0", &[]), Value::Null);
    }

    #[test]
    fn test_numeric_strings_participate() {
        assert_eq!(eval("cd + 1", &[("cd", json!("41"))]), json!(42.0));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("1 +").is_err());
        assert!(Expr::parse("(1").is_err());
        assert!(Expr::parse("a b").is_err());
        assert!(Expr::parse("import os").is_err());
    }
}
