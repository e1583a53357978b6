//! Restricted boolean expressions for condition steps.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! or      := and ("||" and)*
//! and     := equality ("&&" equality)*
//! equality:= compare (("==" | "!=" | "===" | "!==") compare)*
//! compare := sum (("<" | "<=" | ">" | ">=") sum)*
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/" | "%") unary)*
//! unary   := ("!" | "-") unary | primary
//! primary := number | string | true | false | null | path | "(" or ")"
//! path    := ident ("." ident | "[" (number | string) "]")*
//! ```
//!
//! Expressions are parsed into a tree and evaluated against the variable
//! map; nothing is ever executed. Input outside the grammar (calls,
//! assignment, unknown characters) is a parse error.

use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::template::{lookup_segments, PathSegment};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("Unexpected character '{0}' in expression")]
    UnexpectedChar(char),

    #[error("Unexpected token '{0}' in expression")]
    UnexpectedToken(String),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Invalid number literal '{0}'")]
    InvalidNumber(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Expression nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("Expression longer than {0} tokens")]
    TooLong(usize),
}

/// Nesting of parentheses and prefix operators.
const MAX_DEPTH: usize = 64;
/// Bounds left-leaning operator chains, which are evaluated recursively.
const MAX_TOKENS: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Ident(s) => f.write_str(s),
            Token::Op(op) => f.write_str(op),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::LBracket => f.write_str("["),
            Token::RBracket => f.write_str("]"),
            Token::Dot => f.write_str("."),
        }
    }
}

const OPERATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!",
];

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '$'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        if ch.is_ascii_digit() {
            let start = i;
            while i < chars.len() {
                let fraction = chars[i] == '.'
                    && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit());
                if !(chars[i].is_ascii_digit() || fraction) {
                    break;
                }
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal
                .parse::<f64>()
                .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?;
            tokens.push(Token::Number(value));
            continue;
        }

        if ch == '"' || ch == '\'' {
            let quote = ch;
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(ExpressionError::UnterminatedString),
                    Some('\\') => {
                        if let Some(&escaped) = chars.get(i + 1) {
                            value.push(escaped);
                        }
                        i += 2;
                    }
                    Some(&c) if c == quote => {
                        i += 1;
                        break;
                    }
                    Some(&c) => {
                        value.push(c);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(value));
            continue;
        }

        if is_ident_start(ch) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let single = match ch {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '.' => Some(Token::Dot),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(token);
            i += 1;
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token::Op(op));
                i += op.len();
            }
            None => return Err(ExpressionError::UnexpectedChar(ch)),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<PathSegment>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn nested<T>(
        &mut self,
        inner: impl FnOnce(&mut Self) -> Result<T, ExpressionError>,
    ) -> Result<T, ExpressionError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExpressionError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let result = inner(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn parse(mut self) -> Result<Expr, ExpressionError> {
        if self.tokens.len() > MAX_TOKENS {
            return Err(ExpressionError::TooLong(MAX_TOKENS));
        }
        let expr = self.or()?;
        match self.next() {
            None => Ok(expr),
            Some(token) => Err(ExpressionError::UnexpectedToken(token.to_string())),
        }
    }

    fn binary_level(
        &mut self,
        ops: &[&'static str],
        next: fn(&mut Self) -> Result<Expr, ExpressionError>,
    ) -> Result<Expr, ExpressionError> {
        let mut left = next(self)?;
        while let Some(op) = self.eat_op(ops) {
            let right = next(self)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&["||"], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&["&&"], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&["===", "!==", "==", "!="], Self::compare)
    }

    fn compare(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&["<=", ">=", "<", ">"], Self::sum)
    }

    fn sum(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&["+", "-"], Self::product)
    }

    fn product(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&["*", "/", "%"], Self::unary)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.eat_op(&["!", "-"]) {
            Some("!") => Ok(Expr::Not(Box::new(self.nested(Self::unary)?))),
            Some(_) => Ok(Expr::Neg(Box::new(self.nested(Self::unary)?))),
            None => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next().ok_or(ExpressionError::UnexpectedEnd)? {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.nested(Self::or)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExpressionError::UnexpectedToken(other.to_string())),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                _ => self.path(name),
            },
            other => Err(ExpressionError::UnexpectedToken(other.to_string())),
        }
    }

    fn path(&mut self, root: String) -> Result<Expr, ExpressionError> {
        let mut segments = vec![PathSegment::Key(root)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(key)) => segments.push(PathSegment::Key(key)),
                        Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                            segments.push(PathSegment::Index(n as usize))
                        }
                        Some(other) => return Err(ExpressionError::UnexpectedToken(other.to_string())),
                        None => return Err(ExpressionError::UnexpectedEnd),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let segment = match self.next() {
                        Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                            PathSegment::Index(n as usize)
                        }
                        Some(Token::Str(key)) => PathSegment::Key(key),
                        Some(other) => return Err(ExpressionError::UnexpectedToken(other.to_string())),
                        None => return Err(ExpressionError::UnexpectedEnd),
                    };
                    match self.next() {
                        Some(Token::RBracket) => segments.push(segment),
                        Some(other) => return Err(ExpressionError::UnexpectedToken(other.to_string())),
                        None => return Err(ExpressionError::UnexpectedEnd),
                    }
                }
                _ => return Ok(Expr::Path(segments)),
            }
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_number(value: &Value, op: &str) -> Result<f64, ExpressionError> {
    value.as_f64().ok_or_else(|| {
        ExpressionError::Type(format!("operator '{}' needs numbers, got {}", op, value))
    })
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn eval(expr: &Expr, variables: &Map<String, Value>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => Ok(lookup_segments(variables, segments)
            .cloned()
            .unwrap_or(Value::Null)),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, variables)?))),
        Expr::Neg(inner) => Ok(number(-as_number(&eval(inner, variables)?, "-")?)),
        Expr::Binary(op, left, right) => {
            // Short-circuit before touching the right side
            match *op {
                "&&" => {
                    let l = truthy(&eval(left, variables)?);
                    return Ok(Value::Bool(l && truthy(&eval(right, variables)?)));
                }
                "||" => {
                    let l = truthy(&eval(left, variables)?);
                    return Ok(Value::Bool(l || truthy(&eval(right, variables)?)));
                }
                _ => {}
            }

            let l = eval(left, variables)?;
            let r = eval(right, variables)?;
            match *op {
                "==" | "===" => Ok(Value::Bool(loosely_equal(&l, &r))),
                "!=" | "!==" => Ok(Value::Bool(!loosely_equal(&l, &r))),
                "<" | "<=" | ">" | ">=" => Ok(Value::Bool(compare(op, &l, &r))),
                "+" => match (&l, &r) {
                    (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
                        "{}{}",
                        super::template::to_text(&l),
                        super::template::to_text(&r)
                    ))),
                    _ => Ok(number(as_number(&l, op)? + as_number(&r, op)?)),
                },
                "-" => Ok(number(as_number(&l, op)? - as_number(&r, op)?)),
                "*" => Ok(number(as_number(&l, op)? * as_number(&r, op)?)),
                "/" | "%" => {
                    let (a, b) = (as_number(&l, op)?, as_number(&r, op)?);
                    if b == 0.0 {
                        return Err(ExpressionError::DivisionByZero);
                    }
                    Ok(number(if *op == "/" { a / b } else { a % b }))
                }
                other => Err(ExpressionError::UnexpectedToken(other.to_string())),
            }
        }
    }
}

/// Mismatched or unordered operand types compare as false.
fn compare(op: &str, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        _ => ordering.is_ge(),
    }
}

/// Parse without evaluating, e.g. to reject a malformed condition early.
pub fn check(expression: &str) -> Result<(), ExpressionError> {
    Parser::new(tokenize(expression)?).parse().map(|_| ())
}

pub fn evaluate(expression: &str, variables: &Map<String, Value>) -> Result<Value, ExpressionError> {
    let expr = Parser::new(tokenize(expression)?).parse()?;
    eval(&expr, variables)
}

pub fn evaluate_bool(expression: &str, variables: &Map<String, Value>) -> Result<bool, ExpressionError> {
    evaluate(expression, variables).map(|v| truthy(&v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        json!({
            "count": 5,
            "price": 2.5,
            "name": "Ada",
            "fetch": {"status": 200, "items": [{"ok": true}, {"ok": false}]},
            "empty": "",
            "$index": 1
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn eval_ok(expr: &str) -> Value {
        evaluate(expr, &vars()).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval_ok("1 + 2 * 3"), json!(7));
        assert_eq!(eval_ok("(1 + 2) * 3"), json!(9));
        assert_eq!(eval_ok("count % 2"), json!(1));
        assert_eq!(eval_ok("price * 2"), json!(5));
        assert_eq!(eval_ok("-count + 1"), json!(-4));
        assert_eq!(eval_ok("7 / 2"), json!(3.5));
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval_ok("count > 3 && name == 'Ada'"), json!(true));
        assert_eq!(eval_ok("count >= 6 || !empty"), json!(true));
        assert_eq!(eval_ok("fetch.status === 200"), json!(true));
        assert_eq!(eval_ok("fetch.status != 200"), json!(false));
        assert_eq!(eval_ok("'abc' < 'abd'"), json!(true));
        assert_eq!(eval_ok("name < 3"), json!(false));
    }

    #[test]
    fn test_path_lookups() {
        assert_eq!(eval_ok("fetch.items[0].ok"), json!(true));
        assert_eq!(eval_ok(r#"fetch["items"][1].ok"#), json!(false));
        assert_eq!(eval_ok("fetch.items.1.ok"), json!(false));
        assert_eq!(eval_ok("$index == 1"), json!(true));
        assert_eq!(eval_ok("missing.deep"), Value::Null);
        assert_eq!(eval_ok("missing == null"), json!(true));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(eval_ok("name + '-' + count"), json!("Ada-5"));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert_eq!(eval_ok("false && (1 / 0)"), json!(false));
        assert_eq!(eval_ok("true || (1 / 0)"), json!(true));
    }

    #[test]
    fn test_outside_grammar_rejected() {
        assert!(matches!(
            evaluate("count = 3", &vars()),
            Err(ExpressionError::UnexpectedChar('='))
        ));
        assert!(matches!(
            evaluate("process.exit(1)", &vars()),
            Err(ExpressionError::UnexpectedToken(t)) if t == "("
        ));
        assert!(evaluate("count; name", &vars()).is_err());
        assert!(evaluate("`rm -rf`", &vars()).is_err());
        assert!(evaluate("a[b]", &vars()).is_err());
        assert!(evaluate("(1 + 2", &vars()).is_err());
        assert!(evaluate("'open", &vars()).is_err());
        assert!(check("count >").is_err());
    }

    #[test]
    fn test_runtime_errors() {
        assert_eq!(evaluate("1 / 0", &vars()), Err(ExpressionError::DivisionByZero));
        assert!(matches!(evaluate("name * 2", &vars()), Err(ExpressionError::Type(_))));
    }

    #[test]
    fn test_truthiness() {
        assert!(evaluate_bool("fetch", &vars()).unwrap());
        assert!(!evaluate_bool("empty", &vars()).unwrap());
        assert!(!evaluate_bool("0", &vars()).unwrap());
    }

    #[test]
    fn test_nesting_is_bounded() {
        let nested = |n: usize| format!("{}true{}", "(".repeat(n), ")".repeat(n));
        assert!(evaluate_bool(&nested(20), &vars()).unwrap());
        assert_eq!(check(&nested(65)), Err(ExpressionError::TooDeep(64)));
        assert_eq!(
            check(&format!("{}true", "!".repeat(100))),
            Err(ExpressionError::TooDeep(64))
        );
        // Rejected before any recursion happens
        assert_eq!(
            evaluate_bool(&nested(100_000), &vars()),
            Err(ExpressionError::TooLong(1024))
        );
        assert_eq!(
            check(&vec!["1"; 2000].join(" + ")),
            Err(ExpressionError::TooLong(1024))
        );
    }
}
