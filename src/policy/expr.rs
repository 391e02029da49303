//! A small, side-effect-free expression evaluator for policy conditions
//! and conditional-execution gates, not an embedded general-purpose
//! interpreter. Expressions are parsed once at profile load time so a
//! malformed expression quarantines the profile before any message is
//! processed; evaluation afterward can't fail on syntax, only on missing
//! fields or type mismatches at runtime.
//!
//! Surface: `&&`, `||`, `!`; `==`, `!=`, `<`, `<=`, `>`, `>=`; dotted field
//! access; `in` over literal arrays; `contains` over string fields;
//! `any(expr)`, `all(expr)`, `count(expr)` aggregations over sibling
//! responses (resolver-only: evaluating one against a context with no
//! siblings is a runtime error, not a parse error, matching "per-profile
//! conditions do not see siblings").

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
        }
    }

    fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(a) => Value::Array(a.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(_) => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
    Contains(Box<Expr>, Box<Expr>),
    Any(Box<Expr>),
    All(Box<Expr>),
    Count(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprError(pub String);

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ExprError {}

/// Evaluation context: the JSON value `self` refers to field access against,
/// and optionally a slice of sibling JSON values for `any`/`all`/`count`.
pub struct EvalContext<'a> {
    pub subject: &'a serde_json::Value,
    pub siblings: Option<&'a [serde_json::Value]>,
}

impl<'a> EvalContext<'a> {
    pub fn new(subject: &'a serde_json::Value) -> Self {
        Self {
            subject,
            siblings: None,
        }
    }

    pub fn with_siblings(subject: &'a serde_json::Value, siblings: &'a [serde_json::Value]) -> Self {
        Self {
            subject,
            siblings: Some(siblings),
        }
    }
}

/// Parse an expression. Called at profile load time; a parse failure
/// quarantines the owning profile.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError(format!(
            "unexpected trailing input at token {}",
            parser.pos
        )));
    }
    Ok(expr)
}

/// Evaluate a parsed expression against a context. Pure and terminates in
/// time linear in the expression's size (aggregations are linear in the
/// sibling count, bounded by the profile count in a registry).
pub fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Field(path) => Ok(lookup(ctx.subject, path)),
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, ctx)?.truthy())),
        Expr::And(a, b) => {
            let left = eval(a, ctx)?;
            if !left.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(b, ctx)?.truthy()))
        }
        Expr::Or(a, b) => {
            let left = eval(a, ctx)?;
            if left.truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(b, ctx)?.truthy()))
        }
        Expr::Cmp(op, a, b) => Ok(Value::Bool(compare(*op, &eval(a, ctx)?, &eval(b, ctx)?))),
        Expr::In(needle, haystack) => {
            let needle = eval(needle, ctx)?;
            match eval(haystack, ctx)? {
                Value::Array(items) => Ok(Value::Bool(items.contains(&needle))),
                other => Err(ExprError(format!("'in' requires an array, got {other:?}"))),
            }
        }
        Expr::Contains(field, needle) => {
            let haystack = eval(field, ctx)?;
            let needle = eval(needle, ctx)?;
            match (haystack, needle) {
                (Value::String(s), Value::String(n)) => Ok(Value::Bool(s.contains(&n))),
                (Value::Array(items), needle) => Ok(Value::Bool(items.contains(&needle))),
                (other, _) => Err(ExprError(format!("'contains' requires a string or array, got {other:?}"))),
            }
        }
        Expr::Any(inner) => aggregate(inner, ctx, Agg::Any),
        Expr::All(inner) => aggregate(inner, ctx, Agg::All),
        Expr::Count(inner) => aggregate(inner, ctx, Agg::Count),
    }
}

enum Agg {
    Any,
    All,
    Count,
}

fn aggregate(inner: &Expr, ctx: &EvalContext, kind: Agg) -> Result<Value, ExprError> {
    let siblings = ctx
        .siblings
        .ok_or_else(|| ExprError("aggregation expressions require sibling responses (resolver-only)".to_string()))?;

    let mut count = 0u32;
    let mut all_true = true;
    let mut any_true = false;
    for sibling in siblings {
        let sub_ctx = EvalContext::new(sibling);
        let truthy = eval(inner, &sub_ctx)?.truthy();
        if truthy {
            count += 1;
            any_true = true;
        } else {
            all_true = false;
        }
    }

    Ok(match kind {
        Agg::Any => Value::Bool(any_true),
        Agg::All => Value::Bool(all_true),
        Agg::Count => Value::Number(count as f64),
    })
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    let ord = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y).into()),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y).into()),
        _ => None,
    };

    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => ord == Some(std::cmp::Ordering::Less),
        CmpOp::Le => matches!(ord, Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)),
        CmpOp::Gt => ord == Some(std::cmp::Ordering::Greater),
        CmpOp::Ge => matches!(ord, Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)),
    }
}

fn lookup(root: &serde_json::Value, path: &[String]) -> Value {
    let mut current = root;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    Value::from_json(current)
}

// --- Tokenizer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    AndAnd,
    OrOr,
    Bang,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    Any,
    All,
    Count,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ExprError("unterminated string literal".to_string()));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| ExprError(format!("invalid number literal '{text}'")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "in" => Token::In,
                    "contains" => Token::Contains,
                    "any" => Token::Any,
                    "all" => Token::All,
                    "count" => Token::Count,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ExprError(format!("unexpected character '{other}'"))),
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

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, token: &Token) -> Result<(), ExprError> {
        match self.advance() {
            Some(t) if &t == token => Ok(()),
            other => Err(ExprError(format!("expected {token:?}, got {other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(Token::Bang)) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_membership()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        let Some(op) = op else { return Ok(left) };
        self.advance();
        let right = self.parse_membership()?;
        Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_membership(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_primary()?;
        match self.peek() {
            Some(Token::In) => {
                self.advance();
                let right = self.parse_primary()?;
                Ok(Expr::In(Box::new(left), Box::new(right)))
            }
            Some(Token::Contains) => {
                self.advance();
                let right = self.parse_primary()?;
                Ok(Expr::Contains(Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Token::RBracket)) {
                    loop {
                        let item = self.parse_literal_value()?;
                        items.push(item);
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::Literal(Value::Array(items)))
            }
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Any) => self.parse_call(Expr::Any as fn(Box<Expr>) -> Expr),
            Some(Token::All) => self.parse_call(Expr::All as fn(Box<Expr>) -> Expr),
            Some(Token::Count) => self.parse_call(Expr::Count as fn(Box<Expr>) -> Expr),
            Some(Token::Ident(name)) => {
                let mut path = vec![name];
                while matches!(self.peek(), Some(Token::Dot)) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        other => return Err(ExprError(format!("expected field segment, got {other:?}"))),
                    }
                }
                Ok(Expr::Field(path))
            }
            other => Err(ExprError(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_call(&mut self, ctor: fn(Box<Expr>) -> Expr) -> Result<Expr, ExprError> {
        self.expect(&Token::LParen)?;
        let inner = self.parse_or()?;
        self.expect(&Token::RParen)?;
        Ok(ctor(Box::new(inner)))
    }

    fn parse_literal_value(&mut self) -> Result<Value, ExprError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Value::Number(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            other => Err(ExprError(format!("expected literal, got {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_str(expr: &str, subject: &serde_json::Value) -> Value {
        let parsed = parse(expr).unwrap();
        eval(&parsed, &EvalContext::new(subject)).unwrap()
    }

    #[test]
    fn evaluates_comparisons_and_booleans() {
        let subject = json!({ "confidence": 0.9, "risk_factors": { "phishing_score": 0.8 } });
        assert_eq!(
            eval_str("confidence >= 0.7 && risk_factors.phishing_score > 0.5", &subject),
            Value::Bool(true)
        );
        assert_eq!(eval_str("confidence < 0.5", &subject), Value::Bool(false));
    }

    #[test]
    fn evaluates_membership_and_contains() {
        let subject = json!({ "action": "archive", "features": { "sender_domain": "evil.example.com" } });
        assert_eq!(
            eval_str(r#"action in ["archive", "star"]"#, &subject),
            Value::Bool(true)
        );
        assert_eq!(
            eval_str(r#"features.sender_domain contains "evil""#, &subject),
            Value::Bool(true)
        );
    }

    #[test]
    fn aggregations_require_siblings() {
        let subject = json!({});
        let expr = parse("any(confidence >= 0.7)").unwrap();
        let err = eval(&expr, &EvalContext::new(&subject)).unwrap_err();
        assert!(err.0.contains("resolver-only"));
    }

    #[test]
    fn aggregations_evaluate_over_siblings() {
        let siblings = vec![json!({ "confidence": 0.9 }), json!({ "confidence": 0.2 })];
        let subject = json!({});
        let ctx = EvalContext::with_siblings(&subject, &siblings);

        let any_expr = parse("any(confidence >= 0.7)").unwrap();
        assert_eq!(eval(&any_expr, &ctx).unwrap(), Value::Bool(true));

        let all_expr = parse("all(confidence >= 0.7)").unwrap();
        assert_eq!(eval(&all_expr, &ctx).unwrap(), Value::Bool(false));

        let count_expr = parse("count(confidence >= 0.1)").unwrap();
        assert_eq!(eval(&count_expr, &ctx).unwrap(), Value::Number(2.0));
    }

    #[test]
    fn rejects_malformed_expression() {
        assert!(parse("confidence >").is_err());
        assert!(parse("((unbalanced").is_err());
    }

    #[test]
    fn missing_field_is_null_not_error() {
        let subject = json!({});
        assert_eq!(eval_str("missing_field == 0", &subject), Value::Bool(false));
    }
}
