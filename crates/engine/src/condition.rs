//! Edge conditions.
//!
//! A condition is `"always"`, `"never"`, or a boolean expression over
//! `{{dotted.path}}` placeholders:
//!
//! ```text
//! or       := and ( "||" and )*
//! and      := equality ( "&&" equality )*
//! equality := relation ( ("==" | "!=" | "===" | "!==") relation )*
//! relation := unary ( ("<" | "<=" | ">" | ">=") unary )*
//! unary    := ("!" | "-") unary | primary
//! primary  := number | string | true | false | null | undefined
//!           | "{{" path "}}" | "(" or ")"
//! ```
//!
//! Placeholders resolve against the flow context at evaluation time; a
//! missing path reads as `null`.  Comparison and truthiness follow script
//! semantics.  A condition that fails to parse is kept and always
//! evaluates to `false`.

use std::cmp::Ordering;

use nodes::is_truthy;
use serde_json::Value;

use crate::error::ConditionError;

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Number(f64),
    Str(String),
    Literal(Value),
    Op(&'static str),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Path(p) => format!("{{{{{p}}}}}"),
            Token::Number(n) => n.to_string(),
            Token::Str(s) => format!("'{s}'"),
            Token::Literal(v) => v.to_string(),
            Token::Op(op) => (*op).to_string(),
        }
    }
}

/// Longest first, so `===` is not read as `==` `=`.
const OPERATORS: [&str; 14] = [
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "-", "(", ")",
];

fn tokenize(src: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while let Some(ch) = src[pos..].chars().next() {
        let rest = &src[pos..];

        if ch.is_whitespace() {
            pos += ch.len_utf8();
        } else if let Some(body) = rest.strip_prefix("{{") {
            let end = body
                .find("}}")
                .ok_or(ConditionError::UnterminatedPlaceholder(pos))?;
            tokens.push(Token::Path(body[..end].trim().to_owned()));
            pos += end + 4;
        } else if let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            tokens.push(Token::Op(*op));
            pos += op.len();
        } else if ch.is_ascii_digit() || ch == '.' {
            let len = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(rest.len());
            let number = rest[..len]
                .parse::<f64>()
                .map_err(|_| ConditionError::UnexpectedChar { ch, offset: pos })?;
            tokens.push(Token::Number(number));
            pos += len;
        } else if ch == '\'' || ch == '"' {
            let (text, len) = lex_string(rest, ch).ok_or(ConditionError::UnterminatedString(pos))?;
            tokens.push(Token::Str(text));
            pos += len;
        } else if ch.is_ascii_alphabetic() || ch == '_' {
            let len = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            let literal = match &rest[..len] {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" | "undefined" => Value::Null,
                ident => return Err(ConditionError::UnexpectedToken(ident.to_owned())),
            };
            tokens.push(Token::Literal(literal));
            pos += len;
        } else {
            return Err(ConditionError::UnexpectedChar { ch, offset: pos });
        }
    }
    Ok(tokens)
}

/// Read a quoted string at the start of `rest`; returns the text and the
/// number of bytes consumed including both quotes.
fn lex_string(rest: &str, quote: char) -> Option<(String, usize)> {
    let mut text = String::new();
    let mut chars = rest.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => text.push(chars.next()?.1),
            c if c == quote => return Some((text, i + c.len_utf8())),
            c => text.push(c),
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn eat(&mut self, candidates: &[(&str, BinaryOp)]) -> Option<BinaryOp> {
        let op = self.peek_op()?;
        let (_, binary) = candidates.iter().find(|(s, _)| *s == op)?;
        self.pos += 1;
        Some(*binary)
    }

    fn binary_level(
        &mut self,
        candidates: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ConditionError>,
    ) -> Result<Expr, ConditionError> {
        let mut lhs = next(self)?;
        while let Some(op) = self.eat(candidates) {
            let rhs = next(self)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        self.binary_level(&[("||", BinaryOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        self.binary_level(&[("&&", BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, ConditionError> {
        self.binary_level(
            &[
                ("==", BinaryOp::LooseEq),
                ("!=", BinaryOp::LooseNe),
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNe),
            ],
            Self::relation,
        )
    }

    fn relation(&mut self) -> Result<Expr, ConditionError> {
        self.binary_level(
            &[
                ("<", BinaryOp::Lt),
                ("<=", BinaryOp::Le),
                (">", BinaryOp::Gt),
                (">=", BinaryOp::Ge),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        match self.peek_op() {
            Some("!") => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some("-") => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ConditionError::UnexpectedEnd)?;
        self.pos += 1;

        match token {
            Token::Path(path) => Ok(Expr::Path(path)),
            Token::Number(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Literal(v) => Ok(Expr::Literal(v)),
            Token::Op("(") => {
                let inner = self.or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::Op(")")) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    Some(other) => Err(ConditionError::UnexpectedToken(other.describe())),
                    None => Err(ConditionError::UnexpectedEnd),
                }
            }
            other => Err(ConditionError::UnexpectedToken(other.describe())),
        }
    }
}

/// Parse an expression (not `"always"` / `"never"`).
pub fn parse_expression(src: &str) -> Result<Expr, ConditionError> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    let expr = parser.or()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(expr),
        Some(extra) => Err(ConditionError::UnexpectedToken(extra.describe())),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Bool(_), _) | (_, Value::Bool(_)) if std::mem::discriminant(a) != std::mem::discriminant(b) => {
            to_number(a) == to_number(b)
        }
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            to_number(a) == to_number(b)
        }
        _ => strict_eq(a, b),
    }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => to_number(a).partial_cmp(&to_number(b)),
    }
}

impl Expr {
    pub fn evaluate(&self, resolve: &dyn Fn(&str) -> Option<Value>) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(path) => resolve(path).unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!is_truthy(&inner.evaluate(resolve))),
            Expr::Neg(inner) => Value::from(-to_number(&inner.evaluate(resolve))),
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                let l = lhs.evaluate(resolve);
                if is_truthy(&l) { l } else { rhs.evaluate(resolve) }
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                let l = lhs.evaluate(resolve);
                if is_truthy(&l) { rhs.evaluate(resolve) } else { l }
            }
            Expr::Binary(op, lhs, rhs) => {
                let (l, r) = (lhs.evaluate(resolve), rhs.evaluate(resolve));
                let ordering = compare(&l, &r);
                Value::Bool(match op {
                    BinaryOp::LooseEq => loose_eq(&l, &r),
                    BinaryOp::LooseNe => !loose_eq(&l, &r),
                    BinaryOp::StrictEq => strict_eq(&l, &r),
                    BinaryOp::StrictNe => !strict_eq(&l, &r),
                    BinaryOp::Lt => ordering == Some(Ordering::Less),
                    BinaryOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                    BinaryOp::Gt => ordering == Some(Ordering::Greater),
                    BinaryOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                    BinaryOp::Or | BinaryOp::And => unreachable!("handled above"),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EdgeCondition
// ---------------------------------------------------------------------------

/// A parsed edge condition.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeCondition {
    Always,
    Never,
    Expression(Expr),
    /// Failed to parse; never taken.
    Malformed {
        condition: String,
        reason: ConditionError,
    },
}

impl EdgeCondition {
    pub fn parse(condition: &str) -> Self {
        match condition.trim() {
            "always" => EdgeCondition::Always,
            "never" => EdgeCondition::Never,
            expr => match parse_expression(expr) {
                Ok(parsed) => EdgeCondition::Expression(parsed),
                Err(reason) => EdgeCondition::Malformed {
                    condition: condition.to_owned(),
                    reason,
                },
            },
        }
    }

    pub fn evaluate(&self, resolve: impl Fn(&str) -> Option<Value>) -> bool {
        match self {
            EdgeCondition::Always => true,
            EdgeCondition::Never | EdgeCondition::Malformed { .. } => false,
            EdgeCondition::Expression(expr) => is_truthy(&expr.evaluate(&resolve)),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, EdgeCondition::Malformed { .. })
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(condition: &str, vars: Value) -> bool {
        EdgeCondition::parse(condition).evaluate(|path| {
            path.split('.')
                .try_fold(&vars, |v, seg| v.get(seg))
                .cloned()
        })
    }

    #[test]
    fn literal_conditions() {
        assert!(eval("always", json!({})));
        assert!(eval("  always ", json!({})));
        assert!(!eval("never", json!({})));
    }

    #[test]
    fn numeric_comparisons_on_placeholders() {
        let vars = json!({ "pda": { "real": 15.48, "nominal": 18 } });
        assert!(eval("{{pda.real}} < {{pda.nominal}}", vars.clone()));
        assert!(eval("{{pda.nominal}} >= 18", vars.clone()));
        assert!(!eval("{{pda.nominal}} > 18", vars.clone()));
        assert!(eval("{{ pda.real }} > -1", vars));
    }

    #[test]
    fn boolean_connectives_and_grouping() {
        let vars = json!({ "detect": { "violation_detected": true }, "n": 3 });
        assert!(eval("{{detect.violation_detected}}", vars.clone()));
        assert!(eval("{{detect.violation_detected}} == true && {{n}} != 0", vars.clone()));
        assert!(eval("!{{detect.violation_detected}} || {{n}} === 3", vars.clone()));
        assert!(!eval("!({{n}} > 1 && {{n}} < 5)", vars));
    }

    #[test]
    fn strings_and_loose_equality() {
        let vars = json!({ "tier": "gold", "count": "3" });
        assert!(eval("{{tier}} === 'gold'", vars.clone()));
        assert!(eval("{{tier}} != \"silver\"", vars.clone()));
        assert!(eval("{{count}} == 3", vars.clone()));
        assert!(!eval("{{count}} === 3", vars));
    }

    #[test]
    fn missing_paths_read_as_null() {
        assert!(eval("{{ghost.value}} == null", json!({})));
        assert!(!eval("{{ghost.value}}", json!({})));
        assert!(!eval("{{ghost.value}} > 0", json!({})));
    }

    #[test]
    fn malformed_conditions_are_never_taken() {
        for bad in [
            "{{nonexistent.path}} +++ bad syntax",
            "budget > 3",
            "{{a}} ==",
            "({{a}}",
            "{{a",
            "'open",
            "",
        ] {
            let condition = EdgeCondition::parse(bad);
            assert!(condition.is_malformed(), "{bad:?} should be malformed");
            assert!(!condition.evaluate(|_| Some(json!(1))));
        }
    }

    #[test]
    fn trailing_tokens_are_rejected() {
        assert!(matches!(
            parse_expression("1 2"),
            Err(ConditionError::UnexpectedToken(t)) if t == "2"
        ));
    }
}
