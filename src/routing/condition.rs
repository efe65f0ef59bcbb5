//! Route condition language
//!
//! A small boolean expression language over message properties:
//!
//! ```text
//! expr    := or
//! or      := and ("OR" and)*
//! and     := unary ("AND" unary)*
//! unary   := "NOT" unary | "(" expr ")" | "IS_DEFINED" "(" operand ")" | operand [cmp operand]
//! operand := 'string' | "string" | number | true | false | $systemProperty | property
//! cmp     := = | != | <> | < | <= | > | >=
//! ```
//!
//! Keywords are case-insensitive. Comparisons with an undefined operand are
//! false, whatever the operator.

use crate::message::Message;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at position {position}")]
pub struct ConditionError {
    pub message: String,
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `$name`, resolved against system properties
    SystemProperty(String),
    /// Bare name, resolved against application properties
    Property(String),
    String(String),
    Number(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(bool),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Compare {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    IsDefined(Operand),
}

/// Operand value after resolution against a message
#[derive(Debug, Clone, PartialEq)]
enum Value<'a> {
    Str(&'a str),
    Num(f64),
    Bool(bool),
}

impl Operand {
    fn resolve<'a>(&'a self, message: &'a Message) -> Option<Value<'a>> {
        match self {
            Operand::SystemProperty(name) => message.system_property(name).map(Value::Str),
            Operand::Property(name) => message.property(name).map(Value::Str),
            Operand::String(s) => Some(Value::Str(s)),
            Operand::Number(n) => Some(Value::Num(*n)),
            Operand::Bool(b) => Some(Value::Bool(*b)),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Compare two resolved values; `None` when they are not comparable
fn compare(left: &Value<'_>, right: &Value<'_>, op: CmpOp) -> bool {
    let ordering = match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
        (Value::Str(s), Value::Num(n)) => s.trim().parse::<f64>().ok().and_then(|v| v.partial_cmp(n)),
        (Value::Num(n), Value::Str(s)) => s.trim().parse::<f64>().ok().and_then(|v| n.partial_cmp(&v)),
        (Value::Bool(a), Value::Bool(b)) => return bool_compare(*a, *b, op),
        (Value::Str(s), Value::Bool(b)) | (Value::Bool(b), Value::Str(s)) => {
            return parse_bool(s).is_some_and(|a| bool_compare(a, *b, op))
        }
        (Value::Num(_), Value::Bool(_)) | (Value::Bool(_), Value::Num(_)) => None,
    };
    ordering.is_some_and(|ordering| op.holds(ordering))
}

fn bool_compare(a: bool, b: bool, op: CmpOp) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        _ => false,
    }
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.parse_or()?;
        match parser.peek() {
            None => Ok(condition),
            Some(token) => Err(parser.error_at(token, "unexpected trailing input")),
        }
    }

    pub fn evaluate(&self, message: &Message) -> bool {
        match self {
            Condition::Literal(value) => *value,
            Condition::Not(inner) => !inner.evaluate(message),
            Condition::And(a, b) => a.evaluate(message) && b.evaluate(message),
            Condition::Or(a, b) => a.evaluate(message) || b.evaluate(message),
            Condition::Compare { left, op, right } => {
                match (left.resolve(message), right.resolve(message)) {
                    (Some(l), Some(r)) => compare(&l, &r, *op),
                    _ => false,
                }
            }
            Condition::IsDefined(operand) => operand.resolve(message).is_some(),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::SystemProperty(name) => write!(f, "${name}"),
            Operand::Property(name) => f.write_str(name),
            Operand::String(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            Operand::Number(n) => write!(f, "{n}"),
            Operand::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Literal(value) => write!(f, "{value}"),
            Condition::Not(inner) => write!(f, "NOT ({inner})"),
            Condition::And(a, b) => write!(f, "({a} AND {b})"),
            Condition::Or(a, b) => write!(f, "({a} OR {b})"),
            Condition::Compare { left, op, right } => write!(f, "{left} {} {right}", op.symbol()),
            Condition::IsDefined(operand) => write!(f, "IS_DEFINED({operand})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    LParen,
    RParen,
    Op(CmpOp),
    Str(String),
    Num(f64),
    Word(String),
    SysProp(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let error = |message: &str, position: usize| ConditionError {
        message: message.to_string(),
        position,
    };

    while i < chars.len() {
        let (position, c) = chars[i];
        let push = |tokens: &mut Vec<Token>, kind| tokens.push(Token { kind, position });

        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                push(&mut tokens, TokenKind::LParen);
                i += 1;
            }
            ')' => {
                push(&mut tokens, TokenKind::RParen);
                i += 1;
            }
            '=' => {
                push(&mut tokens, TokenKind::Op(CmpOp::Eq));
                i += 1;
            }
            '!' => {
                if chars.get(i + 1).map(|(_, c)| *c) != Some('=') {
                    return Err(error("expected '=' after '!'", position));
                }
                push(&mut tokens, TokenKind::Op(CmpOp::Ne));
                i += 2;
            }
            '<' | '>' => {
                let next = chars.get(i + 1).map(|(_, c)| *c);
                let (op, width) = match (c, next) {
                    ('<', Some('>')) => (CmpOp::Ne, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', _) => (CmpOp::Lt, 1),
                    _ => (CmpOp::Gt, 1),
                };
                push(&mut tokens, TokenKind::Op(op));
                i += width;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let ch = chars[j].1;
                    if ch == '\\' && j + 1 < chars.len() {
                        value.push(chars[j + 1].1);
                        j += 2;
                        continue;
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                    j += 1;
                }
                if !closed {
                    return Err(error("unterminated string literal", position));
                }
                push(&mut tokens, TokenKind::Str(value));
                i = j + 1;
            }
            '$' => {
                let mut j = i + 1;
                while j < chars.len() && is_word_char(chars[j].1) {
                    j += 1;
                }
                let name: String = chars[i + 1..j].iter().map(|(_, c)| *c).collect();
                if name.is_empty() {
                    return Err(error("expected property name after '$'", position));
                }
                push(&mut tokens, TokenKind::SysProp(name));
                i = j;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || matches!(chars[j].1, '.' | 'e' | 'E')) {
                    j += 1;
                }
                let text: String = chars[i..j].iter().map(|(_, c)| *c).collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| error(&format!("invalid number '{text}'"), position))?;
                push(&mut tokens, TokenKind::Num(value));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while j < chars.len() && is_word_char(chars[j].1) {
                    j += 1;
                }
                let word: String = chars[i..j].iter().map(|(_, c)| *c).collect();
                push(&mut tokens, TokenKind::Word(word));
                i = j;
            }
            other => {
                return Err(error(&format!("unexpected character '{other}'"), position));
            }
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

    fn end_position(&self) -> usize {
        self.tokens.last().map_or(0, |t| t.position + 1)
    }

    fn error_at(&self, token: &Token, message: &str) -> ConditionError {
        ConditionError {
            message: message.to_string(),
            position: token.position,
        }
    }

    fn error_here(&self, message: &str) -> ConditionError {
        match self.peek() {
            Some(token) => self.error_at(token, message),
            None => ConditionError {
                message: message.to_string(),
                position: self.end_position(),
            },
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Word(word),
                ..
            }) if word.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), ConditionError> {
        match self.peek() {
            Some(token) if token.kind == kind => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error_here(&format!("expected {what}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("OR") {
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.eat_keyword("AND") {
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Condition, ConditionError> {
        if self.eat_keyword("NOT") {
            return Ok(Condition::Not(Box::new(self.parse_unary()?)));
        }

        if matches!(self.peek(), Some(Token { kind: TokenKind::LParen, .. })) {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect(TokenKind::RParen, "')'")?;
            return Ok(inner);
        }

        if self.eat_keyword("IS_DEFINED") {
            self.expect(TokenKind::LParen, "'(' after IS_DEFINED")?;
            let operand = self.parse_operand()?;
            if !matches!(operand, Operand::Property(_) | Operand::SystemProperty(_)) {
                return Err(self.error_here("IS_DEFINED takes a property"));
            }
            self.expect(TokenKind::RParen, "')'")?;
            return Ok(Condition::IsDefined(operand));
        }

        let left = self.parse_operand()?;
        if let Some(Token {
            kind: TokenKind::Op(op),
            ..
        }) = self.peek().cloned()
        {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Condition::Compare { left, op, right });
        }

        match left {
            Operand::Bool(value) => Ok(Condition::Literal(value)),
            _ => Err(self.error_here("expected comparison operator")),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ConditionError> {
        let Some(token) = self.next() else {
            return Err(self.error_here("expected operand"));
        };
        match token.kind {
            TokenKind::Str(s) => Ok(Operand::String(s)),
            TokenKind::Num(n) => Ok(Operand::Number(n)),
            TokenKind::SysProp(name) => Ok(Operand::SystemProperty(name)),
            TokenKind::Word(ref word) => {
                if let Some(value) = parse_bool(word) {
                    return Ok(Operand::Bool(value));
                }
                let reserved = ["AND", "OR", "NOT", "IS_DEFINED"];
                if reserved.iter().any(|k| word.eq_ignore_ascii_case(k)) {
                    return Err(self.error_at(&token, &format!("unexpected keyword {word}")));
                }
                Ok(Operand::Property(word.clone()))
            }
            _ => Err(self.error_at(&token, "expected operand")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use proptest::prelude::*;

    fn message() -> Message {
        Message::builder(Identity::module("edge-1", "sensor"), "{}")
            .message_id("m1")
            .content_type("application/json")
            .output_name("temperature")
            .property("alert", "true")
            .property("level", "42")
            .property("site", "north")
            .build()
    }

    fn eval(condition: &str) -> bool {
        Condition::parse(condition)
            .unwrap_or_else(|e| panic!("{condition}: {e}"))
            .evaluate(&message())
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("site = 'north'"));
        assert!(eval("site = \"north\""));
        assert!(eval("site != 'south'"));
        assert!(eval("site <> 'south'"));
        assert!(eval("level > 40"));
        assert!(eval("level >= 42 AND level <= 42"));
        assert!(!eval("level < 42"));
        assert!(eval("alert = true"));
        assert!(eval("$outputName = 'temperature'"));
        assert!(eval("$connectionModuleId = 'sensor'"));
    }

    #[test]
    fn test_undefined_operands_are_false() {
        assert!(!eval("missing = 'x'"));
        assert!(!eval("missing != 'x'"));
        assert!(eval("NOT (missing = 'x')"));
        assert!(!eval("$correlationId = 'c'"));
    }

    #[test]
    fn test_boolean_structure_and_precedence() {
        assert!(eval("site = 'south' OR level = 42 AND alert = true"));
        assert!(!eval("(site = 'south' OR level = 42) AND alert = false"));
        assert!(eval("NOT site = 'south'"));
        assert!(eval("true"));
        assert!(!eval("FALSE"));
        assert!(eval("site = 'north' and level = 42"));
    }

    #[test]
    fn test_is_defined() {
        assert!(eval("IS_DEFINED(alert)"));
        assert!(eval("is_defined($messageId)"));
        assert!(!eval("IS_DEFINED(missing)"));
    }

    #[test]
    fn test_type_mismatches_are_false() {
        assert!(!eval("site > 5"));
        assert!(!eval("level = true"));
        assert!(!eval("alert > false"));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "site =",
            "site 'north'",
            "(site = 'north'",
            "site = 'north",
            "IS_DEFINED('x')",
            "site = 'a' AND",
            "level # 3",
            "$ = 1",
            "site = 'a' )",
        ] {
            assert!(Condition::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_keyword_operand_reports_position() {
        let error = Condition::parse("site = AND").unwrap_err();
        assert!(error.message.contains("unexpected keyword AND"), "{error}");
        assert_eq!(error.position, 7);

        let parsed = Condition::parse("site = region").unwrap();
        assert!(matches!(
            parsed,
            Condition::Compare { right: Operand::Property(ref name), .. } if name == "region"
        ));
    }

    #[test]
    fn test_display_reparses() {
        let original = Condition::parse("NOT (a = 'x' OR $messageId != \"y\") AND IS_DEFINED(b)").unwrap();
        let reparsed = Condition::parse(&original.to_string()).unwrap();
        assert_eq!(original, reparsed);
    }

    proptest! {
        #[test]
        fn parse_never_panics(input in "\\PC{0,64}") {
            let _ = Condition::parse(&input);
        }

        #[test]
        fn evaluation_is_total(site in "[a-z]{0,8}", level in -1000i64..1000, threshold in -1000i64..1000) {
            let msg = Message::builder(Identity::device("d"), "x")
                .property("site", site.clone())
                .property("level", level.to_string())
                .build();
            let condition = Condition::parse(&format!(
                "site = '{site}' AND level >= {threshold} OR NOT IS_DEFINED(other)"
            )).unwrap();
            prop_assert!(condition.evaluate(&msg));
            let strict = Condition::parse(&format!("level > {threshold}")).unwrap();
            prop_assert_eq!(strict.evaluate(&msg), level > threshold);
        }
    }
}
