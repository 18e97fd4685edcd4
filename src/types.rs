//! Semantic value types shared by the request schema, the expression AST,
//! and the DSL parser.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// The semantic type a schema field carries. Drives both evaluation defaults
/// and which DSL sub-grammar a field's keyword dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    Str,
    IpAddress,
    Map(MapKind),
}

/// Distinguishes the three string-keyed map shapes the source schema uses.
/// They share identical matching semantics; the distinction exists only to
/// mirror the schema's own grouping and to pick a lexical charset for member
/// names at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Header,
    Argument,
    /// A user-defined string-keyed map, or a named-tuple field (e.g.
    /// `basic_authorization`) whose members are all strings.
    Generic,
}

/// A resolved field value for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Ip(Ipv4Addr),
    Map(BTreeMap<String, String>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Ip(_) => true,
            Value::Map(m) => !m.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<Ipv4Addr> {
        match self {
            Value::Ip(ip) => Some(*ip),
            _ => None,
        }
    }

    pub fn map_get(&self, member: &str) -> Value {
        match self {
            Value::Map(m) => m
                .get(member)
                .map(|v| Value::Str(v.clone()))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Ip(ip) => write!(f, "{ip}"),
            Value::Map(_) => write!(f, "<map>"),
        }
    }
}

/// A literal appearing on the right-hand side of a `FieldOp`.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Ip(Ipv4Addr),
}

impl Literal {
    /// Structural equality against a resolved field `Value`, with `null ==
    /// null` true (used by `FieldOp::Equal`).
    pub fn equals_value(&self, value: &Value) -> bool {
        match (self, value) {
            (Literal::Null, Value::Null) => true,
            (Literal::Null, _) | (_, Value::Null) => false,
            (Literal::Bool(a), Value::Bool(b)) => a == b,
            (Literal::Int(a), Value::Int(b)) => a == b,
            (Literal::Str(a), Value::Str(b)) => a == b,
            (Literal::Ip(a), Value::Ip(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "null"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Str(s) => write!(f, "{s}"),
            Literal::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

/// Re-exported so callers parsing CIDR literals don't need their own
/// `ipnet` dependency line.
pub type IpNetwork = Ipv4Net;
