//! C1: request schema and request environment.
//!
//! A [`Schema`] is a registry of [`FieldDef`]s built once and shared
//! (`Arc<Schema>`) across every request it parses, mirroring how the rest of
//! the corpus builds an immutable route/matcher table once at startup. Each
//! field carries a `resolve` function pointer rather than a trait object so
//! the built-in schema can be a `const`-friendly table; user schemas extend
//! it by appending more `FieldDef`s with their own resolver.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::types::{FieldType, MapKind, Value};

/// One WSGI-style environment entry. Most values are strings; `content` is
/// the one field backed by a raw byte body.
#[derive(Debug, Clone)]
pub enum EnvValue {
    Str(String),
    Bytes(Vec<u8>),
}

impl EnvValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EnvValue::Str(s) => Some(s),
            EnvValue::Bytes(_) => None,
        }
    }
}

/// The request environment: a string-keyed map of WSGI-style variables.
#[derive(Debug, Clone, Default)]
pub struct Env(pub HashMap<String, EnvValue>);

impl Env {
    pub fn new() -> Self {
        Env(HashMap::new())
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), EnvValue::Str(value.into()));
        self
    }

    pub fn set_bytes(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.0.insert(key.into(), EnvValue::Bytes(value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(EnvValue::as_str)
    }
}

/// A schema field: name, dotted path, semantic type, and a resolver.
#[derive(Clone)]
pub struct FieldDef {
    pub name: &'static str,
    pub path: &'static str,
    pub ty: FieldType,
    pub resolve: fn(&Request) -> Result<Value>,
}

/// Schema registry: the built-in fields plus any extensions, indexed by
/// dotted path for O(1) lookup.
pub struct Schema {
    pub fields: Vec<FieldDef>,
    by_path: HashMap<&'static str, usize>,
}

impl Schema {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        let by_path = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.path, i))
            .collect();
        Schema { fields, by_path }
    }

    pub fn index_of(&self, path: &str) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    pub fn field(&self, idx: usize) -> &FieldDef {
        &self.fields[idx]
    }

    /// Fields whose type can host `FIELD.member` subfield access.
    pub fn map_fields(&self) -> impl Iterator<Item = (usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| matches!(f.ty, FieldType::Map(_)))
    }

    /// The built-in request schema described in the spec: `method`, `path`,
    /// `query_string`, `query`, `content_type`, `content_length`, `headers`,
    /// `host`, `authenticated`, `basic_authorization`, `username`,
    /// `password`, `client_ip4`, `has_content`, `content`.
    pub fn builtin() -> Self {
        Schema::new(vec![
            FieldDef {
                name: "method",
                path: "method",
                ty: FieldType::Str,
                resolve: |r| Ok(str_field(r, "REQUEST_METHOD")),
            },
            FieldDef {
                name: "path",
                path: "path",
                ty: FieldType::Str,
                resolve: |r| Ok(str_field(r, "PATH_INFO")),
            },
            FieldDef {
                name: "query_string",
                path: "query_string",
                ty: FieldType::Str,
                resolve: |r| Ok(str_field(r, "QUERY_STRING")),
            },
            FieldDef {
                name: "query",
                path: "query",
                ty: FieldType::Map(MapKind::Argument),
                resolve: resolve_query,
            },
            FieldDef {
                name: "content_type",
                path: "content_type",
                ty: FieldType::Str,
                resolve: |r| Ok(str_field(r, "CONTENT_TYPE")),
            },
            FieldDef {
                name: "content_length",
                path: "content_length",
                ty: FieldType::Int,
                resolve: resolve_content_length,
            },
            FieldDef {
                name: "headers",
                path: "headers",
                ty: FieldType::Map(MapKind::Header),
                resolve: resolve_headers,
            },
            FieldDef {
                name: "host",
                path: "host",
                ty: FieldType::Str,
                resolve: |r| Ok(str_field(r, "HTTP_HOST")),
            },
            FieldDef {
                name: "authenticated",
                path: "authenticated",
                ty: FieldType::Bool,
                resolve: |r| Ok(Value::Bool(r.env.0.contains_key("HTTP_AUTHORIZATION"))),
            },
            FieldDef {
                name: "basic_authorization",
                path: "basic_authorization",
                ty: FieldType::Map(MapKind::Generic),
                resolve: resolve_basic_authorization,
            },
            FieldDef {
                name: "username",
                path: "username",
                ty: FieldType::Str,
                resolve: |r| Ok(r.get("basic_authorization")?.map_get("username")),
            },
            FieldDef {
                name: "password",
                path: "password",
                ty: FieldType::Str,
                resolve: |r| Ok(r.get("basic_authorization")?.map_get("password")),
            },
            FieldDef {
                name: "client_ip4",
                path: "client_ip4",
                ty: FieldType::IpAddress,
                resolve: resolve_client_ip4,
            },
            FieldDef {
                name: "has_content",
                path: "has_content",
                ty: FieldType::Bool,
                resolve: resolve_has_content,
            },
            FieldDef {
                name: "content",
                path: "content",
                ty: FieldType::Str,
                resolve: resolve_content,
            },
        ])
    }
}

fn str_field(r: &Request, key: &str) -> Value {
    match r.env.get(key) {
        Some(s) => Value::Str(s.to_string()),
        None => Value::Null,
    }
}

/// The original's `content_length` field is a `pilo.Integer` descriptor
/// that raises a validation error when `CONTENT_LENGTH` is present but not
/// a valid integer; this is the one built-in field that can genuinely fail
/// to resolve rather than reading as `Null`.
fn resolve_content_length(r: &Request) -> Result<Value> {
    match r.env.get("CONTENT_LENGTH") {
        None => Ok(Value::Null),
        Some(s) => s.parse::<i64>().map(Value::Int).map_err(|_| Error::InvalidField {
            field: "content_length".to_string(),
            message: format!("{s:?} is not an integer"),
        }),
    }
}

fn resolve_query(r: &Request) -> Result<Value> {
    let qs = match r.env.get("QUERY_STRING") {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(Value::Map(BTreeMap::new())),
    };
    Ok(Value::Map(crate::parser::parse_query_string(qs)))
}

fn resolve_headers(r: &Request) -> Result<Value> {
    let mut map = BTreeMap::new();
    for key in r.env.0.keys() {
        if let Some(suffix) = key.strip_prefix("HTTP_") {
            if suffix.is_empty() {
                continue;
            }
            if let Some(EnvValue::Str(v)) = r.env.0.get(key) {
                map.insert(suffix.to_lowercase(), v.clone());
            }
        }
    }
    Ok(Value::Map(map))
}

fn resolve_basic_authorization(r: &Request) -> Result<Value> {
    let Some(raw) = r.env.get("HTTP_AUTHORIZATION") else {
        return Ok(Value::Null);
    };
    let Some(encoded) = raw.strip_prefix("Basic ") else {
        return Ok(Value::Null);
    };
    use base64::Engine;
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return Ok(Value::Null);
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return Ok(Value::Null);
    };
    let Some((username, password)) = text.split_once(':') else {
        return Ok(Value::Null);
    };
    let mut map = BTreeMap::new();
    map.insert("username".to_string(), username.to_string());
    map.insert("password".to_string(), password.to_string());
    Ok(Value::Map(map))
}

fn resolve_client_ip4(r: &Request) -> Result<Value> {
    match r.env.get("REMOTE_ADDR").and_then(|s| s.parse().ok()) {
        Some(ip) => Ok(Value::Ip(ip)),
        None => Ok(Value::Null),
    }
}

fn resolve_has_content(r: &Request) -> Result<Value> {
    let content_type = r.get("content_type")?;
    let content_length = r.get("content_length")?;
    let has_length = !matches!(content_length, Value::Int(0) | Value::Null);
    Ok(Value::Bool(!content_type.is_null() && has_length))
}

fn resolve_content(r: &Request) -> Result<Value> {
    if !r.get("has_content")?.as_bool() {
        return Ok(Value::Null);
    }
    Ok(match r.env.0.get("wsgi.input") {
        Some(EnvValue::Bytes(b)) => {
            String::from_utf8(b.clone()).map(Value::Str).unwrap_or(Value::Null)
        }
        Some(EnvValue::Str(s)) => Value::Str(s.clone()),
        None => Value::Str(String::new()),
    })
}

/// A single request being matched: a schema, its environment, and a
/// per-field memoization cache (P4: each resolver runs at most once per
/// request).
pub struct Request<'s> {
    pub schema: &'s Schema,
    pub env: Env,
    cache: RefCell<HashMap<&'static str, Result<Value>>>,
}

impl<'s> Request<'s> {
    pub fn new(schema: &'s Schema, env: Env) -> Self {
        Request {
            schema,
            env,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Resolve a top-level field by path, memoizing the result (including
    /// a resolver's error, so a failing field fails the same way on every
    /// lookup within one request).
    pub fn get(&self, path: &str) -> Result<Value> {
        if let Some(v) = self.cache.borrow().get(path) {
            return v.clone();
        }
        let idx = self
            .schema
            .index_of(path)
            .unwrap_or_else(|| panic!("unknown field path {path}"));
        let field = self.schema.field(idx);
        let value = (field.resolve)(self);
        self.cache
            .borrow_mut()
            .insert(field.path, value.clone());
        value
    }

    pub fn get_by_index(&self, idx: usize) -> Result<Value> {
        let field = self.schema.field(idx);
        self.get(field.path)
    }

    /// Resolve `parent.member` for a map-typed field.
    pub fn get_member(&self, parent_idx: usize, member: &str) -> Result<Value> {
        Ok(self.get_by_index(parent_idx)?.map_get(member))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(env: Env) -> Request<'static> {
        static SCHEMA: std::sync::OnceLock<Schema> = std::sync::OnceLock::new();
        let schema = SCHEMA.get_or_init(Schema::builtin);
        Request::new(schema, env)
    }

    #[test]
    fn method_reads_request_method() {
        let r = req(Env::new().set("REQUEST_METHOD", "POST"));
        assert_eq!(r.get("method").unwrap(), Value::Str("POST".into()));
    }

    #[test]
    fn headers_lowercase_suffix() {
        let r = req(Env::new().set("HTTP_X_TEST", "v123"));
        assert_eq!(
            r.get_member(r.schema.index_of("headers").unwrap(), "x_test").unwrap(),
            Value::Str("v123".into())
        );
    }

    #[test]
    fn basic_auth_parses_username_password() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode("bob:hunter2");
        let r = req(Env::new().set("HTTP_AUTHORIZATION", format!("Basic {encoded}")));
        assert_eq!(r.get("username").unwrap(), Value::Str("bob".into()));
        assert_eq!(r.get("password").unwrap(), Value::Str("hunter2".into()));
        assert_eq!(r.get("authenticated").unwrap(), Value::Bool(true));
    }

    #[test]
    fn basic_auth_bad_format_is_null_not_error() {
        let r = req(Env::new().set("HTTP_AUTHORIZATION", "Bearer abc"));
        assert_eq!(r.get("basic_authorization").unwrap(), Value::Null);
        assert_eq!(r.get("username").unwrap(), Value::Null);
    }

    #[test]
    fn query_keeps_last_duplicate_value() {
        let r = req(Env::new().set("QUERY_STRING", "a=1&a=2&b=3"));
        let idx = r.schema.index_of("query").unwrap();
        assert_eq!(r.get_member(idx, "a").unwrap(), Value::Str("2".into()));
        assert_eq!(r.get_member(idx, "b").unwrap(), Value::Str("3".into()));
    }

    #[test]
    fn has_content_requires_type_and_nonzero_length() {
        let r = req(Env::new().set("CONTENT_TYPE", "text/plain").set("CONTENT_LENGTH", "0"));
        assert_eq!(r.get("has_content").unwrap(), Value::Bool(false));
    }

    #[test]
    fn malformed_content_length_is_an_error_not_null() {
        let r = req(Env::new().set("CONTENT_LENGTH", "abc"));
        let err = r.get("content_length").unwrap_err();
        assert!(matches!(err, Error::InvalidField { field, .. } if field == "content_length"));
    }
}
