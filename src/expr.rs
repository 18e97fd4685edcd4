//! C2: the expression AST — boolean combinators, field operators, a bare
//! boolean field, and the operations every node supports: evaluation,
//! inversion, canonical printing, traversal, and compilation to a closure
//! over a shared symbol table.

use std::collections::HashMap;
use std::fmt::Write as _;

use ipnet::Ipv4Net;
use regex::Regex;

use crate::error::Result;
use crate::request::{Request, Schema};
use crate::types::{Literal, Value};

/// A reference to a schema field or one of its subfields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRef {
    Direct(usize),
    Member { parent: usize, member: String },
}

impl FieldRef {
    pub fn resolve(&self, req: &Request) -> Result<Value> {
        match self {
            FieldRef::Direct(idx) => req.get_by_index(*idx),
            FieldRef::Member { parent, member } => req.get_member(*parent, member),
        }
    }

    fn print(&self, schema: &Schema) -> String {
        match self {
            FieldRef::Direct(idx) => schema.field(*idx).path.to_string(),
            FieldRef::Member { parent, member } => {
                format!("{}.{}", schema.field(*parent).path, member)
            }
        }
    }
}

/// One field-level comparison operator. `Equal` folds the source's
/// `FieldEqual`/`FieldNotEqual` pair into a single variant distinguished by
/// the node's `inverted` flag: the grammar has no dedicated `!=` token, only
/// an optional `!`/`not` prefix on `=`, so `Equal{inverted: true}` *is*
/// not-equal.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Equal(Literal),
    LessThan(i64),
    LessThanEqual(i64),
    GreaterThan(i64),
    GreaterThanEqual(i64),
    Startswith(String),
    Endswith(String),
    Match { pattern: String, ci: bool },
    InInts(Vec<i64>),
    InStrs(Vec<String>),
    InNet(Ipv4Net),
    /// `literal in field`; printed with reversed argument order.
    Contains(String),
}

impl FieldOp {
    /// Default result when the field's resolved value is `null` (§4.2).
    fn null_default(&self) -> bool {
        match self {
            FieldOp::Equal(lit) => matches!(lit, Literal::Null),
            _ => false,
        }
    }

    fn eval(&self, value: &Value) -> bool {
        if value.is_null() {
            return self.null_default();
        }
        match self {
            FieldOp::Equal(lit) => lit.equals_value(value),
            FieldOp::LessThan(n) => value.as_int().map(|v| v < *n).unwrap_or(false),
            FieldOp::LessThanEqual(n) => value.as_int().map(|v| v <= *n).unwrap_or(false),
            FieldOp::GreaterThan(n) => value.as_int().map(|v| v > *n).unwrap_or(false),
            FieldOp::GreaterThanEqual(n) => value.as_int().map(|v| v >= *n).unwrap_or(false),
            FieldOp::Startswith(p) => value.as_str().map(|v| v.starts_with(p.as_str())).unwrap_or(false),
            FieldOp::Endswith(s) => value.as_str().map(|v| v.ends_with(s.as_str())).unwrap_or(false),
            FieldOp::Match { pattern, ci } => {
                let Some(v) = value.as_str() else { return false };
                match build_regex(pattern, *ci) {
                    Ok(re) => re.is_match(v),
                    Err(_) => false,
                }
            }
            FieldOp::InInts(list) => value.as_int().map(|v| list.contains(&v)).unwrap_or(false),
            FieldOp::InStrs(list) => value.as_str().map(|v| list.iter().any(|s| s == v)).unwrap_or(false),
            FieldOp::InNet(net) => value.as_ip().map(|ip| net.contains(&ip)).unwrap_or(false),
            FieldOp::Contains(needle) => match value {
                Value::Map(m) => m.contains_key(needle.as_str()),
                _ => value.as_str().map(|v| v.contains(needle.as_str())).unwrap_or(false),
            },
        }
    }

    /// Canonical textual form for the operator + its literal(s), not
    /// including the leading inversion token (callers add that).
    fn print(&self, field: &str) -> String {
        match self {
            FieldOp::Equal(lit) => format!("{field} = {lit}"),
            FieldOp::LessThan(n) => format!("{field} < {n}"),
            FieldOp::LessThanEqual(n) => format!("{field} <= {n}"),
            FieldOp::GreaterThan(n) => format!("{field} > {n}"),
            FieldOp::GreaterThanEqual(n) => format!("{field} >= {n}"),
            FieldOp::Startswith(p) => format!("{field} startswith {}", quote(p)),
            FieldOp::Endswith(s) => format!("{field} endswith {}", quote(s)),
            FieldOp::Match { pattern, ci } => {
                format!("{field} ~{} {}", if *ci { "*" } else { "" }, quote(pattern))
            }
            FieldOp::InInts(list) => {
                format!("{field} in [{}]", list.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(","))
            }
            FieldOp::InStrs(list) => {
                format!("{field} in [{}]", list.iter().map(|s| quote(s)).collect::<Vec<_>>().join(","))
            }
            FieldOp::InNet(net) => format!("{field} in {net}"),
            FieldOp::Contains(needle) => format!("{} in {field}", quote(needle)),
        }
    }

    /// Swap to the operator's relational dual, used when inverting a
    /// relational FieldOp that has no inline negation token in the grammar
    /// (`<`, `<=`, `>`, `>=`).
    fn relational_dual(&self) -> Option<FieldOp> {
        match self {
            FieldOp::LessThan(n) => Some(FieldOp::GreaterThanEqual(*n)),
            FieldOp::LessThanEqual(n) => Some(FieldOp::GreaterThan(*n)),
            FieldOp::GreaterThan(n) => Some(FieldOp::LessThanEqual(*n)),
            FieldOp::GreaterThanEqual(n) => Some(FieldOp::LessThan(*n)),
            _ => None,
        }
    }
}

fn quote(s: &str) -> String {
    if s.chars().all(|c| c.is_alphanumeric() || c == '_') && !s.is_empty() {
        s.to_string()
    } else {
        // Only the quote character itself needs escaping; any other
        // backslash sequence (regex escapes like `\d`) is passed through
        // untouched since the parser's `read_quoted` only unescapes `\"`
        // and `\\`.
        format!("\"{}\"", s.replace('"', "\\\""))
    }
}

fn build_regex(pattern: &str, ci: bool) -> Result<Regex, regex::Error> {
    if ci {
        Regex::new(&format!("(?i){pattern}"))
    } else {
        Regex::new(pattern)
    }
}

/// Expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// A bare boolean field used as an expression, e.g. `authenticated`.
    Unary { field: FieldRef, inverted: bool },
    Field { field: FieldRef, op: FieldOp, inverted: bool },
}

/// Operator precedence, used to decide when printing needs parentheses.
fn precedence(e: &Expr) -> u8 {
    match e {
        Expr::And(..) => 10,
        Expr::Or(..) => 5,
        Expr::Unary { .. } | Expr::Field { .. } => 100,
    }
}

/// Traversal order for [`Expr::traverse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Prefix,
    Infix,
    Postfix,
}

impl Expr {
    pub fn eval(&self, req: &Request) -> Result<bool> {
        match self {
            Expr::And(a, b) => Ok(a.eval(req)? && b.eval(req)?),
            Expr::Or(a, b) => Ok(a.eval(req)? || b.eval(req)?),
            Expr::Unary { field, inverted } => {
                let v = field.resolve(req)?.as_bool();
                Ok(v != *inverted)
            }
            Expr::Field { field, op, inverted } => {
                let v = field.resolve(req)?;
                Ok(op.eval(&v) != *inverted)
            }
        }
    }

    /// `~self` (P2: `~~e == e`).
    pub fn invert(&self) -> Expr {
        match self {
            Expr::And(a, b) => Expr::Or(Box::new(a.invert()), Box::new(b.invert())),
            Expr::Or(a, b) => Expr::And(Box::new(a.invert()), Box::new(b.invert())),
            Expr::Unary { field, inverted } => Expr::Unary {
                field: field.clone(),
                inverted: !inverted,
            },
            Expr::Field { field, op, inverted } => {
                if let Some(dual) = op.relational_dual() {
                    Expr::Field {
                        field: field.clone(),
                        op: dual,
                        inverted: *inverted,
                    }
                } else {
                    Expr::Field {
                        field: field.clone(),
                        op: op.clone(),
                        inverted: !inverted,
                    }
                }
            }
        }
    }

    /// Canonical DSL form, parenthesising only where precedence requires.
    pub fn print(&self, schema: &Schema) -> String {
        let mut out = String::new();
        self.print_into(schema, &mut out, 0);
        out
    }

    fn print_into(&self, schema: &Schema, out: &mut String, parent_prec: u8) {
        match self {
            Expr::And(a, b) | Expr::Or(a, b) => {
                let op = if matches!(self, Expr::And(..)) { "and" } else { "or" };
                let prec = precedence(self);
                let needs_parens = prec < parent_prec;
                if needs_parens {
                    out.push('(');
                }
                a.print_into(schema, out, prec);
                let _ = write!(out, " {op} ");
                b.print_into(schema, out, prec + 1);
                if needs_parens {
                    out.push(')');
                }
            }
            Expr::Unary { field, inverted } => {
                let _ = write!(
                    out,
                    "{}{}",
                    if *inverted { "not " } else { "" },
                    field.print(schema)
                );
            }
            Expr::Field { field, op, inverted } => {
                let field_str = field.print(schema);
                let rendered = op.print(&field_str);
                let with_inv = apply_inversion_token(op, &rendered, *inverted);
                out.push_str(&with_inv);
            }
        }
    }

    /// Visit every node. `boolop` is called for `And`/`Or` nodes, `leaf` for
    /// `Unary`/`Field` nodes, in the requested traversal order.
    pub fn traverse<FB, FL>(&self, order: Order, boolop: &mut FB, leaf: &mut FL)
    where
        FB: FnMut(&Expr),
        FL: FnMut(&Expr),
    {
        match self {
            Expr::And(a, b) | Expr::Or(a, b) => {
                if order == Order::Prefix {
                    boolop(self);
                }
                a.traverse(order, boolop, leaf);
                if order == Order::Infix {
                    boolop(self);
                }
                b.traverse(order, boolop, leaf);
                if order == Order::Postfix {
                    boolop(self);
                }
            }
            Expr::Unary { .. } | Expr::Field { .. } => leaf(self),
        }
    }

    /// Structural equality via canonical printed form (§4.2).
    pub fn structurally_eq(&self, other: &Expr, schema: &Schema) -> bool {
        self.print(schema) == other.print(schema)
    }
}

/// Insert the `!`/`not `/`*` inversion token into an already-rendered
/// operator form, for operators whose grammar token carries an inline
/// inversion marker (everything except the relational family, which is
/// normalized to its dual kind instead — see [`FieldOp::relational_dual`]).
fn apply_inversion_token(op: &FieldOp, rendered: &str, inverted: bool) -> String {
    if !inverted {
        return rendered.to_string();
    }
    match op {
        FieldOp::Equal(_) => rendered.replacen(" = ", " != ", 1),
        FieldOp::Match { .. } => rendered.replacen(" ~", " !~", 1),
        FieldOp::Startswith(_) => rendered.replacen(" startswith ", " !startswith ", 1),
        FieldOp::Endswith(_) => rendered.replacen(" endswith ", " !endswith ", 1),
        FieldOp::InInts(_) | FieldOp::InStrs(_) | FieldOp::InNet(_) => {
            rendered.replacen(" in ", " not in ", 1)
        }
        FieldOp::Contains(_) => rendered.replacen(" in ", " not in ", 1),
        FieldOp::LessThan(_) | FieldOp::LessThanEqual(_) | FieldOp::GreaterThan(_) | FieldOp::GreaterThanEqual(_) => {
            rendered.to_string()
        }
    }
}

/// Build `And(a, b)`. Provided as a free function mirroring the source's
/// `and_(*exprs)` helper, folding a list left-to-right.
pub fn and(exprs: Vec<Expr>) -> Option<Expr> {
    fold(exprs, Expr::And)
}

/// Build `Or(a, b)`, folding a list left-to-right.
pub fn or(exprs: Vec<Expr>) -> Option<Expr> {
    fold(exprs, Expr::Or)
}

fn fold(mut exprs: Vec<Expr>, ctor: fn(Box<Expr>, Box<Expr>) -> Expr) -> Option<Expr> {
    if exprs.is_empty() {
        return None;
    }
    let mut acc = exprs.remove(0);
    for e in exprs {
        acc = ctor(Box::new(acc), Box::new(e));
    }
    Some(acc)
}

// ---------------------------------------------------------------------
// Compilation: lower the tree to a closure-free interpreter over a shared
// symbol table, per the design note preferring a direct interpreter over
// generated source. Field references are interned to integer keys; the
// per-request `Context` is an array indexed by those keys, populated
// lazily and memoized exactly once per key (P4, P6).
// ---------------------------------------------------------------------

/// Interns field references into small integer keys shared by every rule
/// compiled against the same schema.
#[derive(Debug, Default)]
pub struct Symbols {
    fields: Vec<FieldRef>,
    index: HashMap<FieldRef, usize>,
}

impl Symbols {
    pub fn new() -> Self {
        Symbols::default()
    }

    pub fn intern(&mut self, field: &FieldRef) -> usize {
        if let Some(&key) = self.index.get(field) {
            return key;
        }
        let key = self.fields.len();
        self.fields.push(field.clone());
        self.index.insert(field.clone(), key);
        key
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl std::hash::Hash for FieldRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            FieldRef::Direct(idx) => {
                0u8.hash(state);
                idx.hash(state);
            }
            FieldRef::Member { parent, member } => {
                1u8.hash(state);
                parent.hash(state);
                member.hash(state);
            }
        }
    }
}

/// Per-request array of lazily-resolved field values, indexed by symbol key.
pub struct Context<'r, 's> {
    request: &'r Request<'s>,
    symbols: &'r Symbols,
    values: Vec<Option<Value>>,
}

impl<'r, 's> Context<'r, 's> {
    pub fn new(request: &'r Request<'s>, symbols: &'r Symbols) -> Self {
        Context {
            request,
            symbols,
            values: vec![None; symbols.len()],
        }
    }

    fn get(&mut self, key: usize) -> Result<&Value> {
        if self.values[key].is_none() {
            let v = self.symbols.fields[key].resolve(self.request)?;
            self.values[key] = Some(v);
        }
        Ok(self.values[key].as_ref().unwrap())
    }
}

/// A compiled expression: the interpreter tree plus the symbol table it was
/// built against.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub symbols_len: usize,
    node: CompiledNode,
}

#[derive(Debug, Clone)]
enum CompiledNode {
    And(Box<CompiledNode>, Box<CompiledNode>),
    Or(Box<CompiledNode>, Box<CompiledNode>),
    Unary { key: usize, inverted: bool },
    Field { key: usize, op: FieldOp, inverted: bool },
}

impl Compiled {
    pub fn eval(&self, req: &Request, symbols: &Symbols) -> Result<bool> {
        let mut ctx = Context::new(req, symbols);
        self.node.eval(&mut ctx)
    }
}

impl CompiledNode {
    fn eval(&self, ctx: &mut Context) -> Result<bool> {
        match self {
            CompiledNode::And(a, b) => Ok(a.eval(ctx)? && b.eval(ctx)?),
            CompiledNode::Or(a, b) => Ok(a.eval(ctx)? || b.eval(ctx)?),
            CompiledNode::Unary { key, inverted } => {
                let v = ctx.get(*key)?.as_bool();
                Ok(v != *inverted)
            }
            CompiledNode::Field { key, op, inverted } => {
                let v = ctx.get(*key)?.clone();
                Ok(op.eval(&v) != *inverted)
            }
        }
    }
}

/// Lower `expr` into a [`Compiled`] node, interning every field reference it
/// touches into `symbols`.
pub fn compile(expr: &Expr, symbols: &mut Symbols) -> Compiled {
    let node = compile_node(expr, symbols);
    Compiled {
        symbols_len: symbols.len(),
        node,
    }
}

fn compile_node(expr: &Expr, symbols: &mut Symbols) -> CompiledNode {
    match expr {
        Expr::And(a, b) => CompiledNode::And(
            Box::new(compile_node(a, symbols)),
            Box::new(compile_node(b, symbols)),
        ),
        Expr::Or(a, b) => CompiledNode::Or(
            Box::new(compile_node(a, symbols)),
            Box::new(compile_node(b, symbols)),
        ),
        Expr::Unary { field, inverted } => CompiledNode::Unary {
            key: symbols.intern(field),
            inverted: *inverted,
        },
        Expr::Field { field, op, inverted } => CompiledNode::Field {
            key: symbols.intern(field),
            op: op.clone(),
            inverted: *inverted,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Env, Schema};

    fn schema() -> Schema {
        Schema::builtin()
    }

    fn expr_method_eq(schema: &Schema, value: &str) -> Expr {
        let idx = schema.index_of("method").unwrap();
        Expr::Field {
            field: FieldRef::Direct(idx),
            op: FieldOp::Equal(Literal::Str(value.to_string())),
            inverted: false,
        }
    }

    #[test]
    fn invert_is_an_involution() {
        let schema = schema();
        let e = expr_method_eq(&schema, "GET");
        assert_eq!(e.invert().invert(), e);
    }

    #[test]
    fn invert_flips_eval() {
        let schema = schema();
        let req = Request::new(&schema, Env::new().set("REQUEST_METHOD", "GET"));
        let e = expr_method_eq(&schema, "GET");
        assert!(e.eval(&req).unwrap());
        assert!(!e.invert().eval(&req).unwrap());
    }

    #[test]
    fn de_morgan_and_or() {
        let schema = schema();
        let a = expr_method_eq(&schema, "GET");
        let b = expr_method_eq(&schema, "POST");
        let and = Expr::And(Box::new(a.clone()), Box::new(b.clone()));
        let expected = Expr::Or(Box::new(a.invert()), Box::new(b.invert()));
        assert_eq!(and.invert(), expected);
    }

    #[test]
    fn print_equal_and_inverted_equal() {
        let schema = schema();
        let e = expr_method_eq(&schema, "GET");
        assert_eq!(e.print(&schema), "method = GET");
        assert_eq!(e.invert().print(&schema), "method != GET");
    }

    #[test]
    fn compile_matches_direct_eval() {
        let schema = schema();
        let req = Request::new(&schema, Env::new().set("REQUEST_METHOD", "GET"));
        let e = expr_method_eq(&schema, "GET");
        let mut symbols = Symbols::new();
        let compiled = compile(&e, &mut symbols);
        assert_eq!(e.eval(&req).unwrap(), compiled.eval(&req, &symbols).unwrap());
    }

    #[test]
    fn contains_checks_map_keys_not_a_stringified_map() {
        let schema = schema();
        let req = Request::new(&schema, Env::new().set("HTTP_X_TEST", "v123"));
        let idx = schema.index_of("headers").unwrap();
        let present = Expr::Field {
            field: FieldRef::Direct(idx),
            op: FieldOp::Contains("x_test".into()),
            inverted: false,
        };
        assert!(present.eval(&req).unwrap());
        let absent = Expr::Field {
            field: FieldRef::Direct(idx),
            op: FieldOp::Contains("missing".into()),
            inverted: false,
        };
        assert!(!absent.eval(&req).unwrap());
    }

    #[test]
    fn null_field_value_uses_fieldop_default() {
        let schema = schema();
        let req = Request::new(&schema, Env::new());
        let idx = schema.index_of("content_type").unwrap();
        let startswith = Expr::Field {
            field: FieldRef::Direct(idx),
            op: FieldOp::Startswith("text/".into()),
            inverted: false,
        };
        assert!(!startswith.eval(&req).unwrap());
        let not_equal_null = Expr::Field {
            field: FieldRef::Direct(idx),
            op: FieldOp::Equal(Literal::Str("x".into())),
            inverted: true,
        };
        assert!(not_equal_null.eval(&req).unwrap());
    }
}
