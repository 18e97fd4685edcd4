//! C3: the DSL parser.
//!
//! Hand-written recursive-descent parser (no parser-combinator dependency,
//! matching the corpus's preference for hand-rolled matching engines over a
//! grammar-DSL crate for something this shaped). The parser is built
//! against a [`Schema`]: field keywords, their semantic types, and therefore
//! which sub-grammar applies, all come from the schema rather than being
//! hard-coded.

pub mod upstream;

use std::collections::BTreeMap;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};
use crate::expr::{Expr, FieldOp, FieldRef};
use crate::request::Schema;
use crate::types::{FieldType, Literal, MapKind};

/// Parse `query_string` (already stripped of the leading `?`) as
/// `application/x-www-form-urlencoded`, keeping the *last* value for
/// duplicate keys (§4.1).
pub fn parse_query_string(query_string: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for pair in query_string.split('&').filter(|s| !s.is_empty()) {
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let k = urlencoding::decode(k).map(|c| c.into_owned()).unwrap_or_else(|_| k.to_string());
        let v = urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_else(|_| v.to_string());
        map.insert(k, v);
    }
    map
}

/// Parse a bare expression string against `schema`.
pub fn parse_expr(schema: &Schema, input: &str) -> Result<Expr> {
    let mut p = Parser::new(schema, input);
    let e = p.parse_or()?;
    p.skip_ws();
    p.expect_eof()?;
    Ok(e)
}

/// Parse a full rule line: `match "=>" upstream`.
pub fn parse_rule_line(schema: &Schema, input: &str) -> Result<(Expr, crate::upstream::Upstream)> {
    let mut p = Parser::new(schema, input);
    let expr = p.parse_or()?;
    p.skip_ws();
    p.expect_literal("=>")?;
    p.skip_ws();
    let rest = p.remaining();
    let up = upstream::parse_upstream(rest)?;
    Ok((expr, up))
}

struct Parser<'s> {
    schema: &'s Schema,
    chars: Vec<char>,
    pos: usize,
}

impl<'s> Parser<'s> {
    fn new(schema: &'s Schema, input: &str) -> Self {
        Parser {
            schema,
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn remaining(&self) -> String {
        self.chars[self.pos..].iter().collect()
    }

    fn err(&self, message: impl Into<String>) -> Error {
        Error::Parse {
            pos: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn require_ws(&mut self) -> Result<()> {
        let start = self.pos;
        self.skip_ws();
        if self.pos == start {
            return Err(self.err("expected whitespace"));
        }
        Ok(())
    }

    fn expect_eof(&self) -> Result<()> {
        if self.pos < self.chars.len() {
            return Err(self.err(format!("unexpected trailing input: {}", self.remaining())));
        }
        Ok(())
    }

    fn expect_literal(&mut self, lit: &str) -> Result<()> {
        if self.try_literal(lit) {
            Ok(())
        } else {
            Err(self.err(format!("expected '{lit}'")))
        }
    }

    fn try_literal(&mut self, lit: &str) -> bool {
        let n = lit.chars().count();
        if self.chars[self.pos..].iter().take(n).collect::<String>() == lit {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Try to consume a bare keyword (`and`, `or`, `in`, ...), requiring a
    /// non-identifier boundary after it so `intake` doesn't match `in`.
    fn try_keyword(&mut self, kw: &str) -> bool {
        let checkpoint = self.pos;
        if !self.try_literal(kw) {
            return false;
        }
        if matches!(self.peek(), Some(c) if is_ident_char(c)) {
            self.pos = checkpoint;
            return false;
        }
        true
    }

    fn read_ident(&mut self) -> Option<String> {
        let start = self.pos;
        if !matches!(self.peek(), Some(c) if c.is_ascii_alphabetic() || c == '_') {
            return None;
        }
        while matches!(self.peek(), Some(c) if is_ident_char(c)) {
            self.pos += 1;
        }
        Some(self.chars[start..self.pos].iter().collect())
    }

    fn read_member(&mut self) -> Option<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c) || c == '-') {
            self.pos += 1;
        }
        if self.pos == start {
            None
        } else {
            Some(self.chars[start..self.pos].iter().collect())
        }
    }

    fn read_int(&mut self) -> Option<i64> {
        let start = self.pos;
        if matches!(self.peek(), Some('+') | Some('-')) {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == digits_start {
            self.pos = start;
            return None;
        }
        self.chars[start..self.pos].iter().collect::<String>().parse().ok()
    }

    fn read_quoted(&mut self) -> Option<String> {
        let quote = self.peek()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => {
                    self.pos = start;
                    return None;
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        // Only the quote char and the escape char itself are
                        // unescaped; any other sequence (`\d`, `\s`, ...) keeps
                        // its backslash so regex literals survive dequoting.
                        Some(c) if c == quote || c == '\\' => {
                            out.push(c);
                            self.pos += 1;
                        }
                        Some(c) => {
                            out.push('\\');
                            out.push(c);
                            self.pos += 1;
                        }
                        None => {
                            self.pos = start;
                            return None;
                        }
                    }
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Some(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn read_bare_word(&mut self) -> Option<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !c.is_whitespace() && !"()[],!".contains(c)) {
            self.pos += 1;
        }
        if self.pos == start {
            None
        } else {
            Some(self.chars[start..self.pos].iter().collect())
        }
    }

    fn read_string_literal(&mut self) -> Result<String> {
        if let Some(s) = self.read_quoted() {
            return Ok(s);
        }
        self.read_bare_word().ok_or_else(|| self.err("expected string literal"))
    }

    // expr := and_term (("or"|"||") and_term)*
    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        loop {
            let checkpoint = self.pos;
            self.skip_ws();
            if self.try_keyword("or") || self.try_literal("||") {
                self.skip_ws();
                let right = self.parse_and()?;
                left = Expr::Or(Box::new(left), Box::new(right));
            } else {
                self.pos = checkpoint;
                break;
            }
        }
        Ok(left)
    }

    // and_term := not_term (("and"|"&&") not_term)*
    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        loop {
            let checkpoint = self.pos;
            self.skip_ws();
            if self.try_keyword("and") || self.try_literal("&&") {
                self.skip_ws();
                let right = self.parse_not()?;
                left = Expr::And(Box::new(left), Box::new(right));
            } else {
                self.pos = checkpoint;
                break;
            }
        }
        Ok(left)
    }

    // not_term := ("!" | "not " ) not_term | atom
    fn parse_not(&mut self) -> Result<Expr> {
        self.skip_ws();
        if self.try_literal("!") {
            let inner = self.parse_not()?;
            return Ok(inner.invert());
        }
        let checkpoint = self.pos;
        if self.try_keyword("not") {
            if matches!(self.peek(), Some(c) if c.is_whitespace()) {
                self.skip_ws();
                let inner = self.parse_not()?;
                return Ok(inner.invert());
            }
            self.pos = checkpoint;
        }
        self.parse_atom()
    }

    // atom := "(" expr ")" | field_expr
    fn parse_atom(&mut self) -> Result<Expr> {
        self.skip_ws();
        if self.try_literal("(") {
            let e = self.parse_or()?;
            self.skip_ws();
            self.expect_literal(")")?;
            return Ok(e);
        }
        self.parse_field_expr()
    }

    fn parse_field_expr(&mut self) -> Result<Expr> {
        // Try the reversed "VALUE [not] in FIELD" form first (strings and
        // map-members only), since it starts with a value, not a keyword.
        let checkpoint = self.pos;
        if let Some(e) = self.try_reversed_in()? {
            return Ok(e);
        }
        self.pos = checkpoint;

        let path_start = self.pos;
        let name = self
            .read_ident()
            .ok_or_else(|| self.err("expected a field name"))?;
        let member = if self.peek() == Some('.') {
            self.pos += 1;
            Some(
                self.read_member()
                    .ok_or_else(|| self.err("expected subfield name after '.'"))?,
            )
        } else {
            None
        };

        let (idx, field_ty) = self
            .schema
            .index_of(&name)
            .map(|idx| (idx, self.schema.field(idx).ty))
            .ok_or_else(|| {
                self.pos = path_start;
                self.err(format!("unknown field '{name}'"))
            })?;

        let field_ref = match (&member, field_ty) {
            (Some(m), FieldType::Map(_)) => FieldRef::Member {
                parent: idx,
                member: m.clone(),
            },
            (None, _) => FieldRef::Direct(idx),
            (Some(_), _) => return Err(self.err(format!("field '{name}' has no subfields"))),
        };

        let resolved_ty = match (&member, field_ty) {
            (Some(_), FieldType::Map(_)) => FieldType::Str,
            (None, ty) => ty,
            _ => unreachable!(),
        };

        match resolved_ty {
            FieldType::Bool => self.parse_bool_tail(field_ref),
            FieldType::Int => self.parse_int_tail(field_ref),
            FieldType::Str => self.parse_str_tail(field_ref),
            FieldType::IpAddress => self.parse_ip_tail(field_ref),
            FieldType::Map(_) => Err(self.err("bare map field cannot be used as an expression")),
        }
    }

    fn try_reversed_in(&mut self) -> Result<Option<Expr>> {
        let checkpoint = self.pos;
        let Ok(value) = self.read_string_literal() else {
            self.pos = checkpoint;
            return Ok(None);
        };
        if self.require_ws().is_err() {
            self.pos = checkpoint;
            return Ok(None);
        }
        let inverted = if self.try_keyword("not") {
            self.skip_ws();
            true
        } else {
            false
        };
        if !self.try_keyword("in") {
            self.pos = checkpoint;
            return Ok(None);
        }
        if self.require_ws().is_err() {
            self.pos = checkpoint;
            return Ok(None);
        }
        let path_start = self.pos;
        let Some(name) = self.read_ident() else {
            self.pos = checkpoint;
            return Ok(None);
        };
        let member = if self.peek() == Some('.') {
            self.pos += 1;
            self.read_member()
        } else {
            None
        };
        let Some((idx, ty)) = self.schema.index_of(&name).map(|i| (i, self.schema.field(i).ty)) else {
            self.pos = checkpoint;
            let _ = path_start;
            return Ok(None);
        };
        let field_ref = match (&member, ty) {
            (Some(m), FieldType::Map(_)) => FieldRef::Member { parent: idx, member: m.clone() },
            (None, FieldType::Str) | (None, FieldType::Map(_)) => FieldRef::Direct(idx),
            _ => {
                self.pos = checkpoint;
                return Ok(None);
            }
        };
        Ok(Some(Expr::Field {
            field: field_ref,
            op: FieldOp::Contains(value),
            inverted,
        }))
    }

    fn parse_bool_tail(&mut self, field: FieldRef) -> Result<Expr> {
        let checkpoint = self.pos;
        self.skip_ws();
        if self.try_literal("=") {
            self.skip_ws();
            let lit = if self.try_keyword("true") {
                Literal::Bool(true)
            } else if self.try_keyword("false") {
                Literal::Bool(false)
            } else if self.try_keyword("null") {
                Literal::Null
            } else {
                return Err(self.err("expected true, false or null"));
            };
            return Ok(Expr::Field {
                field,
                op: FieldOp::Equal(lit),
                inverted: false,
            });
        }
        self.pos = checkpoint;
        Ok(Expr::Unary {
            field,
            inverted: false,
        })
    }

    fn parse_int_tail(&mut self, field: FieldRef) -> Result<Expr> {
        self.require_ws()?;
        if self.try_keyword("in") {
            self.skip_ws();
            let list = self.parse_int_list()?;
            return Ok(Expr::Field {
                field,
                op: FieldOp::InInts(list),
                inverted: false,
            });
        }
        if self.try_literal("<=") {
            self.skip_ws();
            let n = self.read_int().ok_or_else(|| self.err("expected integer"))?;
            return Ok(Expr::Field { field, op: FieldOp::LessThanEqual(n), inverted: false });
        }
        if self.try_literal(">=") {
            self.skip_ws();
            let n = self.read_int().ok_or_else(|| self.err("expected integer"))?;
            return Ok(Expr::Field { field, op: FieldOp::GreaterThanEqual(n), inverted: false });
        }
        if self.try_literal("<") {
            self.skip_ws();
            let n = self.read_int().ok_or_else(|| self.err("expected integer"))?;
            return Ok(Expr::Field { field, op: FieldOp::LessThan(n), inverted: false });
        }
        if self.try_literal(">") {
            self.skip_ws();
            let n = self.read_int().ok_or_else(|| self.err("expected integer"))?;
            return Ok(Expr::Field { field, op: FieldOp::GreaterThan(n), inverted: false });
        }
        if self.try_literal("=") {
            self.skip_ws();
            if self.try_keyword("null") {
                return Ok(Expr::Field { field, op: FieldOp::Equal(Literal::Null), inverted: false });
            }
            let n = self.read_int().ok_or_else(|| self.err("expected integer or null"))?;
            return Ok(Expr::Field { field, op: FieldOp::Equal(Literal::Int(n)), inverted: false });
        }
        Err(self.err("expected an integer comparison operator"))
    }

    fn parse_int_list(&mut self) -> Result<Vec<i64>> {
        self.expect_literal("[")?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.try_literal("]") {
            return Ok(items);
        }
        loop {
            self.skip_ws();
            let n = self.read_int().ok_or_else(|| self.err("expected integer"))?;
            items.push(n);
            self.skip_ws();
            if self.try_literal(",") {
                continue;
            }
            self.expect_literal("]")?;
            break;
        }
        Ok(items)
    }

    fn parse_str_list(&mut self) -> Result<Vec<String>> {
        self.expect_literal("[")?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.try_literal("]") {
            return Ok(items);
        }
        loop {
            self.skip_ws();
            let s = self.read_string_literal()?;
            items.push(s);
            self.skip_ws();
            if self.try_literal(",") {
                continue;
            }
            self.expect_literal("]")?;
            break;
        }
        Ok(items)
    }

    fn parse_str_tail(&mut self, field: FieldRef) -> Result<Expr> {
        self.require_ws()?;
        // Leading '!' immediately before the operator token (e.g. `!=`, `!~`, `!startswith`).
        let bang = self.try_literal("!");
        if self.try_keyword("startswith") {
            self.skip_ws();
            let s = self.read_string_literal()?;
            return Ok(Expr::Field { field, op: FieldOp::Startswith(s), inverted: bang });
        }
        if self.try_keyword("endswith") {
            self.skip_ws();
            let s = self.read_string_literal()?;
            return Ok(Expr::Field { field, op: FieldOp::Endswith(s), inverted: bang });
        }
        if self.try_literal("~") {
            let ci = self.try_literal("*");
            self.skip_ws();
            let pattern = self.read_string_literal()?;
            regex::Regex::new(&pattern).map_err(|e| self.err(format!("invalid regex '{pattern}': {e}")))?;
            return Ok(Expr::Field { field, op: FieldOp::Match { pattern, ci }, inverted: bang });
        }
        let not_prefix = if !bang && self.try_keyword("not") {
            self.skip_ws();
            true
        } else {
            bang
        };
        if self.try_keyword("in") {
            self.skip_ws();
            let list = self.parse_str_list()?;
            return Ok(Expr::Field { field, op: FieldOp::InStrs(list), inverted: not_prefix });
        }
        if bang || not_prefix {
            return Err(self.err("expected an operator after '!'/'not'"));
        }
        if self.try_literal("=") {
            self.skip_ws();
            if self.try_keyword("null") {
                return Ok(Expr::Field { field, op: FieldOp::Equal(Literal::Null), inverted: false });
            }
            let s = self.read_string_literal()?;
            return Ok(Expr::Field { field, op: FieldOp::Equal(Literal::Str(s)), inverted: false });
        }
        Err(self.err("expected a string comparison operator"))
    }

    fn parse_ip_tail(&mut self, field: FieldRef) -> Result<Expr> {
        self.require_ws()?;
        if self.try_keyword("in") {
            self.skip_ws();
            let s = self.read_bare_word().ok_or_else(|| self.err("expected a CIDR literal"))?;
            let net: Ipv4Net = s.parse().map_err(|_| self.err(format!("invalid CIDR '{s}'")))?;
            return Ok(Expr::Field { field, op: FieldOp::InNet(net), inverted: false });
        }
        if self.try_literal("=") {
            self.skip_ws();
            if self.try_keyword("null") {
                return Ok(Expr::Field { field, op: FieldOp::Equal(Literal::Null), inverted: false });
            }
            let s = self.read_bare_word().ok_or_else(|| self.err("expected an IP literal"))?;
            let ip = s.parse().map_err(|_| self.err(format!("invalid IP '{s}'")))?;
            return Ok(Expr::Field { field, op: FieldOp::Equal(Literal::Ip(ip)), inverted: false });
        }
        Err(self.err("expected '=' or 'in'"))
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::builtin()
    }

    #[test]
    fn parses_unary_bool_field() {
        let schema = schema();
        let e = parse_expr(&schema, "authenticated").unwrap();
        assert_eq!(e.print(&schema), "authenticated");
    }

    #[test]
    fn parses_inverted_unary_bool_field() {
        let schema = schema();
        let e = parse_expr(&schema, "not authenticated").unwrap();
        assert_eq!(e.print(&schema), "not authenticated");
    }

    #[test]
    fn parses_int_in_list() {
        let schema = schema();
        let e = parse_expr(&schema, "content_length in [1,2,3]").unwrap();
        assert_eq!(e.print(&schema), "content_length in [1,2,3]");
    }

    #[test]
    fn parses_ip_in_cidr() {
        let schema = schema();
        let e = parse_expr(&schema, "client_ip4 in 1.2.3.4/32").unwrap();
        assert_eq!(e.print(&schema), "client_ip4 in 1.2.3.4/32");
    }

    #[test]
    fn parses_header_subfield_regex() {
        let schema = schema();
        let e = parse_expr(&schema, r#"headers.x_test ~ "v\d+""#).unwrap();
        assert_eq!(e.print(&schema), r#"headers.x_test ~ "v\d+""#);
    }

    #[test]
    fn parses_and_or_precedence() {
        let schema = schema();
        let e = parse_expr(&schema, "method = GET or method = POST and authenticated").unwrap();
        assert_eq!(e.print(&schema), "method = GET or method = POST and authenticated");
    }

    #[test]
    fn parses_parenthesized_group() {
        let schema = schema();
        let e = parse_expr(&schema, "(method = GET or method = POST) and authenticated").unwrap();
        assert_eq!(e.print(&schema), "(method = GET or method = POST) and authenticated");
    }

    #[test]
    fn print_parse_round_trip_disjunction() {
        let schema = schema();
        let e = parse_expr(&schema, "method in [GET, POST]").unwrap();
        let printed = e.print(&schema);
        let reparsed = parse_expr(&schema, &printed).unwrap();
        assert_eq!(e, reparsed);
    }

    #[test]
    fn reversed_contains_form() {
        let schema = schema();
        let e = parse_expr(&schema, "\"v123\" in headers.x_test").unwrap();
        assert_eq!(e.print(&schema), "\"v123\" in headers.x_test");
    }

    #[test]
    fn rejects_unknown_field() {
        let schema = schema();
        assert!(parse_expr(&schema, "bogus = 1").is_err());
    }

    #[test]
    fn rejects_invalid_regex() {
        let schema = schema();
        assert!(parse_expr(&schema, r#"path ~ "(""#).is_err());
    }
}
