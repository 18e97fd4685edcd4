//! C5: rules — ordered match-one-of-many routing rules.

use std::collections::HashSet;
use std::io::BufRead;

use tracing::warn;

use crate::error::{Error, Result};
use crate::expr::{compile, Compiled, Expr, Symbols};
use crate::request::{Request, Schema};
use crate::upstream::Upstream;

/// What to do when evaluating a rule raises an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Propagate the error to the caller immediately.
    Raise,
    /// Disable the offending rule so it is skipped on future requests.
    Disable,
    /// Log and move on without disabling the rule.
    Suppress,
}

/// A single uncompiled rule: an expression and the upstream it selects.
#[derive(Debug, Clone)]
pub struct Rule {
    pub expression: Expr,
    pub upstream: Upstream,
}

impl Rule {
    pub fn new(expression: Expr, upstream: Upstream) -> Self {
        Rule { expression, upstream }
    }

    pub fn matches(&self, request: &Request) -> Result<Option<Upstream>> {
        if self.expression.eval(request)? {
            Ok(Some(self.upstream.clone()))
        } else {
            Ok(None)
        }
    }

    pub fn compile(&self, symbols: &mut Symbols) -> CompiledRule {
        CompiledRule {
            expression: self.expression.clone(),
            compiled: compile(&self.expression, symbols),
            upstream: self.upstream.clone(),
        }
    }

    pub fn print(&self, schema: &Schema) -> String {
        format!("{} => {}", self.expression.print(schema), self.upstream)
    }
}

/// A rule whose expression has been flattened into interned-symbol byte
/// code (see [`crate::expr::compile`]). Matching a compiled rule avoids
/// re-walking the `Expr` tree on every request; the source `Expr` is kept
/// alongside purely so the rule can still be printed or dumped.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub expression: Expr,
    pub compiled: Compiled,
    pub upstream: Upstream,
}

impl CompiledRule {
    pub fn matches(&self, request: &Request, symbols: &Symbols) -> Result<Option<Upstream>> {
        if self.compiled.eval(request, symbols)? {
            Ok(Some(self.upstream.clone()))
        } else {
            Ok(None)
        }
    }

    pub fn print(&self, schema: &Schema) -> String {
        format!("{} => {}", self.expression.print(schema), self.upstream)
    }
}

enum Entry {
    Plain(Rule),
    Compiled(CompiledRule),
}

impl Entry {
    fn upstream(&self) -> &Upstream {
        match self {
            Entry::Plain(r) => &r.upstream,
            Entry::Compiled(r) => &r.upstream,
        }
    }

    fn print(&self, schema: &Schema) -> String {
        match self {
            Entry::Plain(r) => r.print(schema),
            Entry::Compiled(r) => r.print(schema),
        }
    }
}

/// An ordered list of routing rules with optional compilation,
/// auto-disable-on-error, and line-based load/dump.
pub struct Rules {
    entries: Vec<Entry>,
    disabled: HashSet<usize>,
    symbols: Symbols,
    compile: bool,
    pub strict: bool,
    pub auto_disable: bool,
}

impl Rules {
    pub fn new() -> Self {
        Rules {
            entries: Vec::new(),
            disabled: HashSet::new(),
            symbols: Symbols::new(),
            compile: false,
            strict: true,
            auto_disable: false,
        }
    }

    pub fn with_compile(mut self, compile: bool) -> Self {
        self.set_compile(compile);
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_auto_disable(mut self, auto_disable: bool) -> Self {
        self.auto_disable = auto_disable;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn compile_enabled(&self) -> bool {
        self.compile
    }

    /// Turning compilation on recompiles every existing rule against a
    /// fresh symbol table; turning it off drops back to plain expression
    /// walking. Disabled-index membership is preserved across the switch.
    pub fn set_compile(&mut self, compile: bool) {
        if compile == self.compile {
            return;
        }
        self.compile = compile;
        if compile {
            let mut symbols = Symbols::new();
            let entries = std::mem::take(&mut self.entries)
                .into_iter()
                .map(|e| match e {
                    Entry::Plain(r) => Entry::Compiled(r.compile(&mut symbols)),
                    Entry::Compiled(r) => Entry::Compiled(
                        Rule::new(r.expression, r.upstream).compile(&mut symbols),
                    ),
                })
                .collect();
            self.symbols = symbols;
            self.entries = entries;
        } else {
            self.symbols = Symbols::new();
            self.entries = std::mem::take(&mut self.entries)
                .into_iter()
                .map(|e| match e {
                    Entry::Plain(r) => Entry::Plain(r),
                    Entry::Compiled(r) => Entry::Plain(Rule::new(r.expression, r.upstream)),
                })
                .collect();
        }
    }

    pub fn push(&mut self, rule: Rule) {
        let entry = if self.compile {
            Entry::Compiled(rule.compile(&mut self.symbols))
        } else {
            Entry::Plain(rule)
        };
        self.entries.push(entry);
    }

    pub fn disable(&mut self, i: usize) {
        self.disabled.insert(i);
    }

    pub fn enable(&mut self, i: usize) {
        self.disabled.remove(&i);
    }

    pub fn disable_all(&mut self) {
        self.disabled = (0..self.entries.len()).collect();
    }

    pub fn enable_all(&mut self) {
        self.disabled.clear();
    }

    pub fn is_disabled(&self, i: usize) -> bool {
        self.disabled.contains(&i)
    }

    pub fn disabled_count(&self) -> usize {
        self.disabled.len()
    }

    /// Evaluate the rules in order against `request`, returning the first
    /// match's upstream.
    ///
    /// Most fields resolve to `Value::Null` rather than erroring, but a
    /// malformed `content_length` (and any field a future
    /// [`Dynamic`](crate::dynamic::Dynamic) backend can't resolve) raises.
    /// When a rule's evaluation raises, `on_error` decides what happens:
    /// `Raise` propagates the error immediately, `Disable` disables the
    /// offending rule (so it is skipped on every later call) and moves on,
    /// `Suppress` just logs and moves on. In both non-`Raise` cases the
    /// scan index still advances past the errored rule; it is never
    /// retried within the same call.
    pub fn match_request(&mut self, request: &Request, on_error: OnError) -> Result<Option<Upstream>> {
        let mut i = 0;
        while i < self.entries.len() {
            if !self.disabled.contains(&i) {
                let hit = match &self.entries[i] {
                    Entry::Plain(r) => r.matches(request),
                    Entry::Compiled(r) => r.matches(request, &self.symbols),
                };
                match hit {
                    Ok(Some(up)) => return Ok(Some(up)),
                    Ok(None) => {}
                    Err(err) => match on_error {
                        OnError::Raise => return Err(err),
                        OnError::Disable => {
                            warn!(rule = i, error = %err, "rule evaluation failed, disabling");
                            self.disabled.insert(i);
                        }
                        OnError::Suppress => {
                            warn!(rule = i, error = %err, "rule evaluation failed, skipping");
                        }
                    },
                }
            }
            i += 1;
        }
        Ok(None)
    }

    /// `OnError` chosen the way the matching engine this was adapted from
    /// picks a default: `Suppress` unless auto-disable is enabled, in
    /// which case errors disable the offending rule.
    pub fn default_on_error(&self) -> OnError {
        if self.auto_disable {
            OnError::Disable
        } else {
            OnError::Suppress
        }
    }

    pub fn load(&mut self, schema: &Schema, reader: impl BufRead, source: &str) -> Result<()> {
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::Config(e.to_string()))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match crate::parser::parse_rule_line(schema, line) {
                Ok((expr, upstream)) => self.push(Rule::new(expr, upstream)),
                Err(ex) if !self.strict => {
                    warn!(source, lineno, error = %ex, "unable to parse rule, skipping");
                }
                Err(ex) => return Err(ex),
            }
        }
        Ok(())
    }

    pub fn loads(&mut self, schema: &Schema, s: &str, source: &str) -> Result<()> {
        self.load(schema, s.as_bytes(), source)
    }

    pub fn dumps(&self, schema: &Schema) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.print(schema));
            out.push('\n');
        }
        out
    }

    pub fn upstream_at(&self, i: usize) -> &Upstream {
        self.entries[i].upstream()
    }
}

impl Default for Rules {
    fn default() -> Self {
        Rules::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Env;

    fn schema() -> Schema {
        Schema::builtin()
    }

    fn req(schema: &Schema, method: &str) -> Request<'_> {
        Request::new(schema, Env::new().set("REQUEST_METHOD", method))
    }

    #[test]
    fn first_match_wins() {
        let schema = schema();
        let mut rules = Rules::new();
        rules.loads(&schema, "method = GET => a\nmethod = GET => b\n", "<mem>").unwrap();
        let r = req(&schema, "GET");
        let on_error = rules.default_on_error();
        let up = rules.match_request(&r, on_error).unwrap().unwrap();
        assert_eq!(up.to_string(), "http://a,1");
    }

    #[test]
    fn no_match_falls_through() {
        let schema = schema();
        let mut rules = Rules::new();
        rules.loads(&schema, "method = POST => a\n", "<mem>").unwrap();
        let r = req(&schema, "GET");
        let on_error = rules.default_on_error();
        assert!(rules.match_request(&r, on_error).unwrap().is_none());
    }

    #[test]
    fn disabled_rule_is_skipped() {
        let schema = schema();
        let mut rules = Rules::new();
        rules.loads(&schema, "method = GET => a\nmethod = GET => b\n", "<mem>").unwrap();
        rules.disable(0);
        let r = req(&schema, "GET");
        let on_error = rules.default_on_error();
        let up = rules.match_request(&r, on_error).unwrap().unwrap();
        assert_eq!(up.to_string(), "http://b,1");
    }

    #[test]
    fn compiled_and_plain_agree() {
        let schema = schema();
        let mut rules = Rules::new();
        rules.loads(&schema, "method = GET => a\n", "<mem>").unwrap();
        rules.set_compile(true);
        let r = req(&schema, "GET");
        let on_error = rules.default_on_error();
        assert!(rules.match_request(&r, on_error).unwrap().is_some());
    }

    #[test]
    fn evaluation_error_disables_the_rule_and_the_rest_still_match() {
        let schema = schema();
        let mut rules = Rules::new().with_auto_disable(true);
        rules
            .loads(
                &schema,
                "content_length = 5 => first\nmethod = GET => second\n",
                "<mem>",
            )
            .unwrap();
        let r = Request::new(
            &schema,
            Env::new().set("REQUEST_METHOD", "GET").set("CONTENT_LENGTH", "abc"),
        );
        let on_error = rules.default_on_error();
        assert_eq!(on_error, OnError::Disable);
        let up = rules.match_request(&r, on_error).unwrap().unwrap();
        assert_eq!(up.to_string(), "http://second,1");
        assert!(rules.is_disabled(0));
        assert_eq!(rules.disabled_count(), 1);
    }

    #[test]
    fn suppress_logs_but_leaves_the_rule_enabled() {
        let schema = schema();
        let mut rules = Rules::new();
        rules
            .loads(
                &schema,
                "content_length = 5 => first\nmethod = GET => second\n",
                "<mem>",
            )
            .unwrap();
        let r = Request::new(
            &schema,
            Env::new().set("REQUEST_METHOD", "GET").set("CONTENT_LENGTH", "abc"),
        );
        let on_error = rules.default_on_error();
        assert_eq!(on_error, OnError::Suppress);
        let up = rules.match_request(&r, on_error).unwrap().unwrap();
        assert_eq!(up.to_string(), "http://second,1");
        assert!(!rules.is_disabled(0));
    }

    #[test]
    fn raise_propagates_the_error() {
        let schema = schema();
        let mut rules = Rules::new();
        rules.loads(&schema, "content_length = 5 => first\n", "<mem>").unwrap();
        let r = Request::new(&schema, Env::new().set("CONTENT_LENGTH", "abc"));
        assert!(rules.match_request(&r, OnError::Raise).is_err());
    }

    #[test]
    fn strict_load_rejects_bad_line() {
        let schema = schema();
        let mut rules = Rules::new().with_strict(true);
        assert!(rules.loads(&schema, "not a valid rule\n", "<mem>").is_err());
    }

    #[test]
    fn non_strict_load_skips_bad_line() {
        let schema = schema();
        let mut rules = Rules::new().with_strict(false);
        rules
            .loads(&schema, "not a valid rule\nmethod = GET => a\n", "<mem>")
            .unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let schema = schema();
        let mut rules = Rules::new();
        rules
            .loads(&schema, "# a comment\n\nmethod = GET => a\n", "<mem>")
            .unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn dumps_round_trips_through_loads() {
        let schema = schema();
        let mut rules = Rules::new();
        rules.loads(&schema, "method = GET => http://a,1\n", "<mem>").unwrap();
        let dumped = rules.dumps(&schema);
        let mut reloaded = Rules::new();
        reloaded.loads(&schema, &dumped, "<mem>").unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
