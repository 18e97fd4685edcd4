//! C6: router — host dispatch, override/rule/default resolution, and the
//! connect/load/save/watch lifecycle for an optional dynamic backend.

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dynamic::{Dynamic, WatchHandle};
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::request::{Request, Schema};
use crate::rule::Rules;
use crate::upstream::Upstream;

/// The subset of a router's configuration a dynamic backend can own and
/// push updates for. Kept as its own struct (rather than scattering
/// `#[serde(skip)]` across `Router`) so it has a clean `Serialize`/
/// `Deserialize` shape to send over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicSettings {
    pub enabled: bool,
    pub hosts: Vec<String>,
    pub compile_rules: bool,
    pub auto_disable_rules: bool,
    pub default_upstream: Option<Upstream>,
    /// Rendered as DSL lines, matching `Rules::dumps`/`Rules::loads`.
    pub overrides: Vec<String>,
}

/// Upstream selection engine for one named router.
///
/// `hosts`, `enabled`, `compile_rules`, `auto_disable_rules`,
/// `default_upstream` and `overrides` are the "dynamic" fields: the ones a
/// connected [`Dynamic`] backend can overwrite wholesale on `load()`.
/// `rules` is always local — only `overrides` is remotely managed, mirroring
/// the source's per-field `dynamic` tag.
pub struct Router {
    pub name: String,
    pub schema: std::sync::Arc<Schema>,
    enabled: RwLock<bool>,
    hosts: RwLock<Vec<Regex>>,
    compile_rules: RwLock<bool>,
    auto_disable_rules: RwLock<bool>,
    default_upstream: RwLock<Option<Upstream>>,
    pub rules: RwLock<Rules>,
    overrides: RwLock<Rules>,
    dynamic: Option<Box<dyn Dynamic>>,
    watch_handle: RwLock<Option<WatchHandle>>,
}

impl Router {
    pub fn new(name: impl Into<String>, schema: std::sync::Arc<Schema>) -> Self {
        Router {
            name: name.into(),
            schema,
            enabled: RwLock::new(true),
            hosts: RwLock::new(Vec::new()),
            compile_rules: RwLock::new(true),
            auto_disable_rules: RwLock::new(true),
            default_upstream: RwLock::new(None),
            rules: RwLock::new(Rules::new()),
            overrides: RwLock::new(Rules::new()),
            dynamic: None,
            watch_handle: RwLock::new(None),
        }
    }

    pub fn with_dynamic(mut self, dynamic: Box<dyn Dynamic>) -> Self {
        self.dynamic = Some(dynamic);
        self
    }

    pub fn set_hosts(&self, patterns: Vec<Regex>) {
        *self.hosts.write() = patterns;
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.write() = enabled;
    }

    pub fn enabled(&self) -> bool {
        *self.enabled.read()
    }

    pub fn set_default_upstream(&self, upstream: Option<Upstream>) {
        *self.default_upstream.write() = upstream;
    }

    pub fn default_upstream(&self) -> Option<Upstream> {
        self.default_upstream.read().clone()
    }

    pub fn set_compile_rules(&self, compile: bool) {
        *self.compile_rules.write() = compile;
        self.rules.write().set_compile(compile);
        self.overrides.write().set_compile(compile);
    }

    pub fn set_auto_disable_rules(&self, auto_disable: bool) {
        *self.auto_disable_rules.write() = auto_disable;
        self.rules.write().auto_disable = auto_disable;
        self.overrides.write().auto_disable = auto_disable;
    }

    /// Should this router handle `request`? True iff at least one host
    /// pattern matches `request`'s `host` field (P10: host dispatch happens
    /// before any rule is evaluated). `enabled` is one of the dynamic
    /// fields a backend can push, but nothing in this crate reads it today.
    pub fn match_me(&self, request: &Request) -> bool {
        let Ok(host) = request.get("host") else { return false };
        let Some(host) = host.as_str() else { return false };
        self.hosts.read().iter().any(|re| re.is_match(host))
    }

    /// Resolve the upstream for `request`: overrides, then rules, then the
    /// router's default, in that order (§6.2).
    pub fn match_upstream(&self, request: &Request) -> Option<Upstream> {
        let timer = self.match_duration_timer();
        let outcome = self.match_upstream_inner(request);
        drop(timer);
        METRICS.record_match(&self.name, outcome.0);
        outcome.1
    }

    fn match_duration_timer(&self) -> prometheus::HistogramTimer {
        METRICS.match_duration_seconds.with_label_values(&[&self.name]).start_timer()
    }

    fn match_upstream_inner(&self, request: &Request) -> (&'static str, Option<Upstream>) {
        {
            let mut overrides = self.overrides.write();
            let on_error = overrides.default_on_error();
            match overrides.match_request(request, on_error) {
                Ok(Some(up)) => return ("override", Some(up)),
                Ok(None) => {}
                Err(err) => {
                    METRICS.record_rule_error(&self.name);
                    tracing::error!(router = %self.name, error = %err, "override evaluation failed");
                }
            }
        }
        {
            let mut rules = self.rules.write();
            let on_error = rules.default_on_error();
            let result = rules.match_request(request, on_error);
            METRICS.set_rules_disabled(&self.name, rules.disabled_count());
            match result {
                Ok(Some(up)) => return ("rule", Some(up)),
                Ok(None) => {}
                Err(err) => {
                    METRICS.record_rule_error(&self.name);
                    tracing::error!(router = %self.name, error = %err, "rule evaluation failed");
                }
            }
        }
        match self.default_upstream() {
            Some(up) => ("default", Some(up)),
            None => ("none", None),
        }
    }

    fn snapshot(&self) -> DynamicSettings {
        DynamicSettings {
            enabled: self.enabled(),
            hosts: self.hosts.read().iter().map(|r| r.as_str().to_string()).collect(),
            compile_rules: *self.compile_rules.read(),
            auto_disable_rules: *self.auto_disable_rules.read(),
            default_upstream: self.default_upstream(),
            overrides: self
                .overrides
                .read()
                .dumps(&self.schema)
                .lines()
                .map(String::from)
                .collect(),
        }
    }

    fn apply(&self, settings: DynamicSettings) -> Result<()> {
        let mut hosts = Vec::with_capacity(settings.hosts.len());
        for pattern in &settings.hosts {
            hosts.push(Regex::new(pattern).map_err(|e| Error::Config(e.to_string()))?);
        }
        let mut overrides = Rules::new()
            .with_compile(settings.compile_rules)
            .with_auto_disable(settings.auto_disable_rules);
        for line in &settings.overrides {
            overrides.loads(&self.schema, line, &self.name)?;
        }
        *self.enabled.write() = settings.enabled;
        *self.hosts.write() = hosts;
        *self.compile_rules.write() = settings.compile_rules;
        *self.auto_disable_rules.write() = settings.auto_disable_rules;
        *self.default_upstream.write() = settings.default_upstream;
        self.rules.write().set_compile(settings.compile_rules);
        self.rules.write().auto_disable = settings.auto_disable_rules;
        *self.overrides.write() = overrides;
        Ok(())
    }

    fn is_dynamic(&self) -> bool {
        self.dynamic.as_ref().is_some_and(|d| d.can_connect())
    }

    pub fn connect(&self) -> Result<()> {
        if !self.is_dynamic() {
            return Err(Error::RouterNotDynamic);
        }
        self.dynamic.as_ref().unwrap().connect()
    }

    pub fn is_connected(&self) -> bool {
        self.is_dynamic() && self.dynamic.as_ref().unwrap().is_connected()
    }

    pub fn disconnect(&self) -> Result<()> {
        if self.is_connected() {
            *self.watch_handle.write() = None;
            self.dynamic.as_ref().unwrap().disconnect()
        } else {
            Ok(())
        }
    }

    /// Atomically swap in the dynamic-tagged fields fetched from the
    /// backend, falling back to this router's current values for anything
    /// the remote store does not itself carry.
    pub fn load(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::RouterNotConnected);
        }
        let fallback = self.snapshot();
        let settings = self.dynamic.as_ref().unwrap().load(&fallback)?;
        self.apply(settings)
    }

    pub fn save(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::RouterNotConnected);
        }
        self.dynamic.as_ref().unwrap().save(&self.snapshot())
    }

    /// Start watching the dynamic backend for remote changes, reloading
    /// this router whenever one occurs. `self` must outlive the returned
    /// watch (enforced here via `'static` + `Arc`, since the callback runs
    /// from a background thread long after `watch` returns).
    pub fn watch(self: &std::sync::Arc<Self>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::RouterNotConnected);
        }
        let router = std::sync::Arc::clone(self);
        let backend = self.dynamic.as_ref().unwrap().backend_name();
        let handle = self.dynamic.as_ref().unwrap().watch(Box::new(move || {
            METRICS.record_watch_callback(&router.name, backend);
            if let Err(err) = router.load() {
                tracing::warn!(router = %router.name, error = %err, "dynamic reload failed");
            }
        }))?;
        *self.watch_handle.write() = Some(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Env;
    use crate::upstream::{Protocol, Selection, Server};

    fn router() -> Router {
        Router::new("test", std::sync::Arc::new(Schema::builtin()))
    }

    fn upstream(loc: &str) -> Upstream {
        Upstream::new(vec![Selection {
            server: Server { protocol: Protocol::Http, location: loc.into() },
            weight: 1,
        }])
    }

    #[test]
    fn enabled_flag_does_not_gate_host_matching() {
        let r = router();
        r.set_hosts(vec![Regex::new("example.com").unwrap()]);
        r.set_enabled(false);
        let req = Request::new(&r.schema, Env::new().set("HTTP_HOST", "example.com"));
        assert!(r.match_me(&req));
    }

    #[test]
    fn unresolvable_host_never_matches() {
        let r = router();
        r.set_hosts(vec![Regex::new("example.com").unwrap()]);
        let req = Request::new(&r.schema, Env::new());
        assert!(!r.match_me(&req));
    }

    #[test]
    fn host_pattern_gates_matching() {
        let r = router();
        r.set_hosts(vec![Regex::new("^api\\.").unwrap()]);
        let req = Request::new(&r.schema, Env::new().set("HTTP_HOST", "api.example.com"));
        assert!(r.match_me(&req));
        let other = Request::new(&r.schema, Env::new().set("HTTP_HOST", "www.example.com"));
        assert!(!r.match_me(&other));
    }

    #[test]
    fn overrides_beat_rules_beat_default() {
        let r = router();
        r.rules.write().loads(&r.schema, "method = GET => rule\n", "<mem>").unwrap();
        r.overrides.write().loads(&r.schema, "method = GET => override\n", "<mem>").unwrap();
        r.set_default_upstream(Some(upstream("default")));
        let req = Request::new(&r.schema, Env::new().set("REQUEST_METHOD", "GET"));
        assert_eq!(r.match_upstream(&req).unwrap().to_string(), "http://override,1");
    }

    #[test]
    fn falls_back_to_default_when_nothing_matches() {
        let r = router();
        r.set_default_upstream(Some(upstream("default")));
        let req = Request::new(&r.schema, Env::new().set("REQUEST_METHOD", "GET"));
        assert_eq!(r.match_upstream(&req).unwrap().to_string(), "http://default,1");
    }

    #[test]
    fn without_dynamic_backend_connect_errors() {
        let r = router();
        assert!(matches!(r.connect(), Err(Error::RouterNotDynamic)));
    }

    #[test]
    fn load_without_connection_errors() {
        let r = router();
        assert!(matches!(r.load(), Err(Error::RouterNotConnected)));
    }
}
