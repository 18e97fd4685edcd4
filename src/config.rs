//! C8: process configuration. A YAML file describing a `RouterRegistry`:
//! the routers to build, their rules/overrides, and an optional dynamic
//! backend binding per router.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::Schema;
use crate::router::Router;
use crate::rule::Rules;
use crate::upstream::Upstream;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterRegistryConfig {
    /// Address the embedding proxy should bind its listener to; carried
    /// through for the process entrypoint, unused by the matching core.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub metrics: MetricsConfig,

    pub routers: Vec<RouterConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig { enabled: false, bind: default_metrics_bind() }
    }
}

fn default_metrics_bind() -> String {
    "127.0.0.1:9090".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_true")]
    pub compile_rules: bool,
    #[serde(default = "default_true")]
    pub auto_disable_rules: bool,
    pub default_upstream: Option<String>,
    /// Inline DSL lines, one rule per entry.
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub overrides: Vec<String>,
    pub dynamic: Option<DynamicConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DynamicConfig {
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
        channel: String,
        key: String,
        #[serde(default = "default_watch_timeout")]
        watch_timeout: f64,
    },
    Zookeeper {
        hosts: Vec<String>,
        root: String,
        #[serde(default = "default_session_timeout")]
        session_timeout: u64,
    },
    Etcd {
        endpoints: Vec<String>,
        key: String,
        #[serde(default = "default_watch_timeout")]
        watch_timeout: f64,
    },
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_watch_timeout() -> f64 {
    1.0
}

fn default_session_timeout() -> u64 {
    15
}

impl DynamicConfig {
    fn backend_name(&self) -> &'static str {
        match self {
            DynamicConfig::Redis { .. } => "redis",
            DynamicConfig::Zookeeper { .. } => "zookeeper",
            DynamicConfig::Etcd { .. } => "etcd",
        }
    }

    fn feature_compiled_in(&self) -> bool {
        match self {
            DynamicConfig::Redis { .. } => cfg!(feature = "redis-backend"),
            DynamicConfig::Zookeeper { .. } => cfg!(feature = "zookeeper-backend"),
            DynamicConfig::Etcd { .. } => cfg!(feature = "etcd-backend"),
        }
    }
}

impl RouterRegistryConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config(e.to_string()))?;
        Self::from_yaml(&text)
    }

    /// Validate every router's hosts, rules, overrides, default upstream,
    /// and dynamic backend availability before anything is built; fatal
    /// configuration problems are always caught here, never mid-request.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.routers.is_empty() {
            return Err(Error::Config("registry must define at least one router".into()));
        }
        let mut names = HashSet::new();
        for router in &self.routers {
            if !names.insert(router.name.as_str()) {
                return Err(Error::Config(format!("duplicate router name '{}'", router.name)));
            }
            for pattern in &router.hosts {
                Regex::new(pattern).map_err(|e| {
                    Error::Config(format!("router '{}': invalid host pattern '{pattern}': {e}", router.name))
                })?;
            }
            if let Some(dsl) = &router.default_upstream {
                crate::parser::upstream::parse_upstream(dsl).map_err(|e| {
                    Error::Config(format!("router '{}': invalid default_upstream: {e}", router.name))
                })?;
            }
            for (kind, lines) in [("rules", &router.rules), ("overrides", &router.overrides)] {
                for (i, line) in lines.iter().enumerate() {
                    crate::parser::parse_rule_line(schema, line).map_err(|e| {
                        Error::Config(format!(
                            "router '{}': {kind}[{i}] failed to parse: {e}",
                            router.name
                        ))
                    })?;
                }
            }
            if let Some(dynamic) = &router.dynamic {
                if !dynamic.feature_compiled_in() {
                    return Err(Error::Config(format!(
                        "router '{}': dynamic backend '{}' was not compiled into this binary",
                        router.name,
                        dynamic.backend_name(),
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the routers this config describes. Callers still need to
    /// `connect()`/`load()`/`watch()` any router carrying a `dynamic` block.
    pub fn build(&self, schema: std::sync::Arc<Schema>) -> Result<Vec<Router>> {
        self.validate(&schema)?;
        let mut routers = Vec::with_capacity(self.routers.len());
        for cfg in &self.routers {
            routers.push(self.build_one(cfg, std::sync::Arc::clone(&schema))?);
        }
        Ok(routers)
    }

    fn build_one(&self, cfg: &RouterConfig, schema: std::sync::Arc<Schema>) -> Result<Router> {
        let router = Router::new(cfg.name.clone(), schema);
        let hosts = cfg
            .hosts
            .iter()
            .map(|p| Regex::new(p).map_err(|e| Error::Config(e.to_string())))
            .collect::<Result<Vec<_>>>()?;
        router.set_hosts(hosts);
        router.set_compile_rules(cfg.compile_rules);
        router.set_auto_disable_rules(cfg.auto_disable_rules);

        if let Some(dsl) = &cfg.default_upstream {
            let upstream: Upstream = crate::parser::upstream::parse_upstream(dsl)?;
            router.set_default_upstream(Some(upstream));
        }

        let mut rules = Rules::new().with_compile(cfg.compile_rules).with_auto_disable(cfg.auto_disable_rules);
        for line in &cfg.rules {
            rules.loads(&router.schema, line, &cfg.name)?;
        }
        *router.rules.write() = rules;

        let mut overrides =
            Rules::new().with_compile(cfg.compile_rules).with_auto_disable(cfg.auto_disable_rules);
        for line in &cfg.overrides {
            overrides.loads(&router.schema, line, &cfg.name)?;
        }

        let router = if let Some(dynamic) = &cfg.dynamic {
            attach_dynamic(router, dynamic)?
        } else {
            router
        };
        Ok(router)
    }
}

fn attach_dynamic(router: Router, config: &DynamicConfig) -> Result<Router> {
    match config {
        #[cfg(feature = "redis-backend")]
        DynamicConfig::Redis { url, channel, key, watch_timeout } => {
            let backend = crate::dynamic::redis_backend::RedisDynamic::new(url.clone(), channel.clone(), key.clone())
                .with_watch_timeout(Duration::from_secs_f64(*watch_timeout));
            Ok(router.with_dynamic(Box::new(backend)))
        }
        #[cfg(feature = "zookeeper-backend")]
        DynamicConfig::Zookeeper { hosts, root, session_timeout } => {
            let backend = crate::dynamic::zookeeper_backend::ZookeeperDynamic::new(hosts.clone(), root.clone())
                .with_timeout(Duration::from_secs(*session_timeout));
            Ok(router.with_dynamic(Box::new(backend)))
        }
        #[cfg(feature = "etcd-backend")]
        DynamicConfig::Etcd { endpoints, key, .. } => {
            let backend = crate::dynamic::etcd_backend::EtcdDynamic::new(endpoints.clone(), key.clone())?;
            Ok(router.with_dynamic(Box::new(backend)))
        }
        #[allow(unreachable_patterns)]
        _ => Err(Error::Config("dynamic backend not compiled into this binary".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::builtin()
    }

    #[test]
    fn parses_minimal_registry() {
        let yaml = r#"
routers:
  - name: api
    hosts: ["^api\\."]
    default_upstream: "http://localhost:9000"
"#;
        let cfg = RouterRegistryConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.routers.len(), 1);
        cfg.validate(&schema()).unwrap();
    }

    #[test]
    fn rejects_empty_router_list() {
        let cfg = RouterRegistryConfig::from_yaml("routers: []\n").unwrap();
        assert!(cfg.validate(&schema()).is_err());
    }

    #[test]
    fn rejects_bad_host_pattern() {
        let yaml = r#"
routers:
  - name: api
    hosts: ["("]
"#;
        let cfg = RouterRegistryConfig::from_yaml(yaml).unwrap();
        assert!(cfg.validate(&schema()).is_err());
    }

    #[test]
    fn rejects_unparseable_rule_line() {
        let yaml = r#"
routers:
  - name: api
    rules: ["not a valid rule"]
"#;
        let cfg = RouterRegistryConfig::from_yaml(yaml).unwrap();
        assert!(cfg.validate(&schema()).is_err());
    }

    #[test]
    fn rejects_duplicate_router_names() {
        let yaml = r#"
routers:
  - name: api
  - name: api
"#;
        let cfg = RouterRegistryConfig::from_yaml(yaml).unwrap();
        assert!(cfg.validate(&schema()).is_err());
    }

    #[test]
    fn builds_routers_from_config() {
        let yaml = r#"
routers:
  - name: api
    hosts: ["^api\\."]
    rules:
      - "method = GET => http://a,1"
    default_upstream: "http://default,1"
"#;
        let cfg = RouterRegistryConfig::from_yaml(yaml).unwrap();
        let routers = cfg.build(std::sync::Arc::new(schema())).unwrap();
        assert_eq!(routers.len(), 1);
        assert_eq!(routers[0].rules.read().len(), 1);
    }
}
