//! ZooKeeper-backed [`Dynamic`]: settings under `{root}/config`, override
//! rules under `{root}/overrides`, watched via data watches on both znodes.
//! Grounded on the source's `router/zookeeper.py`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;
use zookeeper::{Acl, CreateMode, WatchedEvent, Watcher, ZkError, ZooKeeper};

use super::{Dynamic, WatchHandle};
use crate::error::{Error, Result};
use crate::router::DynamicSettings;

/// A no-op default watcher; znode-specific watches are installed per call
/// via `*_w` methods rather than through the session-wide watcher.
struct NullWatcher;

impl Watcher for NullWatcher {
    fn handle(&self, _event: WatchedEvent) {}
}

pub struct ZookeeperDynamic {
    hosts: Vec<String>,
    timeout: Duration,
    root: String,
    client: Mutex<Option<Arc<ZooKeeper>>>,
}

impl ZookeeperDynamic {
    pub fn new(hosts: Vec<String>, root: impl Into<String>) -> Self {
        ZookeeperDynamic {
            hosts,
            timeout: Duration::from_secs(15),
            root: root.into(),
            client: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn config_path(&self) -> String {
        format!("{}/config", self.root.trim_end_matches('/'))
    }

    fn overrides_path(&self) -> String {
        format!("{}/overrides", self.root.trim_end_matches('/'))
    }

    fn client(&self) -> Result<Arc<ZooKeeper>> {
        self.client.lock().unwrap().clone().ok_or(Error::RouterNotConnected)
    }

    fn ensure_path(cli: &ZooKeeper, path: &str) -> Result<()> {
        if cli.exists(path, false).map_err(zk_err)?.is_some() {
            return Ok(());
        }
        let mut built = String::new();
        for segment in path.trim_start_matches('/').split('/') {
            built.push('/');
            built.push_str(segment);
            match cli.create(&built, Vec::new(), Acl::open_unsafe().clone(), CreateMode::Persistent) {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(e) => return Err(zk_err(e)),
            }
        }
        Ok(())
    }
}

fn zk_err(e: ZkError) -> Error {
    Error::RemoteIo(e.to_string())
}

impl Dynamic for ZookeeperDynamic {
    fn backend_name(&self) -> &'static str {
        "zookeeper"
    }

    fn can_connect(&self) -> bool {
        !self.hosts.is_empty() && !self.root.is_empty()
    }

    fn connect(&self) -> Result<()> {
        info!(hosts = ?self.hosts, "connecting to zookeeper");
        let cli = ZooKeeper::connect(&self.hosts.join(","), self.timeout, NullWatcher)
            .map_err(zk_err)?;
        *self.client.lock().unwrap() = Some(Arc::new(cli));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.lock().unwrap().is_some()
    }

    fn disconnect(&self) -> Result<()> {
        info!(hosts = ?self.hosts, "disconnecting from zookeeper");
        if let Some(cli) = self.client.lock().unwrap().take() {
            let _ = cli.close();
        }
        Ok(())
    }

    fn load(&self, fallback: &DynamicSettings) -> Result<DynamicSettings> {
        let cli = self.client()?;
        let config_path = self.config_path();
        let overrides_path = self.overrides_path();

        let mut settings = fallback.clone();
        if cli.exists(&config_path, false).map_err(zk_err)?.is_some() {
            let (raw, _stat) = cli.get_data(&config_path, false).map_err(zk_err)?;
            let text = String::from_utf8(raw).map_err(|e| Error::Config(e.to_string()))?;
            settings = serde_json::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        }
        if cli.exists(&overrides_path, false).map_err(zk_err)?.is_some() {
            let (raw, _stat) = cli.get_data(&overrides_path, false).map_err(zk_err)?;
            let text = String::from_utf8(raw).map_err(|e| Error::Config(e.to_string()))?;
            settings.overrides = text.lines().map(String::from).collect();
        }
        Ok(settings)
    }

    fn save(&self, settings: &DynamicSettings) -> Result<()> {
        let cli = self.client()?;
        let config_path = self.config_path();
        Self::ensure_path(&cli, &config_path)?;
        let config_text = serde_json::to_string(settings).map_err(|e| Error::Config(e.to_string()))?;
        info!(path = %config_path, "writing config");
        cli.set_data(&config_path, config_text.into_bytes(), None).map_err(zk_err)?;

        let overrides_path = self.overrides_path();
        Self::ensure_path(&cli, &overrides_path)?;
        let overrides_text = settings.overrides.join("\n");
        info!(path = %overrides_path, "writing overrides");
        cli.set_data(&overrides_path, overrides_text.into_bytes(), None).map_err(zk_err)?;
        Ok(())
    }

    fn watch(&self, on_change: Box<dyn Fn() + Send + Sync>) -> Result<WatchHandle> {
        let cli = self.client()?;
        let config_path = self.config_path();
        let overrides_path = self.overrides_path();
        Self::ensure_path(&cli, &config_path)?;
        Self::ensure_path(&cli, &overrides_path)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        info!(config_path, overrides_path, "watching");

        // The zookeeper crate's one-shot data watches must be re-armed after
        // each fire; poll both paths on a short interval instead of chaining
        // watch callbacks, which keeps the cooperative-stop contract simple.
        let join = std::thread::spawn(move || {
            let mut last = (Vec::<u8>::new(), Vec::<u8>::new());
            while !stop_thread.load(Ordering::SeqCst) {
                let config = cli.get_data(&config_path, false).map(|(d, _)| d).unwrap_or_default();
                let overrides = cli.get_data(&overrides_path, false).map(|(d, _)| d).unwrap_or_default();
                if (config.clone(), overrides.clone()) != last {
                    last = (config, overrides);
                    on_change();
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        });
        Ok(WatchHandle::new(stop, join))
    }
}
