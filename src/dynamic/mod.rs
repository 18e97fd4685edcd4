//! C7: dynamic backends — remote stores that can hold a router's
//! "dynamic" fields (`enabled`, `hosts`, `compile_rules`, `auto_disable_rules`,
//! `default_upstream`, `overrides`) and push change notifications.

#[cfg(feature = "redis-backend")]
pub mod redis_backend;
#[cfg(feature = "etcd-backend")]
pub mod etcd_backend;
#[cfg(feature = "zookeeper-backend")]
pub mod zookeeper_backend;

use crate::error::Result;
use crate::router::DynamicSettings;

/// A remote source of a router's dynamic settings, with optional
/// change-notification support.
///
/// Every method takes `&self` rather than `&mut self` because
/// implementations keep their live connection behind interior mutability
/// (a lock around an `Option<Client>`), matching how the router itself
/// holds its dynamic slice behind a lock (see [`crate::router::Router`]).
pub trait Dynamic: Send + Sync {
    /// Short label (`"redis"`, `"zookeeper"`, `"etcd"`) used to tag the
    /// `waypoint_watch_callbacks_total` metric.
    fn backend_name(&self) -> &'static str;

    /// Whether this backend has enough local configuration to attempt a
    /// connection at all (e.g. zookeeper requires a non-empty host list
    /// and a root path).
    fn can_connect(&self) -> bool;

    fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn disconnect(&self) -> Result<()>;

    /// Fetch the current remote settings, falling back to `fallback` for
    /// any field the remote store does not carry.
    fn load(&self, fallback: &DynamicSettings) -> Result<DynamicSettings>;

    /// Push `settings` to the remote store.
    fn save(&self, settings: &DynamicSettings) -> Result<()>;

    /// Start watching for remote changes, invoking `on_change` from a
    /// background thread whenever the store reports one. Returns a
    /// [`WatchHandle`] the caller must hold (and can `stop()`) to keep the
    /// watcher running; dropping it does not stop the thread, matching the
    /// "watch until you are told to stop" contract of the sources this was
    /// adapted from.
    fn watch(&self, on_change: Box<dyn Fn() + Send + Sync>) -> Result<WatchHandle>;
}

/// A handle to a background watcher thread. Calling `stop` sets a
/// cooperative flag the watcher loop checks between polls; it does not
/// forcibly kill the thread, since Rust has no safe thread-kill primitive.
pub struct WatchHandle {
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl WatchHandle {
    pub fn new(stop: std::sync::Arc<std::sync::atomic::AtomicBool>, join: std::thread::JoinHandle<()>) -> Self {
        WatchHandle { stop, join: Some(join) }
    }

    pub fn stop(mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
