//! Redis-backed [`Dynamic`]: a JSON blob under `key`, change notifications
//! pushed over a pub/sub `channel`. Grounded on the source's
//! `router/redis.py`, which stores the same JSON dump of the dynamic
//! fields and republishes it on every `save()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use r2d2::{ManageConnection, Pool};
use redis::{Client, Connection};
use tracing::info;

use super::{Dynamic, WatchHandle};
use crate::error::{Error, Result};
use crate::router::DynamicSettings;

/// A minimal `r2d2::ManageConnection` over `redis::Client`; the `redis`
/// crate itself has no r2d2 integration, so pooling needs this adapter.
struct RedisConnectionManager(Client);

impl ManageConnection for RedisConnectionManager {
    type Connection = Connection;
    type Error = redis::RedisError;

    fn connect(&self) -> std::result::Result<Connection, redis::RedisError> {
        self.0.get_connection()
    }

    fn is_valid(&self, conn: &mut Connection) -> std::result::Result<(), redis::RedisError> {
        redis::cmd("PING").query(conn)
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        !conn.is_open()
    }
}

pub struct RedisDynamic {
    url: String,
    channel: String,
    key: String,
    watch_timeout: Duration,
    pool: Mutex<Option<Pool<RedisConnectionManager>>>,
    client: Mutex<Option<Client>>,
}

impl RedisDynamic {
    pub fn new(url: impl Into<String>, channel: impl Into<String>, key: impl Into<String>) -> Self {
        RedisDynamic {
            url: url.into(),
            channel: channel.into(),
            key: key.into(),
            watch_timeout: Duration::from_secs(1),
            pool: Mutex::new(None),
            client: Mutex::new(None),
        }
    }

    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    fn pool(&self) -> Result<Pool<RedisConnectionManager>> {
        self.pool.lock().unwrap().clone().ok_or(Error::RouterNotConnected)
    }
}

impl Dynamic for RedisDynamic {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    fn can_connect(&self) -> bool {
        true
    }

    fn connect(&self) -> Result<()> {
        info!(url = %self.url, "connecting to redis");
        let client = Client::open(self.url.as_str()).map_err(|e| Error::RemoteIo(e.to_string()))?;
        let pool = Pool::builder()
            .build(RedisConnectionManager(client.clone()))
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        *self.pool.lock().unwrap() = Some(pool);
        *self.client.lock().unwrap() = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool.lock().unwrap().is_some()
    }

    fn disconnect(&self) -> Result<()> {
        info!(url = %self.url, "disconnecting from redis");
        *self.pool.lock().unwrap() = None;
        *self.client.lock().unwrap() = None;
        Ok(())
    }

    fn load(&self, fallback: &DynamicSettings) -> Result<DynamicSettings> {
        use redis::Commands;
        let pool = self.pool()?;
        let mut conn = pool.get().map_err(|e| Error::RemoteIo(e.to_string()))?;
        info!(key = %self.key, "getting key");
        let text: Option<String> = conn.get(&self.key).map_err(|e| Error::RemoteIo(e.to_string()))?;
        match text {
            Some(text) => serde_json::from_str(&text).map_err(|e| Error::Config(e.to_string())),
            None => Ok(fallback.clone()),
        }
    }

    fn save(&self, settings: &DynamicSettings) -> Result<()> {
        use redis::Commands;
        let pool = self.pool()?;
        let mut conn = pool.get().map_err(|e| Error::RemoteIo(e.to_string()))?;
        let text = serde_json::to_string(settings).map_err(|e| Error::Config(e.to_string()))?;
        info!(key = %self.key, "setting key");
        let _: () = conn.set(&self.key, &text).map_err(|e| Error::RemoteIo(e.to_string()))?;
        info!(channel = %self.channel, "publishing");
        let _: () = conn
            .publish(&self.channel, &text)
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        Ok(())
    }

    /// Pub/sub needs a connection of its own rather than one borrowed from
    /// the pool, since it blocks on `get_message()` for the life of the
    /// watcher thread; the source does the same (its pubsub connection is
    /// separate from the one used for plain get/set).
    fn watch(&self, on_change: Box<dyn Fn() + Send + Sync>) -> Result<WatchHandle> {
        let client = self.client.lock().unwrap().clone().ok_or(Error::RouterNotConnected)?;
        let channel = self.channel.clone();
        let timeout = self.watch_timeout;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        info!(channel = %channel, "subscribing");
        let join = std::thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(error = %err, "redis watch connection failed");
                    return;
                }
            };
            let mut pubsub = conn.as_pubsub();
            if pubsub.subscribe(&channel).is_err() {
                return;
            }
            let _ = pubsub.set_read_timeout(Some(timeout));
            while !stop_thread.load(Ordering::SeqCst) {
                match pubsub.get_message() {
                    Ok(_) => on_change(),
                    Err(_) => continue,
                }
            }
        });
        Ok(WatchHandle::new(stop, join))
    }
}
