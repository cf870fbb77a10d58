//! Shared test infrastructure for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use skymirror::ClientConfig;
use skymirror_core::Entry;
use skymirror_core::KeyWatcher;
use skymirror_core::KvBucket;
use skymirror_core::KvError;
use skymirror_core::WatchOptions;
use skymirror_core::WatchStop;
use skymirror_transport::KvServer;
use skymirror_transport::KvServerConfig;

/// Upper bound for any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Window in which an update must not arrive.
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

pub fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|key| key.to_string()).collect()
}

/// Start a server on an ephemeral port serving the default `flights` bucket.
pub async fn start_server() -> KvServer {
    KvServer::start(KvServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..KvServerConfig::default()
    })
    .await
    .expect("server starts")
}

/// Client settings pointing both the leaf and the direct connection at `server`.
pub fn client_config(server: &KvServer) -> ClientConfig {
    ClientConfig {
        remote_url: server.url(),
        client_name: "integration-test".to_string(),
        connect_timeout_ms: 1_000,
        ..ClientConfig::default()
    }
}

/// A URL nothing listens on.
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("tcp://{addr}")
}

/// Poll `condition` until it holds or [`TEST_TIMEOUT`] elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Watch calls observed across every [`TrackedBucket`] sharing it.
#[derive(Default)]
pub struct WatchLedger {
    calls: AtomicUsize,
    fail_on: Option<usize>,
    opened: Mutex<Vec<WatchStop>>,
}

impl WatchLedger {
    /// A ledger whose `n`-th watch call (1-based) fails.
    pub fn failing_on(n: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_on: Some(n),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Stop handles of every subscription opened through the ledger.
    pub fn opened(&self) -> Vec<WatchStop> {
        self.opened.lock().clone()
    }

    pub fn all_stopped(&self) -> bool {
        self.opened.lock().iter().all(WatchStop::is_stopped)
    }
}

/// A bucket that records every watch it opens and can fail on demand.
pub struct TrackedBucket {
    inner: Arc<dyn KvBucket>,
    ledger: Arc<WatchLedger>,
}

impl TrackedBucket {
    pub fn new(inner: Arc<dyn KvBucket>, ledger: Arc<WatchLedger>) -> Arc<Self> {
        Arc::new(Self { inner, ledger })
    }
}

#[async_trait]
impl KvBucket for TrackedBucket {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, KvError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        self.inner.delete(key).await
    }

    async fn keys(&self, filter: &str) -> Result<Vec<String>, KvError> {
        self.inner.keys(filter).await
    }

    async fn watch(&self, pattern: &str, options: WatchOptions) -> Result<KeyWatcher, KvError> {
        let call = self.ledger.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.ledger.fail_on == Some(call) {
            return Err(KvError::failed(format!("injected watch failure on call {call}")));
        }
        let watcher = self.inner.watch(pattern, options).await?;
        self.ledger.opened.lock().push(watcher.stop_handle());
        Ok(watcher)
    }
}

/// A bucket whose reads always fail.
pub struct UnavailableBucket {
    name: String,
}

impl UnavailableBucket {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string() })
    }
}

#[async_trait]
impl KvBucket for UnavailableBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, _key: &str) -> Result<Option<Entry>, KvError> {
        Err(KvError::Closed)
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<u64, KvError> {
        Err(KvError::Closed)
    }

    async fn delete(&self, _key: &str) -> Result<u64, KvError> {
        Err(KvError::Closed)
    }

    async fn keys(&self, _filter: &str) -> Result<Vec<String>, KvError> {
        Err(KvError::Closed)
    }

    async fn watch(&self, _pattern: &str, _options: WatchOptions) -> Result<KeyWatcher, KvError> {
        Err(KvError::Closed)
    }
}
