//! Network KV server hosting memory buckets.
//!
//! Serves the wire protocol over TCP: bucket operations, watches forwarded as
//! push frames, and a publish primitive fanned out to in-process subscribers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use skymirror_core::KeyWatcher;
use skymirror_core::KvBucket;
use skymirror_core::KvError;
use skymirror_core::validate_key;
use skymirror_memory::MemoryBucket;
use snafu::ResultExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Semaphore;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::HANDSHAKE_TIMEOUT;
use crate::constants::MAX_CLIENT_NAME_SIZE;
use crate::constants::MAX_FRAME_SIZE;
use crate::constants::MAX_SERVER_CONNECTIONS;
use crate::constants::MAX_WATCHES_PER_CONNECTION;
use crate::constants::OUTBOUND_QUEUE_SIZE;
use crate::constants::PROTOCOL_VERSION;
use crate::constants::PUBLISH_BROADCAST_BUFFER;
use crate::error::ListenSnafu;
use crate::error::TransportError;
use crate::protocol::ClientFrame;
use crate::protocol::Reply;
use crate::protocol::Request;
use crate::protocol::ServerFrame;
use crate::wire::read_frame;
use crate::wire::write_frame;

/// Settings for a [`KvServer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvServerConfig {
    /// Socket address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Name announced to clients in the hello ack.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Buckets created at startup.
    #[serde(default = "default_buckets")]
    pub buckets: Vec<String>,

    /// Shared bearer token. When set, clients must present it.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for KvServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            server_name: default_server_name(),
            buckets: default_buckets(),
            token: None,
            max_connections: default_max_connections(),
        }
    }
}

pub fn default_listen_addr() -> String {
    "127.0.0.1:4222".to_string()
}

pub fn default_server_name() -> String {
    "skymirror-server".to_string()
}

pub fn default_buckets() -> Vec<String> {
    vec!["flights".to_string()]
}

pub fn default_max_connections() -> usize {
    MAX_SERVER_CONNECTIONS
}

/// A message received through the publish primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Name the publishing client announced in its hello.
    pub client_name: String,
}

/// Running KV server.
pub struct KvServer {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
}

struct ServerInner {
    name: String,
    token: Option<String>,
    buckets: RwLock<HashMap<String, Arc<MemoryBucket>>>,
    published: broadcast::Sender<PublishedMessage>,
    connection_semaphore: Arc<Semaphore>,
    max_connections: usize,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for KvServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvServer")
            .field("name", &self.inner.name)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl KvServer {
    /// Bind the listener, create the configured buckets and start accepting.
    pub async fn start(config: KvServerConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(&config.listen_addr).await.context(ListenSnafu {
            address: config.listen_addr.clone(),
        })?;
        let local_addr = listener.local_addr().context(ListenSnafu {
            address: config.listen_addr.clone(),
        })?;

        let max_connections = config.max_connections.clamp(1, MAX_SERVER_CONNECTIONS);
        let (published, _) = broadcast::channel(PUBLISH_BROADCAST_BUFFER);
        let buckets = config
            .buckets
            .iter()
            .map(|name| (name.clone(), Arc::new(MemoryBucket::new(name.clone()))))
            .collect();

        let inner = Arc::new(ServerInner {
            name: config.server_name,
            token: config.token,
            buckets: RwLock::new(buckets),
            published,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        inner.tasks.spawn(run_accept_loop(inner.clone(), listener));
        info!(
            address = %local_addr,
            buckets = ?config.buckets,
            max_connections,
            auth = inner.token.is_some(),
            "kv server listening"
        );
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL clients can dial.
    pub fn url(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    /// Hosted bucket by name.
    pub fn bucket(&self, name: &str) -> Option<Arc<MemoryBucket>> {
        self.inner.buckets.read().get(name).cloned()
    }

    /// Return the named bucket, creating it if absent.
    pub fn create_bucket(&self, name: &str) -> Arc<MemoryBucket> {
        self.inner
            .buckets
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBucket::new(name)))
            .clone()
    }

    /// Receive every message published by clients from now on.
    pub fn subscribe_published(&self) -> broadcast::Receiver<PublishedMessage> {
        self.inner.published.subscribe()
    }

    /// Number of client connections currently held open.
    pub fn connection_count(&self) -> usize {
        self.inner.max_connections - self.inner.connection_semaphore.available_permits()
    }

    /// Stop accepting, close every connection and wait for their tasks.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(address = %self.local_addr, "shutting down kv server");
        }
        self.inner.cancel.cancel();
        self.inner.connection_semaphore.close();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

impl ServerInner {
    fn bucket(&self, name: &str) -> Result<Arc<MemoryBucket>, KvError> {
        self.buckets.read().get(name).cloned().ok_or_else(|| KvError::BucketNotFound {
            bucket: name.to_string(),
        })
    }

    async fn handle_request(&self, request: Request, client_name: &str) -> Result<Reply, KvError> {
        match request {
            Request::Bind { bucket } => self.bucket(&bucket).map(|_| Reply::Bound),
            Request::Get { bucket, key } => Ok(Reply::Entry(self.bucket(&bucket)?.get(&key).await?)),
            Request::Put { bucket, key, value } => Ok(Reply::Revision(self.bucket(&bucket)?.put(&key, value).await?)),
            Request::Delete { bucket, key } => Ok(Reply::Revision(self.bucket(&bucket)?.delete(&key).await?)),
            Request::Keys { bucket, filter } => Ok(Reply::Keys(self.bucket(&bucket)?.keys(&filter).await?)),
            Request::Publish { subject, payload } => {
                validate_key(&subject)?;
                debug!(subject = %subject, client = client_name, bytes = payload.len(), "message published");
                // No subscribers is not an error for a fire-and-forget publish.
                let _ = self.published.send(PublishedMessage {
                    subject,
                    payload,
                    client_name: client_name.to_string(),
                });
                Ok(Reply::Published)
            }
            Request::Watch { .. } => Err(KvError::failed("watch requests are handled by the connection")),
        }
    }

    async fn open_watch(&self, request: &Request) -> Result<KeyWatcher, KvError> {
        match request {
            Request::Watch {
                bucket,
                pattern,
                ignore_deletes,
                updates_only,
            } => {
                let options = Request::watch_options(*ignore_deletes, *updates_only);
                self.bucket(bucket)?.watch(pattern, options).await
            }
            other => Err(KvError::failed(format!("not a watch request: {}", other.op_name()))),
        }
    }
}

async fn run_accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                debug!("kv server accept loop stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "failed to accept connection");
                        continue;
                    }
                };

                // Tiger Style: fixed limit on concurrent connections
                let permit = match inner.connection_semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(
                            peer = %peer,
                            max_connections = inner.max_connections,
                            "connection limit reached, rejecting connection"
                        );
                        continue;
                    }
                };

                let conn_inner = inner.clone();
                inner.tasks.spawn(async move {
                    let _permit = permit;
                    if let Err(err) = handle_connection(conn_inner, stream, peer).await {
                        debug!(peer = %peer, error = %err, "connection ended with error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(inner: Arc<ServerInner>, stream: TcpStream, peer: SocketAddr) -> Result<(), TransportError> {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let handshake = read_frame::<ClientFrame, _>(&mut read_half, MAX_FRAME_SIZE);
    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Err(_) => return Err(TransportError::HandshakeTimeout),
        Ok(result) => result?,
    };
    let client_name = match check_hello(&inner, hello) {
        Ok(client_name) => client_name,
        Err(reason) => {
            warn!(peer = %peer, reason = %reason, "rejecting client");
            let rejected = ServerFrame::HelloRejected { reason: reason.clone() };
            write_frame(&mut write_half, &rejected, MAX_FRAME_SIZE).await?;
            return Err(TransportError::Rejected { reason });
        }
    };
    write_frame(
        &mut write_half,
        &ServerFrame::HelloAck {
            server_name: inner.name.clone(),
        },
        MAX_FRAME_SIZE,
    )
    .await?;
    info!(peer = %peer, client = %client_name, "client connected");

    let conn_cancel = inner.cancel.child_token();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
    inner.tasks.spawn(run_connection_writer(conn_cancel.clone(), write_half, outbound_rx));

    let mut watches: HashMap<u64, CancellationToken> = HashMap::new();
    let result = loop {
        let frame = tokio::select! {
            _ = conn_cancel.cancelled() => break Ok(()),
            frame = read_frame::<ClientFrame, _>(&mut read_half, MAX_FRAME_SIZE) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(TransportError::FrameIo { source }) if source.kind() == std::io::ErrorKind::UnexpectedEof => {
                break Ok(());
            }
            Err(err) => break Err(err),
        };

        match frame {
            ClientFrame::Request {
                id,
                request: request @ Request::Watch { .. },
            } => {
                watches.retain(|_, token| !token.is_cancelled());
                let opened = if watches.len() >= MAX_WATCHES_PER_CONNECTION {
                    Err(KvError::failed(format!("too many watches ({MAX_WATCHES_PER_CONNECTION})")))
                } else {
                    inner.open_watch(&request).await
                };
                match opened {
                    Ok(watcher) => {
                        let token = conn_cancel.child_token();
                        if outbound.send(ServerFrame::Response { id, result: Ok(Reply::Watching) }).await.is_err() {
                            break Ok(());
                        }
                        inner.tasks.spawn(forward_watch(id, watcher, token.clone(), outbound.clone()));
                        watches.insert(id, token);
                    }
                    Err(err) => {
                        if outbound.send(ServerFrame::Response { id, result: Err(err) }).await.is_err() {
                            break Ok(());
                        }
                    }
                }
            }
            ClientFrame::Request { id, request } => {
                let result = inner.handle_request(request, &client_name).await;
                if outbound.send(ServerFrame::Response { id, result }).await.is_err() {
                    break Ok(());
                }
            }
            ClientFrame::Unwatch { watch_id } => {
                if let Some(token) = watches.remove(&watch_id) {
                    token.cancel();
                }
            }
            ClientFrame::Hello { .. } => {
                warn!(peer = %peer, "ignoring repeated hello");
            }
        }
    };

    conn_cancel.cancel();
    info!(peer = %peer, client = %client_name, open_watches = watches.len(), "client disconnected");
    result
}

/// Validate a hello, returning the client name or the rejection reason.
fn check_hello(inner: &ServerInner, hello: ClientFrame) -> Result<String, String> {
    let ClientFrame::Hello {
        protocol_version,
        client_name,
        token,
    } = hello
    else {
        return Err("expected hello".to_string());
    };
    if protocol_version != PROTOCOL_VERSION {
        return Err(format!("unsupported protocol version {protocol_version}, expected {PROTOCOL_VERSION}"));
    }
    if client_name.len() > MAX_CLIENT_NAME_SIZE {
        return Err(format!("client name exceeds {MAX_CLIENT_NAME_SIZE} bytes"));
    }
    if let Some(expected) = &inner.token {
        if token.as_deref() != Some(expected.as_str()) {
            return Err("invalid or missing token".to_string());
        }
    }
    Ok(client_name)
}

async fn run_connection_writer(
    cancel: CancellationToken,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<ServerFrame>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = write_frame(&mut write_half, &frame, MAX_FRAME_SIZE).await {
            debug!(error = %err, "connection write failed");
            break;
        }
    }
    cancel.cancel();
}

/// Push a bucket watch to the client until it is cancelled or ends.
async fn forward_watch(
    watch_id: u64,
    mut watcher: KeyWatcher,
    cancel: CancellationToken,
    outbound: mpsc::Sender<ServerFrame>,
) {
    loop {
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entry = watcher.recv() => entry,
        };
        let frame = match entry {
            Some(entry) => ServerFrame::WatchEvent { watch_id, entry },
            None => ServerFrame::WatchEnded { watch_id },
        };
        let ended = matches!(frame, ServerFrame::WatchEnded { .. });
        let sent = tokio::select! {
            _ = cancel.cancelled() => false,
            sent = outbound.send(frame) => sent.is_ok(),
        };
        if ended || !sent {
            break;
        }
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use skymirror_core::Entry;
    use skymirror_core::WatchOptions;
    use skymirror_core::constants::KEY_WATCH_BUFFER;

    use super::*;
    use crate::client::RemoteConnection;
    use crate::credentials::Credentials;
    use crate::endpoint::RemoteEndpoint;

    const WAIT: Duration = Duration::from_secs(5);

    fn local_config() -> KvServerConfig {
        KvServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..KvServerConfig::default()
        }
    }

    async fn next(watcher: &mut KeyWatcher) -> Option<Entry> {
        tokio::time::timeout(WAIT, watcher.recv()).await.expect("timed out waiting for watch")
    }

    #[tokio::test]
    async fn remote_bucket_operations() {
        let server = KvServer::start(local_config()).await.unwrap();
        let conn = RemoteConnection::connect(&RemoteEndpoint::new(server.url())).await.unwrap();
        assert_eq!(conn.server_name(), "skymirror-server");

        let bucket = conn.bucket("flights").await.unwrap();
        let revision = bucket.put("users.1.flights.owned.NZ500", b"on time".to_vec()).await.unwrap();
        let entry = bucket.get("users.1.flights.owned.NZ500").await.unwrap().unwrap();
        assert_eq!(entry.revision, revision);
        assert_eq!(entry.value, b"on time");

        assert_eq!(bucket.keys("users.1.>").await.unwrap(), vec!["users.1.flights.owned.NZ500".to_string()]);
        bucket.delete("users.1.flights.owned.NZ500").await.unwrap();
        assert!(bucket.get("users.1.flights.owned.NZ500").await.unwrap().is_none());

        // Server-side bucket sees the same data.
        assert!(server.bucket("flights").unwrap().is_empty());

        conn.close().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn binding_unknown_bucket_fails() {
        let server = KvServer::start(local_config()).await.unwrap();
        let conn = RemoteConnection::connect(&RemoteEndpoint::new(server.url())).await.unwrap();
        let err = conn.bucket("nope").await.unwrap_err();
        assert_eq!(err, KvError::BucketNotFound {
            bucket: "nope".to_string()
        });
        conn.close().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn token_is_enforced() {
        let server = KvServer::start(KvServerConfig {
            token: Some("s3cret".to_string()),
            ..local_config()
        })
        .await
        .unwrap();

        let anonymous = RemoteConnection::connect(&RemoteEndpoint::new(server.url())).await;
        assert!(matches!(anonymous, Err(TransportError::Rejected { .. })));

        let creds = Credentials::from_bytes(b"s3cret\n").unwrap();
        let endpoint = RemoteEndpoint::new(server.url()).with_credentials(Some(creds));
        let conn = RemoteConnection::connect(&endpoint).await.unwrap();
        conn.bucket("flights").await.unwrap();
        conn.close().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn remote_watch_sees_server_writes() {
        let server = KvServer::start(local_config()).await.unwrap();
        let hosted = server.bucket("flights").unwrap();
        hosted.put("flights.A", b"1".to_vec()).await.unwrap();

        let conn = RemoteConnection::connect(&RemoteEndpoint::new(server.url())).await.unwrap();
        let bucket = conn.bucket("flights").await.unwrap();
        let mut watcher = bucket.watch("flights.>", WatchOptions::ignoring_deletes()).await.unwrap();

        assert_eq!(next(&mut watcher).await.unwrap().key, "flights.A");
        hosted.delete("flights.A").await.unwrap();
        hosted.put("flights.B", b"2".to_vec()).await.unwrap();
        let entry = next(&mut watcher).await.unwrap();
        assert_eq!(entry.key, "flights.B");
        assert!(!entry.is_delete());

        watcher.stop();
        conn.close().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let server = KvServer::start(local_config()).await.unwrap();
        let mut published = server.subscribe_published();
        let conn = RemoteConnection::connect(&RemoteEndpoint::new(server.url()).with_client_name("node-7"))
            .await
            .unwrap();

        conn.publish("api.flightaware.fetch.NZ500", Vec::new()).await.unwrap();
        let message = tokio::time::timeout(WAIT, published.recv()).await.unwrap().unwrap();
        assert_eq!(message.subject, "api.flightaware.fetch.NZ500");
        assert_eq!(message.client_name, "node-7");
        assert!(message.payload.is_empty());

        assert!(conn.publish("api.*", Vec::new()).await.is_err());
        conn.close().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn close_fails_later_requests() {
        let server = KvServer::start(local_config()).await.unwrap();
        let conn = RemoteConnection::connect(&RemoteEndpoint::new(server.url())).await.unwrap();
        let bucket = conn.bucket("flights").await.unwrap();
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert_eq!(bucket.get("flights.A").await, Err(KvError::Closed));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn stalled_watch_consumer_ends_the_watch() {
        let server = KvServer::start(local_config()).await.unwrap();
        let hosted = server.bucket("flights").unwrap();
        let conn = RemoteConnection::connect(&RemoteEndpoint::new(server.url())).await.unwrap();
        let bucket = conn.bucket("flights").await.unwrap();
        let mut watcher = bucket.watch("flights.>", WatchOptions::default()).await.unwrap();
        assert_eq!(conn.active_watches(), 1);

        let written = KEY_WATCH_BUFFER * 2;
        for i in 0..written {
            hosted.put(&format!("flights.F{i}"), b"1".to_vec()).await.unwrap();
        }
        tokio::time::timeout(WAIT, async {
            while conn.active_watches() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("watch was never ended");

        // Buffered events are still delivered, then the stream ends instead of skipping writes.
        let mut drained = 0;
        while next(&mut watcher).await.is_some() {
            drained += 1;
        }
        assert!(drained > 0);
        assert!(drained < written);

        // The connection stays usable for a fresh watch.
        let mut again = bucket.watch("flights.F0", WatchOptions::default()).await.unwrap();
        assert_eq!(next(&mut again).await.unwrap().key, "flights.F0");

        again.stop();
        conn.close().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn server_shutdown_ends_remote_watch() {
        let server = KvServer::start(local_config()).await.unwrap();
        let conn = RemoteConnection::connect(&RemoteEndpoint::new(server.url())).await.unwrap();
        let mut watcher = conn.bucket("flights").await.unwrap().watch(">", WatchOptions::default()).await.unwrap();
        server.shutdown().await;
        assert!(next(&mut watcher).await.is_none());
        conn.close().await;
    }

    #[tokio::test]
    async fn connection_limit_rejects_extra_clients() {
        let server = KvServer::start(KvServerConfig {
            max_connections: 1,
            ..local_config()
        })
        .await
        .unwrap();
        let first = RemoteConnection::connect(&RemoteEndpoint::new(server.url())).await.unwrap();
        let second = RemoteConnection::connect(&RemoteEndpoint::new(server.url())).await;
        assert!(second.is_err());
        assert_eq!(server.connection_count(), 1);
        first.close().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_server_fails_fast() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        let endpoint = RemoteEndpoint::new(format!("tcp://{address}")).with_connect_timeout(Duration::from_secs(1));
        let result = RemoteConnection::connect(&endpoint).await;
        assert!(matches!(
            result,
            Err(TransportError::Connect { .. } | TransportError::ConnectTimeout { .. })
        ));
    }
}
