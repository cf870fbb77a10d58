//! Remote bucket client.
//!
//! One [`RemoteConnection`] owns a TCP connection to a KV server and two
//! background tasks: a writer draining a single outbound queue, and a reader
//! routing responses to pending requests and watch events to watchers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;
use skymirror_core::Entry;
use skymirror_core::KeyWatcher;
use skymirror_core::KvBucket;
use skymirror_core::KvError;
use skymirror_core::WatchOptions;
use skymirror_core::WatchSender;
use skymirror_core::constants::KEY_WATCH_BUFFER;
use skymirror_core::validate_key;
use skymirror_core::validate_pattern;
use skymirror_core::watch::Delivery;
use skymirror_core::watch_channel;
use snafu::ResultExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::HANDSHAKE_TIMEOUT;
use crate::constants::MAX_FRAME_SIZE;
use crate::constants::MAX_PENDING_REQUESTS;
use crate::constants::MAX_WATCHES_PER_CONNECTION;
use crate::constants::OUTBOUND_QUEUE_SIZE;
use crate::constants::PROTOCOL_VERSION;
use crate::constants::REQUEST_TIMEOUT;
use crate::endpoint::RemoteEndpoint;
use crate::error::ConnectSnafu;
use crate::error::TransportError;
use crate::protocol::ClientFrame;
use crate::protocol::Reply;
use crate::protocol::Request;
use crate::protocol::ServerFrame;
use crate::wire::read_frame;
use crate::wire::write_frame;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Reply, KvError>>>;

/// A live connection to a remote KV server.
///
/// Cloning shares the connection.
#[derive(Clone)]
pub struct RemoteConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    address: String,
    server_name: String,
    next_id: AtomicU64,
    outbound: mpsc::Sender<ClientFrame>,
    pending: Mutex<PendingMap>,
    watchers: Mutex<HashMap<u64, WatchSender>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    closed: AtomicBool,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("address", &self.inner.address)
            .field("server_name", &self.inner.server_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RemoteConnection {
    /// Dial the endpoint, perform the handshake and start the I/O tasks.
    pub async fn connect(endpoint: &RemoteEndpoint) -> Result<Self, TransportError> {
        let address = endpoint.address()?;
        let stream = match tokio::time::timeout(endpoint.connect_timeout, TcpStream::connect(&address)).await {
            Ok(result) => result.context(ConnectSnafu { address: address.clone() })?,
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    address,
                    timeout_ms: endpoint.connect_timeout.as_millis() as u64,
                });
            }
        };
        // Small request frames; latency matters more than batching.
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        let hello = ClientFrame::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_name: endpoint.client_name.clone(),
            token: endpoint.credentials.as_ref().map(|c| c.token().to_string()),
        };
        let server_name = match tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            write_frame(&mut write_half, &hello, MAX_FRAME_SIZE).await?;
            read_frame::<ServerFrame, _>(&mut read_half, MAX_FRAME_SIZE).await
        })
        .await
        {
            Err(_) => return Err(TransportError::HandshakeTimeout),
            Ok(Err(err)) => return Err(err),
            Ok(Ok(ServerFrame::HelloAck { server_name })) => server_name,
            Ok(Ok(ServerFrame::HelloRejected { reason })) => return Err(TransportError::Rejected { reason }),
            Ok(Ok(other)) => {
                return Err(TransportError::UnexpectedFrame {
                    context: format!("expected hello ack, got {other:?}"),
                });
            }
        };

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let inner = Arc::new(ConnectionInner {
            address: address.clone(),
            server_name,
            next_id: AtomicU64::new(1),
            outbound,
            pending: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            closed: AtomicBool::new(false),
        });

        inner.tasks.spawn(run_writer(inner.clone(), write_half, outbound_rx));
        inner.tasks.spawn(run_reader(inner.clone(), read_half));

        info!(address = %address, server = %inner.server_name, "connected to remote store");
        Ok(Self { inner })
    }

    /// Server name announced in the handshake.
    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Number of remote watches still delivering events.
    pub fn active_watches(&self) -> usize {
        self.inner.watchers.lock().len()
    }

    /// Whether the connection has been closed locally or lost.
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Bind a named bucket on the server.
    pub async fn bucket(&self, name: &str) -> Result<RemoteBucket, KvError> {
        match self.request(Request::Bind { bucket: name.to_string() }).await? {
            Reply::Bound => {
                debug!(bucket = name, "bound remote bucket");
                Ok(RemoteBucket {
                    connection: self.clone(),
                    name: name.to_string(),
                })
            }
            other => Err(unexpected_reply("bind", &other)),
        }
    }

    /// Publish a message on a subject and wait for the server to accept it.
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), KvError> {
        validate_key(subject)?;
        match self.request(Request::Publish {
            subject: subject.to_string(),
            payload,
        })
        .await?
        {
            Reply::Published => Ok(()),
            other => Err(unexpected_reply("publish", &other)),
        }
    }

    /// Close the connection, failing every pending request with `Closed`.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(address = %self.inner.address, "closing remote connection");
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.fail_all();
    }

    async fn request(&self, request: Request) -> Result<Reply, KvError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(KvError::Closed);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = inner.pending.lock();
            if pending.len() >= MAX_PENDING_REQUESTS {
                return Err(KvError::failed(format!("too many pending requests ({MAX_PENDING_REQUESTS})")));
            }
            pending.insert(id, tx);
        }

        let result = self.exchange(id, request, rx).await;
        inner.pending.lock().remove(&id);
        result
    }

    async fn exchange(
        &self,
        id: u64,
        request: Request,
        rx: oneshot::Receiver<Result<Reply, KvError>>,
    ) -> Result<Reply, KvError> {
        let inner = &self.inner;
        let op = request.op_name();
        if inner.outbound.send(ClientFrame::Request { id, request }).await.is_err() {
            return Err(KvError::Closed);
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => Err(KvError::Closed),
            response = tokio::time::timeout(REQUEST_TIMEOUT, rx) => match response {
                Err(_) => {
                    warn!(id, op, "remote request timed out");
                    Err(KvError::Timeout {
                        duration_ms: REQUEST_TIMEOUT.as_millis() as u64,
                    })
                }
                Ok(Err(_)) => Err(KvError::Closed),
                Ok(Ok(result)) => result,
            },
        }
    }

    async fn watch(&self, bucket: &str, pattern: &str, options: WatchOptions) -> Result<KeyWatcher, KvError> {
        validate_pattern(pattern)?;
        let inner = &self.inner;
        let (sender, watcher) = watch_channel(pattern, KEY_WATCH_BUFFER);

        // Registered before the request goes out so no event can race the reply.
        let watch_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut watchers = inner.watchers.lock();
            if watchers.len() >= MAX_WATCHES_PER_CONNECTION {
                return Err(KvError::failed(format!("too many watches ({MAX_WATCHES_PER_CONNECTION})")));
            }
            watchers.insert(watch_id, sender);
        }

        let (tx, rx) = oneshot::channel();
        inner.pending.lock().insert(watch_id, tx);
        let request = Request::Watch {
            bucket: bucket.to_string(),
            pattern: pattern.to_string(),
            ignore_deletes: options.ignore_deletes,
            updates_only: options.updates_only,
        };
        let result = self.exchange(watch_id, request, rx).await;
        inner.pending.lock().remove(&watch_id);

        match result {
            Ok(Reply::Watching) => {}
            Ok(other) => {
                inner.watchers.lock().remove(&watch_id);
                return Err(unexpected_reply("watch", &other));
            }
            Err(err) => {
                inner.watchers.lock().remove(&watch_id);
                return Err(err);
            }
        }

        // Tell the server when the local watcher goes away.
        let stop = watcher.stop_handle();
        let task_inner = inner.clone();
        inner.tasks.spawn(async move {
            tokio::select! {
                _ = task_inner.cancel.cancelled() => {}
                _ = stop.stopped() => {
                    task_inner.watchers.lock().remove(&watch_id);
                    let _ = task_inner.outbound.send(ClientFrame::Unwatch { watch_id }).await;
                }
            }
        });

        debug!(bucket, pattern, watch_id, "remote watch opened");
        Ok(watcher)
    }
}

impl ConnectionInner {
    /// Drop every pending request and watcher. Pending callers see `Closed`,
    /// watchers see the end of their stream.
    fn fail_all(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(KvError::Closed));
        }
        self.watchers.lock().clear();
    }

    fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Response { id, result } => {
                if let Some(tx) = self.pending.lock().remove(&id) {
                    let _ = tx.send(result);
                } else {
                    debug!(id, "response for unknown or abandoned request");
                }
            }
            ServerFrame::WatchEvent { watch_id, entry } => {
                let mut watchers = self.watchers.lock();
                let Some(sender) = watchers.get(&watch_id) else {
                    return;
                };
                match sender.try_send(entry) {
                    Delivery::Sent => {}
                    Delivery::Full => {
                        // Dropping the sender ends the stream once the watcher drains its buffer.
                        watchers.remove(&watch_id);
                        warn!(watch_id, address = %self.address, "watch consumer fell behind, ending watch");
                        if self.outbound.try_send(ClientFrame::Unwatch { watch_id }).is_err() {
                            debug!(watch_id, "outbound queue unavailable, server keeps an orphaned watch");
                        }
                    }
                    Delivery::Closed => {
                        watchers.remove(&watch_id);
                    }
                }
            }
            ServerFrame::WatchEnded { watch_id } => {
                debug!(watch_id, "remote watch ended");
                self.watchers.lock().remove(&watch_id);
            }
            ServerFrame::HelloAck { .. } | ServerFrame::HelloRejected { .. } => {
                warn!(address = %self.address, "ignoring handshake frame on established connection");
            }
        }
    }
}

async fn run_writer(
    inner: Arc<ConnectionInner>,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<ClientFrame>,
) {
    loop {
        let frame = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = write_frame(&mut write_half, &frame, MAX_FRAME_SIZE).await {
            warn!(address = %inner.address, error = %err, "remote write failed, closing connection");
            break;
        }
    }
    inner.cancel.cancel();
}

async fn run_reader(inner: Arc<ConnectionInner>, mut read_half: OwnedReadHalf) {
    loop {
        let frame = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            frame = read_frame::<ServerFrame, _>(&mut read_half, MAX_FRAME_SIZE) => frame,
        };
        match frame {
            Ok(frame) => inner.dispatch(frame),
            Err(err) => {
                if !inner.cancel.is_cancelled() {
                    warn!(address = %inner.address, error = %err, "remote connection lost");
                }
                break;
            }
        }
    }
    inner.cancel.cancel();
    inner.fail_all();
}

fn unexpected_reply(op: &str, reply: &Reply) -> KvError {
    KvError::failed(format!("unexpected reply to {op}: {reply:?}"))
}

/// A bucket on a remote server, reached over a shared [`RemoteConnection`].
#[derive(Debug, Clone)]
pub struct RemoteBucket {
    connection: RemoteConnection,
    name: String,
}

impl RemoteBucket {
    pub fn connection(&self) -> &RemoteConnection {
        &self.connection
    }
}

#[async_trait]
impl KvBucket for RemoteBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, KvError> {
        validate_key(key)?;
        let request = Request::Get {
            bucket: self.name.clone(),
            key: key.to_string(),
        };
        match self.connection.request(request).await? {
            Reply::Entry(entry) => Ok(entry),
            other => Err(unexpected_reply("get", &other)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        validate_key(key)?;
        let request = Request::Put {
            bucket: self.name.clone(),
            key: key.to_string(),
            value,
        };
        match self.connection.request(request).await? {
            Reply::Revision(revision) => Ok(revision),
            other => Err(unexpected_reply("put", &other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        validate_key(key)?;
        let request = Request::Delete {
            bucket: self.name.clone(),
            key: key.to_string(),
        };
        match self.connection.request(request).await? {
            Reply::Revision(revision) => Ok(revision),
            other => Err(unexpected_reply("delete", &other)),
        }
    }

    async fn keys(&self, filter: &str) -> Result<Vec<String>, KvError> {
        validate_pattern(filter)?;
        let request = Request::Keys {
            bucket: self.name.clone(),
            filter: filter.to_string(),
        };
        match self.connection.request(request).await? {
            Reply::Keys(keys) => Ok(keys),
            other => Err(unexpected_reply("keys", &other)),
        }
    }

    async fn watch(&self, pattern: &str, options: WatchOptions) -> Result<KeyWatcher, KvError> {
        self.connection.watch(&self.name, pattern, options).await
    }
}
