//! Protocol frames exchanged between a remote client and the KV server.
//!
//! A connection starts with [`ClientFrame::Hello`], answered by
//! [`ServerFrame::HelloAck`] or [`ServerFrame::HelloRejected`]. After that the
//! client sends requests tagged with an id of its choosing and the server
//! answers each with a [`ServerFrame::Response`] echoing the id. A watch is
//! identified by the id of the request that opened it; its entries arrive as
//! [`ServerFrame::WatchEvent`] frames until [`ServerFrame::WatchEnded`].

use serde::Deserialize;
use serde::Serialize;
use skymirror_core::Entry;
use skymirror_core::KvError;
use skymirror_core::WatchOptions;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Hello {
        protocol_version: u8,
        client_name: String,
        /// Bearer token, required when the server is configured with one.
        token: Option<String>,
    },
    Request {
        id: u64,
        request: Request,
    },
    /// Stop a watch opened by an earlier request.
    Unwatch {
        watch_id: u64,
    },
}

/// Operations a client can request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Check that a bucket exists.
    Bind { bucket: String },
    Get { bucket: String, key: String },
    Put { bucket: String, key: String, value: Vec<u8> },
    Delete { bucket: String, key: String },
    Keys { bucket: String, filter: String },
    Watch {
        bucket: String,
        pattern: String,
        ignore_deletes: bool,
        updates_only: bool,
    },
    /// Publish a message on a subject to the server's subscribers.
    Publish { subject: String, payload: Vec<u8> },
}

impl Request {
    /// Short operation name for logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Bind { .. } => "bind",
            Request::Get { .. } => "get",
            Request::Put { .. } => "put",
            Request::Delete { .. } => "delete",
            Request::Keys { .. } => "keys",
            Request::Watch { .. } => "watch",
            Request::Publish { .. } => "publish",
        }
    }

    pub fn watch_options(ignore_deletes: bool, updates_only: bool) -> WatchOptions {
        WatchOptions {
            ignore_deletes,
            updates_only,
        }
    }
}

/// Successful replies, one variant per request kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Bound,
    Entry(Option<Entry>),
    Revision(u64),
    Keys(Vec<String>),
    Watching,
    Published,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    HelloAck {
        server_name: String,
    },
    HelloRejected {
        reason: String,
    },
    Response {
        id: u64,
        result: Result<Reply, KvError>,
    },
    WatchEvent {
        watch_id: u64,
        entry: Entry,
    },
    /// The watch is over; no more events will follow for this id.
    WatchEnded {
        watch_id: u64,
    },
}
