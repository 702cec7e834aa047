//! Capability traits connecting the replication model to its transport.
//!
//! A connected peer is represented by two handles: the high-level [`Peer`]
//! capability used for outbound index pushes and block requests, and the raw
//! [`Transport`] handle used to tear the connection down and to report the
//! remote address. Inbound traffic arrives through [`PeerEvents`], which the
//! model implements and the transport's reader task drives.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::FileInfo;

/// Failure modes of a block request, as seen on the wire.
#[derive(Error, Debug)]
pub enum RequestError {
    /// The requested name is not present in the serving replica's index.
    #[error("no such file")]
    NoSuchFile,

    /// The serving replica holds the file but cannot vouch for its content.
    #[error("file is invalid")]
    Invalid,

    /// The peer is not connected.
    #[error("peer not connected: {0}")]
    Disconnected(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transfer counters for a single peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub in_bytes_total: u64,
    pub out_bytes_total: u64,
    /// When the counters were sampled.
    pub at: DateTime<Utc>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            in_bytes_total: 0,
            out_bytes_total: 0,
            at: Utc::now(),
        }
    }
}

/// Connection statistics plus the transport's remote address, when it has one.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub statistics: Statistics,
    pub address: Option<SocketAddr>,
}

/// Outbound capability handle for a connected peer.
///
/// The transport behind this trait owns delta computation for index pushes:
/// the first `index` call after connect is sent as a full index message,
/// subsequent calls are diffed against what was last sent to that peer and go
/// out as index updates carrying only the records whose `(modified, version)`
/// changed. Send failures are not surfaced here; a broken transport reports
/// through [`PeerEvents::close`] instead.
#[async_trait]
pub trait Peer: Send + Sync {
    /// The remote replica's identifier.
    fn id(&self) -> &str;

    /// Announce the full local index to the peer.
    async fn index(&self, files: Vec<FileInfo>);

    /// Announce incremental changes to the local index.
    async fn index_update(&self, files: Vec<FileInfo>);

    /// Fetch a block of file content from the peer.
    async fn request(
        &self,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
    ) -> Result<Bytes, RequestError>;

    /// Sample the connection's transfer counters.
    fn statistics(&self) -> Statistics;
}

/// Raw byte-stream handle for a connected peer, kept for teardown.
pub trait Transport: Send + Sync {
    /// Close the underlying stream. Idempotent.
    fn close(&self);

    /// The remote end's socket address, if the transport is socket-backed.
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Inbound protocol callbacks, implemented by the replication model and
/// driven by each connection's reader task.
#[async_trait]
pub trait PeerEvents: Send + Sync {
    /// A full index announcement arrived from the peer.
    async fn index(&self, peer_id: &str, files: Vec<FileInfo>);

    /// An incremental index update arrived from the peer.
    async fn index_update(&self, peer_id: &str, files: Vec<FileInfo>);

    /// The peer asks for a span of file content.
    async fn request(
        &self,
        peer_id: &str,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
    ) -> Result<Bytes, RequestError>;

    /// The connection was torn down, by error or by orderly shutdown.
    async fn close(&self, peer_id: &str, err: Option<String>);
}
