//! Hidden services: named, load-balanced node groups reachable through
//! censorship-resistant backends.
//!
//! Concrete backends (I2P, DHT-based, ...) implement [`HiddenServiceBackend`];
//! the [`HiddenServiceMultiplexer`] races connects and merges host streams
//! across every registered backend.

pub mod circuit_breaker;
mod multiplexer;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::Result;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use multiplexer::{HiddenServiceMultiplexer, MultiplexerConfig};

/// Opaque logical service name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HiddenServiceName(String);

impl HiddenServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HiddenServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HiddenServiceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for HiddenServiceName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Any bidirectional async byte stream a backend can hand out.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Incoming connections for one hosted service, in arrival order.
pub type IncomingStream = BoxStream<'static, Result<Box<dyn ByteStream>>>;

/// How `connect` picks among backends.
///
/// Only a single-winner race exists today. Connecting to several target nodes
/// at once would be a new variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStrategy {
    #[default]
    FirstSuccess,
}

/// A connection-oriented transport that can reach and host hidden services.
#[async_trait]
pub trait HiddenServiceBackend: Send + Sync {
    /// Stable backend identifier (e.g. "i2p").
    fn id(&self) -> &str;

    /// Whether this backend currently advertises support for `name`.
    fn supports(&self, name: &HiddenServiceName) -> bool;

    /// Open a stream to some node serving `name`.
    ///
    /// Must stop promptly when the returned future is dropped.
    async fn connect(&self, name: &HiddenServiceName) -> Result<Box<dyn ByteStream>>;

    /// Start listening for `name`; the returned stream yields incoming
    /// connections until dropped.
    async fn host(&self, name: &HiddenServiceName) -> Result<IncomingStream>;
}

pub type DynHiddenServiceBackend = Arc<dyn HiddenServiceBackend>;

/// A bidirectional byte stream tagged with the backend that produced it.
///
/// Owned by whoever holds it; closing it does not affect the multiplexer.
pub struct Connection {
    backend: String,
    stream: Box<dyn ByteStream>,
}

impl Connection {
    pub fn new(backend: impl Into<String>, stream: Box<dyn ByteStream>) -> Self {
        Self {
            backend: backend.into(),
            stream,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Flush and shut down the write half.
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_shutdown(cx)
    }
}
