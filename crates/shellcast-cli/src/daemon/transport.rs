//! Framed transport abstraction shared by drivers and observers.
//!
//! A [`Transport`] is split into a [`FrameSink`] (data, ping and close frames
//! out) and a [`FrameSource`] (data and pong frames in). The relay only talks
//! to these traits, so the WebSocket front door and the in-memory test
//! transport are interchangeable.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Transport faults. Always fatal to the affected connection only.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    Oversized { size: usize, limit: usize },

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A frame read from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Input for the process (text and binary frames alike).
    Data(Vec<u8>),
    /// Liveness reply to one of our pings.
    Pong,
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one binary data frame.
    async fn send_data(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Send a keepalive ping.
    async fn send_ping(&mut self) -> TransportResult<()>;

    /// Send a normal-closure control frame with a reason.
    async fn send_close(&mut self, reason: &str) -> TransportResult<()>;

    /// Close the underlying connection. Errors are not interesting here.
    async fn shutdown(&mut self);
}

/// Inbound half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame from the peer, `Ok(None)` once the peer closed cleanly.
    async fn recv(&mut self) -> TransportResult<Option<Inbound>>;
}

/// An accepted connection, not yet owned by a session.
pub struct Transport {
    peer: String,
    sink: Box<dyn FrameSink>,
    source: Box<dyn FrameSource>,
}

impl Transport {
    pub fn new(
        peer: impl Into<String>,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
    ) -> Self {
        Self {
            peer: peer.into(),
            sink,
            source,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_parts(self) -> (String, Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (self.peer, self.sink, self.source)
    }

    /// Keep only the outbound half. Observers never send input.
    pub fn into_observer(self) -> Observer {
        Observer {
            peer: self.peer,
            sink: self.sink,
        }
    }

    /// Close without ever handing the connection to a session.
    pub async fn reject(self, reason: &str, deadline: Duration) {
        let mut sink = self.sink;
        if let Err(e) = with_deadline(deadline, sink.send_close(reason)).await {
            debug!("Failed to send close to {}: {}", self.peer, e);
        }
        sink.shutdown().await;
    }
}

/// A read-only viewer of a session's output.
pub struct Observer {
    peer: String,
    sink: Box<dyn FrameSink>,
}

impl Observer {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, data: &[u8], deadline: Duration) -> TransportResult<()> {
        with_deadline(deadline, self.sink.send_data(data)).await
    }

    pub async fn close(mut self) {
        self.sink.shutdown().await;
    }
}

/// Run a transport operation, failing with [`TransportError::TimedOut`] at the deadline.
pub async fn with_deadline<T, F>(deadline: Duration, op: F) -> TransportResult<T>
where
    F: Future<Output = TransportResult<T>>,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::TimedOut(deadline)),
    }
}
