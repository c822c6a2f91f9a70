//! Line-framed miner connections.
//!
//! Stratum runs newline-delimited JSON over TCP. [`Connection`] frames the
//! socket with a length-limited [`LinesCodec`] so a miner cannot grow the read
//! buffer without bound, and so a read can be cancelled in a `select!` without
//! losing a partially received line. The [`Transport`] trait abstracts message
//! I/O, allowing channel-based mocks for session tests.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;
use crate::tracing::prelude::*;

/// Longest line accepted from a miner, in bytes.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Message-level I/O for the Stratum protocol.
#[async_trait]
pub trait Transport: Send {
    /// Read one complete JSON-RPC message.
    ///
    /// Returns `None` on clean connection close (EOF). A line that is not
    /// valid JSON-RPC yields [`StratumError::InvalidMessage`]; the framing is
    /// intact and the caller may keep reading.
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>>;

    /// Write a JSON-RPC message.
    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()>;
}

/// A miner's TCP connection.
pub struct Connection {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        loop {
            let line = match self.framed.next().await {
                Some(line) => line?,
                None => return Ok(None),
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            trace!(rx = %line, "Received message");

            let msg = serde_json::from_str(line).map_err(|e| {
                StratumError::InvalidMessage(format!("Failed to parse JSON: {}, line: {}", e, line))
            })?;

            return Ok(Some(msg));
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        let json = serde_json::to_string(msg)?;
        trace!(tx = %json, "Sending message");
        self.framed.send(json).await?;
        Ok(())
    }
}

/// Channel-based transport for deterministic testing.
///
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// session's side, the handle is the test's side (the miner).
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

/// Test-side handle for a [`MockTransport`].
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (session_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, session_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: session_rx,
            tx: session_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        match self.rx.recv().await {
            Some(line) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| StratumError::InvalidMessage(e.to_string())),
            None => Ok(None),
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Send a message to the session.
    pub fn send(&self, msg: JsonRpcMessage) {
        let line = serde_json::to_string(&msg).expect("serializable");
        self.tx.send(line).expect("transport dropped");
    }

    /// Send a raw line, valid JSON or not.
    pub fn send_raw(&self, line: &str) {
        self.tx.send(line.to_string()).expect("transport dropped");
    }

    /// Receive a message the session wrote.
    pub async fn recv(&mut self) -> JsonRpcMessage {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Receive a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<JsonRpcMessage> {
        self.rx.try_recv().ok()
    }
}
