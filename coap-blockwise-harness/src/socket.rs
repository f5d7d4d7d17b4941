//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::message::Message`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::message::{Message, MessageError};

/// Largest datagram we are prepared to read.  A 1024-byte block plus header
/// and options fits comfortably; anything larger is truncated by the OS.
const MAX_DATAGRAM: usize = 4096;

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The datagram could not be encoded or decoded as a CoAP message.
    #[error("message codec error: {0}")]
    Message(#[from] MessageError),
}

/// An async, message-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks if needed.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `127.0.0.1:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Encode `message` and send it as a single datagram to `dest`.
    pub async fn send_to(&self, message: &Message, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = message.encode()?;
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Message`].
    ///
    /// Returns `(message, sender_address)`.  Datagrams that fail to decode are
    /// returned as `Err`; the caller decides whether to retry.
    pub async fn recv_from(&self) -> Result<(Message, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let message = Message::decode(&buf[..n])?;
        Ok((message, addr))
    }
}
