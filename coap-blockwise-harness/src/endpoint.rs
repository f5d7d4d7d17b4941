//! Connection-tracking server endpoint.
//!
//! UDP has no connections, so a [`TransportEndpoint`] makes one up: the first
//! datagram after a bind or a [`reset`](TransportEndpoint::reset) *accepts*
//! its sender as the peer, and every later operation talks to that peer only.
//! A client that rebinds to a fresh ephemeral port therefore shows up as a new
//! [`ConnectionHandle`], which is exactly what the reconnect scenarios assert.
//!
//! ```text
//!   accept(timeout) ──▶ peer = sender of first datagram (datagram queued)
//!   receive(timeout) ─▶ queued datagram, else next datagram from peer
//!   send(req, resp) ──▶ resp correlated with req, sent to peer
//!   reset() ──────────▶ peer forgotten, queue cleared, socket kept
//! ```

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::{HarnessError, Result};
use crate::message::{Message, MessageType};
use crate::socket::{Socket, SocketError};

/// Identity of the remote side of the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub remote_address: IpAddr,
    pub remote_port: u16,
}

impl ConnectionHandle {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.remote_port)
    }
}

impl From<SocketAddr> for ConnectionHandle {
    fn from(addr: SocketAddr) -> Self {
        Self {
            remote_address: addr.ip(),
            remote_port: addr.port(),
        }
    }
}

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Security mode of an endpoint.
///
/// The PSK record layer itself is handled outside this crate; here the mode
/// only decides the URI scheme and which credentials the client is handed.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    NoSec,
    PreSharedKey { identity: Vec<u8>, key: Vec<u8> },
}

impl Security {
    pub fn psk(identity: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Security::PreSharedKey {
            identity: identity.into(),
            key: key.into(),
        }
    }

    pub fn is_secured(&self) -> bool {
        matches!(self, Security::PreSharedKey { .. })
    }

    pub fn scheme(&self) -> &'static str {
        if self.is_secured() {
            "coaps"
        } else {
            "coap"
        }
    }

    /// `(identity, key)` for the PSK mode.
    pub fn credentials(&self) -> Option<(&[u8], &[u8])> {
        match self {
            Security::NoSec => None,
            Security::PreSharedKey { identity, key } => Some((identity.as_slice(), key.as_slice())),
        }
    }
}

impl std::fmt::Debug for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Security::NoSec => write!(f, "NoSec"),
            Security::PreSharedKey { identity, .. } => f
                .debug_struct("PreSharedKey")
                .field("identity", &String::from_utf8_lossy(identity))
                .field("key", &"<redacted>")
                .finish(),
        }
    }
}

/// One listening socket plus the peer it is currently talking to.
#[derive(Debug)]
pub struct TransportEndpoint {
    socket: Socket,
    security: Security,
    peer: Option<ConnectionHandle>,
    /// Datagrams already read from the socket but not yet handed out.
    pending: VecDeque<Message>,
    next_message_id: u16,
}

impl TransportEndpoint {
    pub async fn bind(addr: SocketAddr, security: Security) -> Result<Self> {
        let socket = Socket::bind(addr).await?;
        log::debug!(
            "[endpoint] bound {} ({})",
            socket.local_addr,
            security.scheme()
        );
        Ok(Self {
            socket,
            security,
            peer: None,
            pending: VecDeque::new(),
            next_message_id: rand::random(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    pub fn is_secured(&self) -> bool {
        self.security.is_secured()
    }

    pub fn scheme(&self) -> &'static str {
        self.security.scheme()
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    pub fn remote_handle(&self) -> Result<ConnectionHandle> {
        self.peer.ok_or(HarnessError::NotConnected)
    }

    /// Wait for the first datagram from any source and adopt its sender as
    /// the peer.  The datagram stays queued for the next [`receive`].
    ///
    /// `None` waits forever; callers that need to stay responsive race this
    /// against something else.
    ///
    /// [`receive`]: TransportEndpoint::receive
    pub async fn accept(&mut self, limit: Option<Duration>) -> Result<ConnectionHandle> {
        let local = self.local_addr();
        let accepting = self.accept_any();
        match limit {
            Some(limit) => timeout(limit, accepting)
                .await
                .map_err(|_| HarnessError::timeout(format!("a connection on {local}")))?,
            None => accepting.await,
        }
    }

    async fn accept_any(&mut self) -> Result<ConnectionHandle> {
        loop {
            let (message, addr) = match self.socket.recv_from().await {
                Ok(v) => v,
                Err(SocketError::Message(e)) => {
                    log::warn!("[endpoint] undecodable datagram while accepting: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let handle = ConnectionHandle::from(addr);
            if let Some(previous) = self.peer.replace(handle) {
                log::debug!("[endpoint] {previous} replaced by {handle}");
            }
            log::info!("[endpoint] accepted {handle}");
            self.pending.push_back(message);
            return Ok(handle);
        }
    }

    /// Next message from the connected peer.
    pub async fn receive(&mut self, limit: Option<Duration>) -> Result<Message> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        let peer = self.remote_handle()?;
        let receiving = self.recv_from_peer(peer);
        match limit {
            Some(limit) => timeout(limit, receiving)
                .await
                .map_err(|_| HarnessError::timeout(format!("a message from {peer}")))?,
            None => receiving.await,
        }
    }

    async fn recv_from_peer(&self, peer: ConnectionHandle) -> Result<Message> {
        loop {
            let (message, addr) = match self.socket.recv_from().await {
                Ok(v) => v,
                Err(SocketError::Message(e)) => {
                    log::warn!("[endpoint] undecodable datagram: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if addr != peer.socket_addr() {
                log::debug!("[endpoint] ignoring {message} from {addr} (peer is {peer})");
                continue;
            }
            log::trace!("[endpoint] ← {message}");
            return Ok(message);
        }
    }

    /// Send `response` as the answer to `request`.
    pub async fn send(&mut self, request: &Message, response: Message) -> Result<()> {
        let response = self.correlate(request, response);
        self.send_message(&response).await
    }

    /// Copy the correlation fields of `request` into `response`: piggybacked
    /// ACK with the request's message id for CON, NON with a fresh id
    /// otherwise, token copied in both cases.
    pub fn correlate(&mut self, request: &Message, mut response: Message) -> Message {
        let skeleton = Message::response_to(request, response.code);
        response.msg_type = skeleton.msg_type;
        response.token = skeleton.token;
        response.message_id = match skeleton.msg_type {
            MessageType::Acknowledgement => skeleton.message_id,
            _ => self.next_message_id(),
        };
        response
    }

    /// Send `message` to the peer as is.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let peer = self.remote_handle()?;
        self.socket.send_to(message, peer.socket_addr()).await?;
        log::trace!("[endpoint] → {message}");
        Ok(())
    }

    /// Forget the current peer and anything queued from it.  The socket and
    /// its listening address are kept.
    pub fn reset(&mut self) {
        let previous = self.peer.take();
        self.pending.clear();
        match previous {
            Some(peer) => log::info!("[endpoint] reset; dropped {peer}"),
            None => log::debug!("[endpoint] reset while unconnected"),
        }
    }

    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = id.wrapping_add(1);
        id
    }

    /// Confirmable request/response exchange with the peer, used for control
    /// traffic.  The request gets a fresh message id and, if it has none, a
    /// random token.  Messages that do not answer it are queued for
    /// [`receive`](TransportEndpoint::receive).
    pub async fn request(&mut self, mut request: Message, limit: Duration) -> Result<Message> {
        let peer = self.remote_handle()?;
        request.msg_type = MessageType::Confirmable;
        request.message_id = self.next_message_id();
        if request.token.is_empty() {
            request.token = rand::rng().random::<[u8; 4]>().to_vec();
        }
        self.send_message(&request).await?;

        let deadline = Instant::now() + limit;
        loop {
            let message = timeout_at(deadline, self.recv_from_peer(peer))
                .await
                .map_err(|_| HarnessError::timeout(format!("response to {request}")))??;
            if message.token == request.token && message.code.is_response() {
                return Ok(message);
            }
            if message.msg_type == MessageType::Acknowledgement
                && message.message_id == request.message_id
                && message.code.is_empty()
            {
                // Empty ACK; the response follows separately.
                continue;
            }
            self.pending.push_back(message);
        }
    }
}
