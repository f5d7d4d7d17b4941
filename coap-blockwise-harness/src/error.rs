//! Scenario-level error taxonomy.
//!
//! Every fatal condition aborts the current scenario only.  Intentional drops
//! decided by a [`crate::gate::RetransmissionGate`] are not errors and never
//! show up here; if a client runs out of retries because of them the scenario
//! sees a [`HarnessError::Timeout`] instead.

use thiserror::Error;

use crate::block::BlockError;
use crate::endpoint::ConnectionHandle;
use crate::message::MessageError;
use crate::socket::SocketError;
use crate::store::StoreError;

/// Result type alias for harness operations.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// An inbound request broke the block-wise sequencing contract.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// An expected event did not occur within its budget.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Traffic arrived while none was expected.
    #[error("unexpected traffic: {0}")]
    UnexpectedTraffic(String),

    /// The peer came back from a reset with the same source port.
    #[error("remote endpoint did not rebind: still {0}")]
    UnchangedRemote(ConnectionHandle),

    /// The client finished, but the stored bytes differ from the resource.
    #[error("downloaded payload differs: expected {expected} bytes, got {actual}")]
    PayloadMismatch { expected: usize, actual: usize },

    /// An operation needed a connected peer and there is none.
    #[error("endpoint has no connected peer")]
    NotConnected,

    /// The client under test rejected or failed a control command.
    #[error("client control: {0}")]
    Client(String),

    /// The background file server task died or was cancelled.
    #[error("file server task: {0}")]
    ServerTask(String),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    pub fn mismatch(msg: impl Into<String>) -> Self {
        HarnessError::ProtocolMismatch(msg.into())
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        HarnessError::Timeout(what.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout(_))
    }
}
