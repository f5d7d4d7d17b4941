//! Per-resource block-wise transfer state machine.
//!
//! ```text
//!  AwaitingRequest(n) ──request──▶ Validating(n) ──ok──▶ Responding(n)
//!          ▲                            │                    │
//!          │                      mismatch (error)           │ has_more
//!          └────────────────────────────┴────────────────────┘
//!                                                            │ !has_more
//!                                                            ▼
//!                                                        Complete
//! ```
//!
//! The first request may omit BLOCK2.  If it carries one, it must ask for
//! block 0 and a smaller block size is adopted for the rest of the transfer.
//! Every later request must carry BLOCK2 with the expected sequence number,
//! the negotiated size and the M bit clear.

use std::sync::Arc;

use crate::block::{self, BlockOption};
use crate::error::{HarnessError, Result};
use crate::message::{Code, Message};

/// Where a [`BlockTransferSession`] stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the request for block `n`.
    AwaitingRequest(u32),
    /// The request for block `n` is being checked.
    Validating(u32),
    /// The response carrying block `n` is being built.
    Responding(u32),
    /// The block with `has_more = false` went out.
    Complete,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::AwaitingRequest(0)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::AwaitingRequest(n) => write!(f, "AwaitingRequest({n})"),
            SessionState::Validating(n) => write!(f, "Validating({n})"),
            SessionState::Responding(n) => write!(f, "Responding({n})"),
            SessionState::Complete => write!(f, "Complete"),
        }
    }
}

/// Serves one resource to one client, block by block.
#[derive(Debug, Clone)]
pub struct BlockTransferSession {
    path: String,
    payload: Arc<[u8]>,
    block_size: usize,
    state: SessionState,
}

impl BlockTransferSession {
    pub fn new(path: impl Into<String>, payload: Arc<[u8]>, block_size: usize) -> Result<Self> {
        block::validate_size(block_size)?;
        Ok(Self {
            path: path.into(),
            payload,
            block_size,
            state: SessionState::default(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn payload(&self) -> &Arc<[u8]> {
        &self.payload
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Complete
    }

    /// Sequence number of the next block to serve.  After completion this
    /// is the total number of blocks served.
    pub fn expected_seq_num(&self) -> u32 {
        match self.state {
            SessionState::AwaitingRequest(n)
            | SessionState::Validating(n)
            | SessionState::Responding(n) => n,
            SessionState::Complete => self.block_count(),
        }
    }

    /// Negotiated block size (the configured one until the first request
    /// asks for less).
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn read_offset(&self) -> usize {
        self.expected_seq_num() as usize * self.block_size
    }

    /// Number of responses a full transfer takes at the current block size.
    /// An empty payload still takes one.
    pub fn block_count(&self) -> u32 {
        self.payload.len().div_ceil(self.block_size).max(1) as u32
    }

    /// Validate `request` against the expected next block and return the
    /// BLOCK2 value its response would carry.  Does not change state.
    pub fn check(&self, request: &Message) -> Result<BlockOption> {
        let expected = match self.state {
            SessionState::AwaitingRequest(n) | SessionState::Validating(n) => n,
            SessionState::Responding(n) => {
                return Err(HarnessError::mismatch(format!(
                    "request for {} while block {n} is being sent",
                    self.path
                )))
            }
            SessionState::Complete => {
                return Err(HarnessError::mismatch(format!(
                    "request for {} after the transfer completed",
                    self.path
                )))
            }
        };

        if request.code != Code::GET {
            return Err(HarnessError::mismatch(format!(
                "expected GET, got {}",
                request.code
            )));
        }
        let path = request.uri_path();
        if path != self.path {
            return Err(HarnessError::mismatch(format!(
                "expected a request for {}, got {path}",
                self.path
            )));
        }

        let requested = request
            .block2()
            .map_err(|e| HarnessError::mismatch(format!("malformed BLOCK2: {e}")))?;

        let size = match (expected, requested) {
            (0, None) => self.block_size,
            (0, Some(b)) => {
                if b.seq_num != 0 {
                    return Err(HarnessError::mismatch(format!(
                        "first request asked for block {}",
                        b.seq_num
                    )));
                }
                if b.has_more {
                    return Err(HarnessError::mismatch("M bit set in request BLOCK2"));
                }
                b.block_size.min(self.block_size)
            }
            (n, None) => {
                return Err(HarnessError::mismatch(format!(
                    "request for block {n} carries no BLOCK2"
                )))
            }
            (n, Some(b)) => {
                if b.seq_num != n {
                    return Err(HarnessError::mismatch(format!(
                        "expected block {n}, got {}",
                        b.seq_num
                    )));
                }
                if b.block_size != self.block_size {
                    return Err(HarnessError::mismatch(format!(
                        "expected block size {}, got {}",
                        self.block_size, b.block_size
                    )));
                }
                if b.has_more {
                    return Err(HarnessError::mismatch("M bit set in request BLOCK2"));
                }
                self.block_size
            }
        };

        Ok(BlockOption::for_payload(expected, size, self.payload.len())?)
    }

    /// Validate `request`, build the 2.05 response carrying the next slice,
    /// and advance.
    pub fn handle(&mut self, request: &Message) -> Result<Message> {
        let n = self.expected_seq_num();
        if self.is_complete() {
            return Err(HarnessError::mismatch(format!(
                "request for {} after the transfer completed",
                self.path
            )));
        }

        self.state = SessionState::Validating(n);
        let block = match self.check(request) {
            Ok(block) => block,
            Err(e) => {
                self.state = SessionState::AwaitingRequest(n);
                return Err(e);
            }
        };

        self.state = SessionState::Responding(n);
        self.block_size = block.block_size;
        let start = block.offset().min(self.payload.len());
        let end = (start + block.block_size).min(self.payload.len());
        let response = Message::response_to(request, Code::CONTENT)
            .with_block2(block)
            .with_payload(&self.payload[start..end]);

        self.state = if block.has_more {
            SessionState::AwaitingRequest(n + 1)
        } else {
            SessionState::Complete
        };
        log::debug!(
            "[session] {} block {block} ({} bytes) -> {}",
            self.path,
            end - start,
            self.state
        );
        Ok(response)
    }
}
