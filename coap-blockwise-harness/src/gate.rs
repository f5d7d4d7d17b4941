//! Deterministic retransmission forcing.
//!
//! A [`RetransmissionGate`] decides, per inbound request, whether the server
//! pretends the datagram was lost.  The decision sees how many structurally
//! identical requests arrived *before* this one; [`RequestHistory`] keeps that
//! count for the lifetime of a scenario.
//!
//! ```text
//!   request ──▶ RequestRecord ──▶ history.count_identical() ──▶ gate
//!                     │                                          │
//!                     └──────────── history.record() ◀───────────┘
//! ```
//!
//! With [`ModuloBackoff`] (modulus 4) the block at seq 5 is dropped once and
//! answered on its second arrival; the block at seq 8 is answered at once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::message::{Code, CoapOption, Message};

/// Structural snapshot of a request: method, path, and full option set.
///
/// Message id and token are left out, so a client retransmission and a
/// client re-request of the same block compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestRecord {
    pub code: Code,
    pub path: String,
    pub options: Vec<CoapOption>,
}

impl From<&Message> for RequestRecord {
    fn from(message: &Message) -> Self {
        Self {
            code: message.code,
            path: message.uri_path(),
            options: message.options().to_vec(),
        }
    }
}

/// Append-only list of every request seen during a scenario, dropped ones
/// included.
#[derive(Debug, Clone, Default)]
pub struct RequestHistory {
    records: Arc<Mutex<Vec<RequestRecord>>>,
}

impl RequestHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RequestRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, record: RequestRecord) {
        self.lock().push(record);
    }

    /// Number of earlier entries equal to `record`.
    pub fn count_identical(&self, record: &RequestRecord) -> usize {
        self.lock().iter().filter(|r| *r == record).count()
    }

    /// Count prior occurrences of `record`, then append it, in one critical
    /// section.
    pub fn count_and_record(&self, record: RequestRecord) -> usize {
        let mut records = self.lock();
        let prior = records.iter().filter(|r| **r == record).count();
        records.push(record);
        prior
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.lock().clone()
    }
}

/// Policy deciding whether an inbound request goes unanswered.
pub trait RetransmissionGate: Send + Sync {
    /// `prior_identical` is the number of structurally identical requests
    /// that arrived before `request`.
    fn should_ignore(&self, request: &Message, prior_identical: usize) -> bool;
}

/// Never drops anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAnswer;

impl RetransmissionGate for AlwaysAnswer {
    fn should_ignore(&self, _request: &Message, _prior_identical: usize) -> bool {
        false
    }
}

/// Drops the block at seq `n` until it has been seen `n % modulus` times.
#[derive(Debug, Clone, Copy)]
pub struct ModuloBackoff {
    pub modulus: u32,
}

impl Default for ModuloBackoff {
    fn default() -> Self {
        Self { modulus: 4 }
    }
}

impl ModuloBackoff {
    pub fn new(modulus: u32) -> Self {
        Self {
            modulus: modulus.max(1),
        }
    }

    /// Drops the block at `seq_num` incurs before it is answered.
    pub fn required_drops(&self, seq_num: u32) -> usize {
        (seq_num % self.modulus.max(1)) as usize
    }

    /// Total drops for a transfer of `block_count` blocks.
    pub fn total_drops(&self, block_count: u32) -> usize {
        (0..block_count).map(|n| self.required_drops(n)).sum()
    }
}

impl RetransmissionGate for ModuloBackoff {
    fn should_ignore(&self, request: &Message, prior_identical: usize) -> bool {
        match request.block2() {
            Ok(Some(block)) => prior_identical < self.required_drops(block.seq_num),
            // Let the session report the bad request.
            Ok(None) | Err(_) => false,
        }
    }
}

impl<F> RetransmissionGate for F
where
    F: Fn(&Message, usize) -> bool + Send + Sync,
{
    fn should_ignore(&self, request: &Message, prior_identical: usize) -> bool {
        self(request, prior_identical)
    }
}
