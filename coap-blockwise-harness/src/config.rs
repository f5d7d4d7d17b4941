//! Timeouts and sizes shared by the file server and the lifecycle driver.

use std::time::Duration;

use crate::block::{self, BlockError, MAX_BLOCK_SIZE};

/// Largest factor accepted by [`HarnessConfig::scaled`].
pub const MAX_SCALE: f64 = 1000.0;

/// Every wait in the harness takes its budget from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Block size offered to clients; a smaller one asked for by the first
    /// request wins.
    pub block_size: usize,
    /// How long to wait for a client to show up after a download command.
    pub accept_timeout: Duration,
    /// Silence required from an offline client.
    pub offline_window: Duration,
    /// How long to wait for each block request.
    pub receive_timeout: Duration,
    /// How long the client gets to open or close its socket.
    pub socket_count_timeout: Duration,
    /// How long the client gets to report a finished download.
    pub completion_timeout: Duration,
    pub poll_interval: Duration,
    /// Deadline for each control exchange while a download is in progress.
    pub control_deadline: Duration,
    pub control_rounds: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            block_size: MAX_BLOCK_SIZE,
            accept_timeout: Duration::from_secs(5),
            offline_window: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(5),
            socket_count_timeout: Duration::from_secs(1),
            completion_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            control_deadline: Duration::from_secs(1),
            control_rounds: 10,
        }
    }
}

impl HarnessConfig {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Same config with every wait scaled by `factor`, for slow CI hosts or
    /// fast loopback tests.  The factor is clamped to `0.0..=MAX_SCALE`; NaN
    /// leaves the waits unchanged.
    pub fn scaled(&self, factor: f64) -> Self {
        let factor = if factor.is_nan() {
            1.0
        } else {
            factor.clamp(0.0, MAX_SCALE)
        };
        let scale = |d: Duration| d.mul_f64(factor);
        Self {
            block_size: self.block_size,
            accept_timeout: scale(self.accept_timeout),
            offline_window: scale(self.offline_window),
            receive_timeout: scale(self.receive_timeout),
            socket_count_timeout: scale(self.socket_count_timeout),
            completion_timeout: scale(self.completion_timeout),
            poll_interval: scale(self.poll_interval),
            control_deadline: scale(self.control_deadline),
            control_rounds: self.control_rounds,
        }
    }

    pub fn validate(&self) -> Result<(), BlockError> {
        block::validate_size(self.block_size)
    }
}
