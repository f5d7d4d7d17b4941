//! BLOCK2 option values (RFC 7959 §2.2).
//!
//! A block option travels as an unsigned integer of 0–3 bytes:
//!
//! ```text
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 NUM                   |M| SZX |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `block_size = 2^(SZX + 4)`, so SZX 0..=6 covers 16..=1024 bytes.  SZX 7 is
//! reserved.  Leading zero bytes are stripped on the wire; a value of zero is
//! the empty option.

use thiserror::Error;

/// Smallest block size expressible on the wire.
pub const MIN_BLOCK_SIZE: usize = 16;
/// Largest block size expressible on the wire.
pub const MAX_BLOCK_SIZE: usize = 1024;
/// Largest sequence number that fits the 20-bit NUM field.
pub const MAX_SEQ_NUM: u32 = (1 << 20) - 1;

const MORE_BIT: u32 = 0b1000;
const SZX_MASK: u32 = 0b0111;

/// Errors raised while building or parsing a block option value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block size {0} is not a power of two in 16..=1024")]
    InvalidSize(usize),
    #[error("sequence number {0} does not fit in 20 bits")]
    SeqNumOverflow(u32),
    #[error("block option value is {0} bytes long (max 3)")]
    ValueTooLong(usize),
    #[error("reserved SZX value 7")]
    ReservedSzx,
}

/// Decoded block-control descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockOption {
    pub seq_num: u32,
    pub block_size: usize,
    pub has_more: bool,
}

impl BlockOption {
    pub fn new(seq_num: u32, block_size: usize, has_more: bool) -> Result<Self, BlockError> {
        if seq_num > MAX_SEQ_NUM {
            return Err(BlockError::SeqNumOverflow(seq_num));
        }
        validate_size(block_size)?;
        Ok(Self {
            seq_num,
            block_size,
            has_more,
        })
    }

    /// Block covering `seq_num` of a payload of `payload_len` bytes, with
    /// `has_more` derived from the payload length.
    pub fn for_payload(seq_num: u32, block_size: usize, payload_len: usize) -> Result<Self, BlockError> {
        let offset = seq_num as usize * block_size;
        Self::new(seq_num, block_size, payload_len > offset + block_size)
    }

    /// Byte offset of this block within the resource.
    pub fn offset(&self) -> usize {
        self.seq_num as usize * self.block_size
    }

    /// Size exponent (`block_size = 2^(szx + 4)`).
    pub fn szx(&self) -> u8 {
        (self.block_size.trailing_zeros() - 4) as u8
    }

    /// Encode as the minimal big-endian option value.
    pub fn encode(&self) -> Vec<u8> {
        let mut value = self.seq_num << 4 | u32::from(self.szx());
        if self.has_more {
            value |= MORE_BIT;
        }
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        bytes[skip..].to_vec()
    }

    pub fn decode(value: &[u8]) -> Result<Self, BlockError> {
        if value.len() > 3 {
            return Err(BlockError::ValueTooLong(value.len()));
        }
        let raw = value.iter().fold(0u32, |acc, b| acc << 8 | u32::from(*b));
        let szx = raw & SZX_MASK;
        if szx == 7 {
            return Err(BlockError::ReservedSzx);
        }
        Ok(Self {
            seq_num: raw >> 4,
            block_size: 1 << (szx + 4),
            has_more: raw & MORE_BIT != 0,
        })
    }
}

impl std::fmt::Display for BlockOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.seq_num,
            u8::from(self.has_more),
            self.block_size
        )
    }
}

/// Check that `block_size` is a power of two in the wire-representable range.
pub fn validate_size(block_size: usize) -> Result<(), BlockError> {
    if block_size.is_power_of_two() && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        Ok(())
    } else {
        Err(BlockError::InvalidSize(block_size))
    }
}
