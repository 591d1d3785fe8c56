//! uwsgi packet header.
//!
//! ```text
//! ┌───────────┬──────────┬───────────┐
//! │ modifier1 │ datasize │ modifier2 │
//! │ 1 byte    │ u16 LE   │ 1 byte    │
//! └───────────┴──────────┴───────────┘
//! ```
//!
//! Requests are sent as modifier1 = 0 (WSGI/CGI vars), modifier2 = 0, with
//! datasize the length of the block vars that follow.

use crate::vars::{BlockError, MAX_BLOCK_SIZE};

/// Header size in bytes
pub const HEADER_SIZE: usize = 4;

/// modifier1 of a packet whose body is block vars
pub const MODIFIER_VARS: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub modifier1: u8,
    pub datasize: u16,
    pub modifier2: u8,
}

impl PacketHeader {
    /// Header for a vars block of `len` bytes; fails if `len` does not fit the
    /// 16-bit datasize
    pub fn for_block(len: usize) -> Result<Self, BlockError> {
        if len > MAX_BLOCK_SIZE {
            return Err(BlockError::BlockTooLarge(len));
        }
        Ok(Self {
            modifier1: MODIFIER_VARS,
            datasize: len as u16,
            modifier2: 0,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let size = self.datasize.to_le_bytes();
        [self.modifier1, size[0], size[1], self.modifier2]
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            modifier1: buf[0],
            datasize: u16::from_le_bytes([buf[1], buf[2]]),
            modifier2: buf[3],
        }
    }
}
