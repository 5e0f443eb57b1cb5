use std::fmt;

use bytes::Bytes;

use super::message::Message;

/// One block of one piece, as named by `request` and `cancel` messages.
///
/// Requests order by piece, then offset, which is also the order blocks are
/// picked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    /// Offset one past the last byte, relative to the piece.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }

    pub fn to_request(self) -> Message {
        Message::Request {
            index: self.piece,
            begin: self.offset,
            length: self.length,
        }
    }

    pub fn to_cancel(self) -> Message {
        Message::Cancel {
            index: self.piece,
            begin: self.offset,
            length: self.length,
        }
    }
}

impl fmt::Display for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.piece, self.offset, self.length)
    }
}

/// Payload of a `piece` message.
#[derive(Debug, Clone)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(piece: u32, offset: u32, data: Bytes) -> Self {
        Self {
            piece,
            offset,
            data,
        }
    }

    /// The request this block answers.
    pub fn request(&self) -> BlockRequest {
        BlockRequest::new(self.piece, self.offset, self.data.len() as u32)
    }

    pub fn into_message(self) -> Message {
        Message::Piece {
            index: self.piece,
            begin: self.offset,
            data: self.data,
        }
    }
}

/// Blocks in a piece of `piece_length` bytes. Only the last may be short.
pub fn compute_block_count(piece_length: u64, block_size: u32) -> u32 {
    piece_length.div_ceil(block_size as u64) as u32
}

/// Length of block `block_index`, or 0 past the end of the piece.
pub fn compute_block_length(piece_length: u64, block_index: u32, block_size: u32) -> u32 {
    let start = block_index as u64 * block_size as u64;
    piece_length.saturating_sub(start).min(block_size as u64) as u32
}
