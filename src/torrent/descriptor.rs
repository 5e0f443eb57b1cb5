use sha1::{Digest, Sha1};
use std::fmt;

use super::error::TorrentError;
use crate::constants::{BLOCK_SIZE, MAX_REQUEST_LENGTH};
use crate::peer::{compute_block_count, compute_block_length, BlockRequest};

/// The SHA-1 of a torrent's info dictionary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TorrentError> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| {
            TorrentError::InvalidDescriptor(format!("info hash of {} bytes", bytes.len()))
        })?;
        Ok(InfoHash(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, TorrentError> {
        let bytes = hex_decode(s)
            .ok_or_else(|| TorrentError::InvalidDescriptor(format!("bad hex info hash {s:?}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().fold(String::with_capacity(40), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Everything the engine needs to know about a torrent's content.
///
/// Built by the metadata loader before the coordinator starts and immutable
/// afterwards. All pieces are `piece_length` bytes except possibly the last.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    info_hash: InfoHash,
    piece_length: u64,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    block_size: u32,
}

impl TorrentDescriptor {
    pub fn new(
        info_hash: InfoHash,
        piece_length: u64,
        total_length: u64,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, TorrentError> {
        if piece_length == 0 || total_length == 0 {
            return Err(TorrentError::InvalidDescriptor(
                "piece length and total length must be non-zero".into(),
            ));
        }

        // block offsets within a piece travel as u32 on the wire
        if piece_length > u32::MAX as u64 {
            return Err(TorrentError::InvalidDescriptor(format!(
                "piece length {piece_length} exceeds the addressable range"
            )));
        }

        let expected = total_length.div_ceil(piece_length);
        if piece_hashes.len() as u64 != expected {
            return Err(TorrentError::InvalidDescriptor(format!(
                "{} piece hashes for {expected} pieces",
                piece_hashes.len()
            )));
        }

        if expected > u32::MAX as u64 {
            return Err(TorrentError::InvalidDescriptor(format!(
                "too many pieces: {expected}"
            )));
        }

        Ok(Self {
            info_hash,
            piece_length,
            total_length,
            piece_hashes,
            block_size: BLOCK_SIZE,
        })
    }

    /// Builds a descriptor from the raw `pieces` string of an info
    /// dictionary: the concatenation of every piece's 20-byte hash.
    pub fn from_pieces_field(
        info_hash: InfoHash,
        piece_length: u64,
        total_length: u64,
        pieces: &[u8],
    ) -> Result<Self, TorrentError> {
        if pieces.len() % 20 != 0 {
            return Err(TorrentError::InvalidDescriptor(format!(
                "pieces field of {} bytes is not a multiple of 20",
                pieces.len()
            )));
        }

        let hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        Self::new(info_hash, piece_length, total_length, hashes)
    }

    pub fn with_block_size(mut self, block_size: u32) -> Result<Self, TorrentError> {
        if block_size == 0 || block_size > MAX_REQUEST_LENGTH {
            return Err(TorrentError::InvalidDescriptor(format!(
                "block size {block_size} out of range"
            )));
        }
        self.block_size = block_size;
        Ok(self)
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// The nominal piece length; see [`piece_len`](Self::piece_len) for the
    /// length of a given piece.
    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn last_piece_length(&self) -> u64 {
        self.total_length - (self.piece_count() as u64 - 1) * self.piece_length
    }

    /// Length of the piece at `index`, or 0 if out of range.
    pub fn piece_len(&self, index: u32) -> u64 {
        let index = index as usize;
        let count = self.piece_count();
        if index + 1 < count {
            self.piece_length
        } else if index + 1 == count {
            self.last_piece_length()
        } else {
            0
        }
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    pub fn block_count(&self, index: u32) -> u32 {
        compute_block_count(self.piece_len(index), self.block_size)
    }

    /// The request for block `block` of piece `index`. Blocks past the end
    /// of the piece come back with zero length.
    pub fn block_request(&self, index: u32, block: u32) -> BlockRequest {
        BlockRequest::new(
            index,
            block.saturating_mul(self.block_size),
            compute_block_length(self.piece_len(index), block, self.block_size),
        )
    }

    /// Returns true if `request` names exactly one block of this torrent.
    pub fn is_block(&self, request: &BlockRequest) -> bool {
        (request.piece as usize) < self.piece_count()
            && request.offset % self.block_size == 0
            && request.offset / self.block_size < self.block_count(request.piece)
            && *request == self.block_request(request.piece, request.offset / self.block_size)
    }

    /// Returns true if `request` lies within a piece and is small enough to
    /// serve. Uploads may use any offset, unlike our own block grid.
    pub fn is_servable(&self, request: &BlockRequest) -> bool {
        request.length > 0
            && request.length <= MAX_REQUEST_LENGTH
            && request.end() <= self.piece_len(request.piece)
    }

    /// Checks `data` against the recorded hash of piece `index`.
    pub fn verify(&self, index: u32, data: &[u8]) -> Result<(), TorrentError> {
        let expected = self
            .piece_hash(index)
            .ok_or(TorrentError::HashMismatch { piece: index })?;

        if data.len() as u64 != self.piece_len(index) {
            return Err(TorrentError::HashMismatch { piece: index });
        }

        let digest: [u8; 20] = Sha1::digest(data).into();
        if digest == *expected {
            Ok(())
        } else {
            Err(TorrentError::HashMismatch { piece: index })
        }
    }
}
