use super::error::PeerError;
use crate::constants::{HANDSHAKE_LEN, MAX_MESSAGE_SIZE, PROTOCOL_STRING, RESERVED_BYTES};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(PeerError::MalformedMessage(format!(
                "unknown message id {value}"
            ))),
        }
    }
}

/// The fixed 68-byte handshake that opens every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: RESERVED_BYTES,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Decodes a handshake from the front of `data`.
    ///
    /// The protocol prefix is checked as soon as enough bytes are present, so
    /// a peer that opens with anything else is rejected without waiting for
    /// all 68 bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let prefix = data.len().min(1 + PROTOCOL_STRING.len());
        if prefix > 0 && data[..prefix] != Self::prefix()[..prefix] {
            return Err(PeerError::ProtocolViolation(
                "expected handshake as first message".into(),
            ));
        }

        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::Incomplete {
                needed: HANDSHAKE_LEN - data.len(),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }

    /// `pstrlen` followed by the protocol string.
    pub fn prefix() -> [u8; 20] {
        let mut prefix = [0u8; 20];
        prefix[0] = PROTOCOL_STRING.len() as u8;
        prefix[1..].copy_from_slice(PROTOCOL_STRING);
        prefix
    }

    /// Returns true if `data` starts like a handshake.
    pub fn is_handshake(data: &[u8]) -> bool {
        data.len() >= 20 && data[..20] == Self::prefix()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(self.id().map_or(0, |id| id as u8));
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.reserve(5 + bits.len());
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(self.id().map_or(0, |id| id as u8));
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.reserve(13 + data.len());
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
        }
    }

    /// Decodes one length-prefixed frame from the front of `buf`.
    ///
    /// On success the frame's bytes are consumed. On
    /// [`PeerError::Incomplete`] the buffer is left untouched so the caller
    /// can read more and try again.
    pub fn decode(buf: &mut BytesMut) -> Result<Self, PeerError> {
        if buf.len() < 4 {
            return Err(PeerError::Incomplete {
                needed: 4 - buf.len(),
            });
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::MalformedMessage(format!(
                "message too large: {length}"
            )));
        }

        if buf.len() < 4 + length {
            return Err(PeerError::Incomplete {
                needed: 4 + length - buf.len(),
            });
        }

        if length == 0 {
            buf.advance(4);
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(buf[4])?;
        check_length(id, length)?;

        buf.advance(5);
        let mut frame = buf.split_to(length - 1).freeze();

        let message = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece: frame.get_u32(),
            },
            MessageId::Bitfield => Message::Bitfield(frame),
            MessageId::Request => Message::Request {
                index: frame.get_u32(),
                begin: frame.get_u32(),
                length: frame.get_u32(),
            },
            MessageId::Piece => {
                let index = frame.get_u32();
                let begin = frame.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: frame,
                }
            }
            MessageId::Cancel => Message::Cancel {
                index: frame.get_u32(),
                begin: frame.get_u32(),
                length: frame.get_u32(),
            },
        };

        Ok(message)
    }
}

/// Checks the declared frame length (type byte included) against the fixed
/// payload size of each message type.
fn check_length(id: MessageId, length: usize) -> Result<(), PeerError> {
    let valid = match id {
        MessageId::Choke
        | MessageId::Unchoke
        | MessageId::Interested
        | MessageId::NotInterested => length == 1,
        MessageId::Have => length == 5,
        MessageId::Bitfield => length >= 1,
        MessageId::Request | MessageId::Cancel => length == 13,
        MessageId::Piece => length >= 9,
    };

    if valid {
        Ok(())
    } else {
        Err(PeerError::MalformedMessage(format!(
            "{id:?} with length {length}"
        )))
    }
}
