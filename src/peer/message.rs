//! Peer wire messages: the length-prefixed frames exchanged after the
//! handshake (§4.4).
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

const LENGTH_PREFIX_LEN: usize = 4;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("unknown message id {0}")]
    UnknownId(u8),

    #[error("message id {id} has the wrong payload length {len}")]
    BadPayloadLength { id: u8, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Serializes this message into its wire frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => 0u32.to_be_bytes().to_vec(),
            Message::Choke => frame(ID_CHOKE, &[]),
            Message::Unchoke => frame(ID_UNCHOKE, &[]),
            Message::Interested => frame(ID_INTERESTED, &[]),
            Message::NotInterested => frame(ID_NOT_INTERESTED, &[]),
            Message::Have { index } => frame(ID_HAVE, &index.to_be_bytes()),
            Message::Bitfield(bits) => frame(ID_BITFIELD, bits),
            Message::Request {
                index,
                begin,
                length,
            } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                frame(ID_REQUEST, &payload)
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                frame(ID_PIECE, &payload)
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                frame(ID_CANCEL, &payload)
            }
        }
    }

    /// Streaming parse: attempts to read one message from the front of
    /// `buf`. Returns `Ok(None)` if `buf` doesn't yet hold a complete
    /// message — the caller must read more bytes and retry with the same
    /// (unconsumed) buffer. Never consumes a partial message.
    pub fn parse(buf: &[u8]) -> Result<Option<(Message, usize)>, ProtocolViolation> {
        if buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        let total = LENGTH_PREFIX_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }
        if len == 0 {
            return Ok(Some((Message::KeepAlive, LENGTH_PREFIX_LEN)));
        }

        let id = buf[4];
        let payload = &buf[5..total];
        let message = match id {
            ID_CHOKE => expect_empty(id, payload, Message::Choke)?,
            ID_UNCHOKE => expect_empty(id, payload, Message::Unchoke)?,
            ID_INTERESTED => expect_empty(id, payload, Message::Interested)?,
            ID_NOT_INTERESTED => expect_empty(id, payload, Message::NotInterested)?,
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(ProtocolViolation::BadPayloadLength {
                        id,
                        len: payload.len(),
                    });
                }
                Message::Have {
                    index: u32::from_be_bytes(payload.try_into().unwrap()),
                }
            }
            ID_BITFIELD => Message::Bitfield(payload.to_vec()),
            ID_REQUEST => parse_index_begin_length(id, payload, |index, begin, length| {
                Message::Request {
                    index,
                    begin,
                    length,
                }
            })?,
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(ProtocolViolation::BadPayloadLength {
                        id,
                        len: payload.len(),
                    });
                }
                Message::Piece {
                    index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                    begin: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    block: payload[8..].to_vec(),
                }
            }
            ID_CANCEL => parse_index_begin_length(id, payload, |index, begin, length| {
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            })?,
            other => return Err(ProtocolViolation::UnknownId(other)),
        };
        Ok(Some((message, total)))
    }
}

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let len = (1 + payload.len()) as u32;
    let mut buf = Vec::with_capacity(4 + payload.len() + 1);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(payload);
    buf
}

fn expect_empty(id: u8, payload: &[u8], message: Message) -> Result<Message, ProtocolViolation> {
    if !payload.is_empty() {
        return Err(ProtocolViolation::BadPayloadLength {
            id,
            len: payload.len(),
        });
    }
    Ok(message)
}

fn parse_index_begin_length(
    id: u8,
    payload: &[u8],
    make: impl Fn(u32, u32, u32) -> Message,
) -> Result<Message, ProtocolViolation> {
    if payload.len() != 12 {
        return Err(ProtocolViolation::BadPayloadLength {
            id,
            len: payload.len(),
        });
    }
    let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    let length = u32::from_be_bytes(payload[8..12].try_into().unwrap());
    Ok(make(index, begin, length))
}

/// Parses a `bitfield` payload into the set of piece indices it marks
/// present. Bit `k` of byte `b` (MSB = bit 0) is piece `8*b + k` (§4.4).
/// Non-zero padding past `num_pieces` is logged, not fatal.
pub fn parse_bitfield(bytes: &[u8], num_pieces: usize) -> HashSet<usize> {
    let mut set = HashSet::new();
    for (b, byte) in bytes.iter().enumerate() {
        for k in 0..8u32 {
            let index = b * 8 + k as usize;
            let present = byte & (0x80 >> k) != 0;
            if !present {
                continue;
            }
            if index >= num_pieces {
                warn!(index, num_pieces, "non-zero bitfield padding bit");
                continue;
            }
            set.insert(index);
        }
    }
    set
}

/// Serializes a set of piece indices into a bitfield payload of
/// `ceil(num_pieces / 8)` bytes.
pub fn serialize_bitfield(set: &HashSet<usize>, num_pieces: usize) -> Vec<u8> {
    let num_bytes = num_pieces.div_ceil(8);
    let mut bytes = vec![0u8; num_bytes];
    for &index in set {
        if index >= num_pieces {
            continue;
        }
        let b = index / 8;
        let k = (index % 8) as u32;
        bytes[b] |= 0x80 >> k;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keep_alive() {
        assert_eq!(
            Message::parse(&[0, 0, 0, 0]).unwrap(),
            Some((Message::KeepAlive, 4))
        );
    }

    #[test]
    fn reports_need_more_data() {
        assert_eq!(Message::parse(&[0, 0, 0, 5, 6]).unwrap(), None);
    }

    #[test]
    fn round_trips_request() {
        let msg = Message::Request {
            index: 3,
            begin: 16384,
            length: 16384,
        };
        let bytes = msg.to_bytes();
        assert_eq!(Message::parse(&bytes).unwrap(), Some((msg, bytes.len())));
    }

    #[test]
    fn round_trips_piece() {
        let msg = Message::Piece {
            index: 1,
            begin: 0,
            block: vec![1, 2, 3, 4],
        };
        let bytes = msg.to_bytes();
        assert_eq!(Message::parse(&bytes).unwrap(), Some((msg, bytes.len())));
    }

    #[test]
    fn streaming_parse_handles_split_and_concatenated_messages() {
        // S3 law: splitting an arbitrary concatenation of valid messages at
        // arbitrary byte boundaries must not lose or duplicate any message.
        let messages = vec![
            Message::Unchoke,
            Message::Interested,
            Message::Have { index: 7 },
            Message::Request {
                index: 0,
                begin: 0,
                length: 16384,
            },
        ];
        let mut all_bytes = Vec::new();
        for m in &messages {
            all_bytes.extend(m.to_bytes());
        }

        let mut parsed = Vec::new();
        let mut buf: Vec<u8> = Vec::new();
        let mut cursor = 0;
        while cursor < all_bytes.len() {
            buf.push(all_bytes[cursor]);
            cursor += 1;
            loop {
                match Message::parse(&buf).unwrap() {
                    Some((msg, consumed)) => {
                        parsed.push(msg);
                        buf.drain(0..consumed);
                    }
                    None => break,
                }
            }
        }
        assert_eq!(parsed, messages);
    }

    #[test]
    fn unknown_id_is_protocol_violation() {
        assert_eq!(
            Message::parse(&[0, 0, 0, 1, 99]),
            Err(ProtocolViolation::UnknownId(99))
        );
    }

    #[test]
    fn bitfield_round_trip_symmetry() {
        // Property 4.
        let num_pieces = 20;
        let set: HashSet<usize> = [0, 1, 7, 8, 15, 19].into_iter().collect();
        let bytes = serialize_bitfield(&set, num_pieces);
        assert_eq!(parse_bitfield(&bytes, num_pieces), set);
    }

    #[test]
    fn bitfield_bit_order_is_msb_first() {
        // bit 0 of byte 0 is piece index 0, the most significant bit.
        let bytes = [0b1000_0000];
        let set = parse_bitfield(&bytes, 8);
        assert_eq!(set, [0].into_iter().collect());
    }
}
