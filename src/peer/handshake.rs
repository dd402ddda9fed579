//! The BitTorrent peer handshake: the first 68 bytes exchanged on every
//! connection, establishing protocol and swarm identity (§4.4).
use thiserror::Error;

pub const HANDSHAKE_LEN: usize = 68;
const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake protocol length prefix was {0:#04x}, expected 0x13")]
    BadProtocolLength(u8),

    #[error("handshake protocol string did not match")]
    BadProtocolString,
}

/// A parsed or to-be-sent handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes into the wire format: length prefix, protocol string,
    /// reserved bytes, info_hash, peer_id.
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a full 68-byte handshake received from a peer. Does not
    /// check `info_hash` against any expectation — that's the caller's
    /// job (the session compares against the info-hash of the torrent
    /// being downloaded).
    pub fn from_bytes(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self, HandshakeError> {
        if buf[0] != PROTOCOL.len() as u8 {
            return Err(HandshakeError::BadProtocolLength(buf[0]));
        }
        if &buf[1..20] != PROTOCOL.as_slice() {
            return Err(HandshakeError::BadProtocolString);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.to_bytes();
        assert_eq!(Handshake::from_bytes(&bytes).unwrap(), hs);
    }

    #[test]
    fn rejects_bad_protocol_length() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).to_bytes();
        bytes[0] = 18;
        assert_eq!(
            Handshake::from_bytes(&bytes),
            Err(HandshakeError::BadProtocolLength(18))
        );
    }

    #[test]
    fn rejects_altered_protocol_string() {
        // S4: any byte of the protocol string altered yields a mismatch.
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).to_bytes();
        bytes[5] ^= 0xff;
        assert_eq!(
            Handshake::from_bytes(&bytes),
            Err(HandshakeError::BadProtocolString)
        );
    }
}
