//! Drives a single TCP connection through the peer session state machine
//! (§4.5): DIALING -> HANDSHAKING -> AWAITING_BITFIELD -> CHOKED/UNCHOKED
//! -> REQUESTING/RECEIVING_BLOCK. A session is transient: it fetches
//! exactly one piece from one peer, then the connection is dropped.
use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::{parse_bitfield, Message, ProtocolViolation};
use crate::registry::{PeerEndpoint, PeerRegistry};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

const AWAITING_BITFIELD_RETRY_BUDGET: u32 = 3;
const CHOKED_RETRY_BUDGET: u32 = 3;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to peer: {0}")]
    ConnectFailed(String),

    #[error("handshake protocol or info_hash mismatch")]
    HandshakeMismatch,

    #[error("peer remained choked after the read budget")]
    PeerStillChoking,

    #[error("peer choked us mid-piece")]
    ChokedMidPiece,

    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Parameters shared by every session dialed for one torrent.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub num_pieces: usize,
    pub block_size: u32,
    pub connect_timeout: Duration,
    pub per_read_timeout: Duration,
}

/// Dials `addr`, performs the handshake, negotiates unchoke, and fetches
/// piece `piece_index` (`piece_length` bytes). On any error the
/// connection is simply dropped — sessions never retry internally;
/// retrying with a different peer is the scheduler's job (§4.7).
#[instrument(skip(config, registry), fields(peer = %addr, piece = piece_index), level = "debug")]
pub async fn fetch_piece(
    addr: SocketAddr,
    config: &SessionConfig,
    piece_index: usize,
    piece_length: u64,
    registry: &PeerRegistry,
) -> SessionResult<Vec<u8>> {
    let endpoint = to_endpoint(addr)?;
    registry.admit(endpoint);

    let mut stream = match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(SessionError::ConnectFailed(e.to_string())),
        Err(_) => return Err(SessionError::ConnectFailed("connect timed out".into())),
    };

    handshake(&mut stream, config).await?;

    let mut buf = Vec::new();
    let mut they_choke_us = true;
    let mut peer_bitfield: HashSet<usize> = HashSet::new();

    await_first_post_handshake_message(
        &mut stream,
        &mut buf,
        config,
        registry,
        endpoint,
        &mut they_choke_us,
        &mut peer_bitfield,
    )
    .await?;

    if they_choke_us {
        negotiate_unchoke(
            &mut stream,
            &mut buf,
            config,
            registry,
            endpoint,
            &mut they_choke_us,
            &mut peer_bitfield,
        )
        .await?;
    }

    request_piece(
        &mut stream,
        &mut buf,
        config,
        registry,
        endpoint,
        piece_index,
        piece_length,
        &mut peer_bitfield,
    )
    .await
}

async fn handshake(stream: &mut TcpStream, config: &SessionConfig) -> SessionResult<()> {
    let ours = Handshake::new(config.info_hash, config.peer_id);
    stream
        .write_all(&ours.to_bytes())
        .await
        .map_err(|e| SessionError::Io(e.to_string()))?;

    let mut hs_buf = [0u8; HANDSHAKE_LEN];
    match timeout(config.per_read_timeout, stream.read_exact(&mut hs_buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => return Err(SessionError::HandshakeMismatch),
        Err(_) => return Err(SessionError::HandshakeMismatch),
    }
    let theirs = Handshake::from_bytes(&hs_buf).map_err(|_| SessionError::HandshakeMismatch)?;
    if theirs.info_hash != config.info_hash {
        return Err(SessionError::HandshakeMismatch);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn await_first_post_handshake_message(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    config: &SessionConfig,
    registry: &PeerRegistry,
    endpoint: PeerEndpoint,
    they_choke_us: &mut bool,
    peer_bitfield: &mut HashSet<usize>,
) -> SessionResult<()> {
    let mut attempts = 0;
    loop {
        match next_message(stream, buf, config.per_read_timeout).await? {
            Some(Message::Bitfield(bits)) => {
                *peer_bitfield = parse_bitfield(&bits, config.num_pieces);
                return Ok(());
            }
            Some(Message::Unchoke) => {
                *they_choke_us = false;
                registry.set_they_choke_us(endpoint, false);
                return Ok(());
            }
            Some(Message::Choke) => {
                *they_choke_us = true;
                registry.set_they_choke_us(endpoint, true);
                return Ok(());
            }
            Some(Message::Have { index }) => {
                peer_bitfield.insert(index as usize);
                return Ok(());
            }
            Some(Message::Interested) => registry.set_they_interested(endpoint, true),
            Some(Message::NotInterested) => registry.set_they_interested(endpoint, false),
            Some(_) => {}
            None => {
                attempts += 1;
                if attempts >= AWAITING_BITFIELD_RETRY_BUDGET {
                    return Err(SessionError::PeerStillChoking);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn negotiate_unchoke(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    config: &SessionConfig,
    registry: &PeerRegistry,
    endpoint: PeerEndpoint,
    they_choke_us: &mut bool,
    peer_bitfield: &mut HashSet<usize>,
) -> SessionResult<()> {
    // Sent at most once per session (§9 open question): this function
    // runs exactly once per connection, so a single send here already
    // satisfies the dedup rule without needing to consult shared state.
    stream
        .write_all(&Message::Interested.to_bytes())
        .await
        .map_err(|e| SessionError::Io(e.to_string()))?;
    registry.set_we_interested(endpoint, true);

    let mut attempts = 0;
    while *they_choke_us {
        match next_message(stream, buf, config.per_read_timeout).await? {
            Some(Message::Unchoke) => {
                *they_choke_us = false;
                registry.set_they_choke_us(endpoint, false);
            }
            Some(Message::Choke) => registry.set_they_choke_us(endpoint, true),
            Some(Message::Have { index }) => {
                peer_bitfield.insert(index as usize);
            }
            Some(Message::Bitfield(bits)) => {
                *peer_bitfield = parse_bitfield(&bits, config.num_pieces);
            }
            Some(_) => {}
            None => {
                attempts += 1;
                if attempts >= CHOKED_RETRY_BUDGET {
                    return Err(SessionError::PeerStillChoking);
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn request_piece(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    config: &SessionConfig,
    registry: &PeerRegistry,
    endpoint: PeerEndpoint,
    piece_index: usize,
    piece_length: u64,
    peer_bitfield: &mut HashSet<usize>,
) -> SessionResult<Vec<u8>> {
    let mut piece_bytes = vec![0u8; piece_length as usize];
    let mut begin: u32 = 0;

    while (begin as u64) < piece_length {
        let remaining = piece_length - begin as u64;
        let block_len = remaining.min(config.block_size as u64) as u32;

        stream
            .write_all(
                &Message::Request {
                    index: piece_index as u32,
                    begin,
                    length: block_len,
                }
                .to_bytes(),
            )
            .await
            .map_err(|e| SessionError::Io(e.to_string()))?;

        loop {
            match next_message(stream, buf, config.per_read_timeout).await? {
                Some(Message::Piece {
                    index,
                    begin: recv_begin,
                    block,
                }) => {
                    if index as usize != piece_index || recv_begin != begin {
                        // Not the block we're waiting for; ignored here —
                        // a conforming peer replies in request order.
                        continue;
                    }
                    registry.record_download(endpoint, block.len() as u64);
                    let start = begin as usize;
                    piece_bytes[start..start + block.len()].copy_from_slice(&block);
                    begin += block_len;
                    break;
                }
                Some(Message::Choke) => {
                    registry.set_they_choke_us(endpoint, true);
                    return Err(SessionError::ChokedMidPiece);
                }
                Some(Message::Have { index }) => {
                    peer_bitfield.insert(index as usize);
                }
                Some(_) => {}
                None => return Err(SessionError::Io("timed out waiting for block".into())),
            }
        }
    }

    Ok(piece_bytes)
}

/// Reads from `stream` into `buf` until a complete message can be parsed
/// out of its front, or a single read times out (`Ok(None)`).
async fn next_message(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    read_timeout: Duration,
) -> SessionResult<Option<Message>> {
    loop {
        if let Some((msg, consumed)) = Message::parse(buf)? {
            buf.drain(0..consumed);
            return Ok(Some(msg));
        }
        let mut chunk = [0u8; 4096];
        match timeout(read_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(SessionError::Io("connection closed by peer".into())),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(SessionError::Io(e.to_string())),
            Err(_) => return Ok(None),
        }
    }
}

fn to_endpoint(addr: SocketAddr) -> SessionResult<PeerEndpoint> {
    match addr {
        SocketAddr::V4(v4) => Ok(PeerEndpoint {
            ip: *v4.ip(),
            port: v4.port(),
        }),
        SocketAddr::V6(_) => Err(SessionError::ConnectFailed(
            "IPv6 peers are not supported".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_config() -> SessionConfig {
        SessionConfig {
            info_hash: [7u8; 20],
            peer_id: [9u8; 20],
            num_pieces: 4,
            block_size: 4,
            connect_timeout: Duration::from_secs(2),
            per_read_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn handshake_mismatch_closes_session() {
        // S4: an altered protocol string yields HandshakeMismatch.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut incoming = [0u8; HANDSHAKE_LEN];
            sock.read_exact(&mut incoming).await.unwrap();
            let mut bad = Handshake::new([7u8; 20], [1u8; 20]).to_bytes();
            bad[5] ^= 0xff;
            sock.write_all(&bad).await.unwrap();
        });

        let registry = PeerRegistry::new(Duration::from_secs(30));
        let result = fetch_piece(addr, &test_config(), 0, 8, &registry).await;
        assert!(matches!(result, Err(SessionError::HandshakeMismatch)));
    }

    #[tokio::test]
    async fn fetches_piece_across_two_blocks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let expected = vec![1u8, 2, 3, 4, 5, 6, 7, 8];

        let server_expected = expected.clone();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut incoming = [0u8; HANDSHAKE_LEN];
            sock.read_exact(&mut incoming).await.unwrap();
            sock.write_all(&Handshake::new([7u8; 20], [1u8; 20]).to_bytes())
                .await
                .unwrap();
            sock.write_all(&Message::Unchoke.to_bytes()).await.unwrap();

            let mut buf = Vec::new();
            for _ in 0..2 {
                let request = loop {
                    if let Some((msg, consumed)) = Message::parse(&buf).unwrap() {
                        buf.drain(0..consumed);
                        if let Message::Request { index, begin, length } = msg {
                            break (index, begin, length);
                        }
                        continue;
                    }
                    let mut chunk = [0u8; 256];
                    let n = sock.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                };
                let (index, begin, length) = request;
                let block = server_expected[begin as usize..(begin + length) as usize].to_vec();
                sock.write_all(&Message::Piece { index, begin, block }.to_bytes())
                    .await
                    .unwrap();
            }
        });

        let registry = PeerRegistry::new(Duration::from_secs(30));
        let bytes = fetch_piece(addr, &test_config(), 0, 8, &registry)
            .await
            .unwrap();
        assert_eq!(bytes, expected);
    }
}
