//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers:
//! - Announce requests and responses
//! - Peer parsing (compact and non-compact)
//! - Peer ID generation and URL encoding helpers
//! - Multi-tier announce walking (§4.3)
use crate::bencode::{decoder, BencodeError, BencodeValue};
use crate::torrent::Metainfo;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("bencode decoding error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("HTTP error talking to tracker: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid tracker URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("tracker rejected the announce: {0}")]
    TrackerRejected(String),

    #[error("no announce URL in any tier succeeded")]
    TrackerUnreachable,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A peer endpoint returned by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<Peer>,
}

/// A client communicating with BitTorrent trackers on behalf of one
/// in-progress download.
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
}

impl Client {
    pub fn new(port: u16) -> Self {
        Self {
            peer_id: generate_peer_id(),
            port,
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Walks `metainfo`'s announce tiers in order (§4.3): within a tier,
    /// URLs are tried in order; the first success stops walking
    /// altogether. Returns [`TrackerError::TrackerUnreachable`] only if
    /// every URL in every tier failed.
    #[instrument(skip(self, metainfo), level = "debug")]
    pub async fn announce(&self, metainfo: &Metainfo) -> TrackerResult<AnnounceResponse> {
        let client = reqwest::Client::new();
        let mut last_err: Option<TrackerError> = None;

        for tier in &metainfo.announce_tiers {
            for url in tier {
                match self.announce_one(&client, url, metainfo).await {
                    Ok(response) => return Ok(response),
                    Err(err) => {
                        warn!(url, error = %err, "announce attempt failed");
                        last_err = Some(err);
                    }
                }
            }
        }

        match last_err {
            Some(TrackerError::TrackerRejected(reason)) => {
                Err(TrackerError::TrackerRejected(reason))
            }
            _ => Err(TrackerError::TrackerUnreachable),
        }
    }

    async fn announce_one(
        &self,
        client: &reqwest::Client,
        announce_url: &str,
        metainfo: &Metainfo,
    ) -> TrackerResult<AnnounceResponse> {
        // Validate the announce URL the same way the teacher's client did
        // before building the query string by hand — info_hash/peer_id need
        // byte-exact percent-encoding that `Url::query_pairs_mut` doesn't give.
        let parsed = url::Url::parse(announce_url)?;
        let separator = if parsed.query().is_some() { "&" } else { "?" };
        let url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
            announce_url,
            separator,
            url_encode(&metainfo.info_hash),
            url_encode(&self.peer_id),
            self.port,
            metainfo.total_length,
        );
        debug!(url, "making announce request to tracker");

        let response = client.get(&url).timeout(ANNOUNCE_TIMEOUT).send().await?;
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }
}

fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let value = decoder::decode(bytes)?;
    let dict = match value {
        BencodeValue::Dict(d) => d,
        _ => {
            return Err(TrackerError::TrackerRejected(
                "response is not a dictionary".into(),
            ))
        }
    };

    if let Some(BencodeValue::ByteStr(reason)) = dict.get(&b"failure reason"[..].to_vec()) {
        let reason = String::from_utf8_lossy(reason).into_owned();
        return Err(TrackerError::TrackerRejected(reason));
    }

    let interval = dict
        .get(&b"interval"[..].to_vec())
        .and_then(BencodeValue::as_int)
        .unwrap_or(0);

    let peers = match dict.get(&b"peers"[..].to_vec()) {
        Some(BencodeValue::ByteStr(compact)) => parse_compact_peers(compact),
        Some(BencodeValue::List(entries)) => parse_dict_peers(entries),
        _ => Vec::new(),
    };

    Ok(AnnounceResponse { interval, peers })
}

fn parse_compact_peers(bytes: &[u8]) -> Vec<Peer> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer {
                ip: IpAddr::V4(ip),
                port,
            }
        })
        .collect()
}

fn parse_dict_peers(entries: &[BencodeValue]) -> Vec<Peer> {
    entries
        .iter()
        .filter_map(|entry| {
            let dict = entry.as_dict()?;
            let ip = dict
                .get(&b"ip"[..].to_vec())
                .and_then(BencodeValue::as_bytes)
                .and_then(|b| std::str::from_utf8(b).ok())
                .and_then(|s| s.parse::<IpAddr>().ok())?;
            let port = dict.get(&b"port"[..].to_vec()).and_then(BencodeValue::as_int)? as u16;
            Some(Peer { ip, port })
        })
        .collect()
}

/// Deduplicates peers by `(ip, port)`, preserving first-seen order.
pub fn dedup_peers(peers: Vec<Peer>) -> Vec<Peer> {
    let mut seen = HashSet::new();
    peers.into_iter().filter(|p| seen.insert(*p)).collect()
}

/// Generates a unique peer ID for this client: an 8-byte prefix
/// `-XX0001-` followed by 12 random bytes (§6).
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-LR0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Percent-encodes a byte slice with no safe set (every byte of
/// `info_hash`/`peer_id` is encoded), per §4.3.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_expected_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-LR0001-");
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn url_encode_leaves_unreserved_untouched() {
        assert_eq!(url_encode(b"abc-._~"), "abc-._~");
    }

    #[test]
    fn url_encode_escapes_everything_else() {
        assert_eq!(url_encode(&[0x7f, 0x00, 0x20]), "%7F%00%20");
    }

    #[test]
    fn decodes_compact_peer_sample() {
        // S3: 7f 00 00 01 1a e1 -> 127.0.0.1:6881
        let bytes = [0x7f, 0x00, 0x00, 0x01, 0x1a, 0xe1];
        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(peers[0].port, 6881);
    }

    #[test]
    fn rejects_failure_reason() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(
            b"failure reason".to_vec(),
            BencodeValue::ByteStr(b"bad info_hash".to_vec()),
        );
        let bytes = crate::bencode::encoder::encode_to_vec(&BencodeValue::Dict(dict)).unwrap();
        assert!(matches!(
            parse_announce_response(&bytes),
            Err(TrackerError::TrackerRejected(_))
        ));
    }

    #[test]
    fn dedup_peers_drops_duplicates() {
        let p = Peer {
            ip: "127.0.0.1".parse().unwrap(),
            port: 6881,
        };
        let deduped = dedup_peers(vec![p, p, p]);
        assert_eq!(deduped.len(), 1);
    }
}
