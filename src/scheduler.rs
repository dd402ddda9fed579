//! Download scheduler (C7): assigns pieces to peer sessions, verifies
//! digests, and hands verified bytes to the file writer.
use crate::peer::session::{fetch_piece, SessionConfig, SessionError};
use crate::registry::{PeerEndpoint, PeerRegistry, RngSource};
use crate::torrent::{Metainfo, TorrentError};
use crate::tracker::TrackerError;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("metainfo error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece {0} could not be obtained from any admitted peer")]
    PieceUnobtainable(usize),

    #[error("download cancelled")]
    Cancelled,

    #[error("max_pieces limited the download to {fetched} of {total} pieces; refusing to write a truncated torrent")]
    Truncated { fetched: usize, total: usize },
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_parallel_sessions: usize,
    pub unchoked_peers: usize,
    pub block_size: u32,
    pub connect_timeout: Duration,
    pub per_read_timeout: Duration,
    pub optimistic_unchoke_interval: Duration,
    pub max_pieces: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceState {
    Pending,
    InFlight(PeerEndpoint),
    Verified,
    Failed,
}

struct Shared {
    piece_states: Mutex<Vec<PieceState>>,
    pending: Mutex<VecDeque<usize>>,
    tried_peers: Mutex<HashMap<usize, HashSet<PeerEndpoint>>>,
    pieces_buffer: Mutex<Vec<Option<Vec<u8>>>>,
    verified_count: AtomicUsize,
    fatal: Mutex<Option<usize>>,
}

/// Owns everything one download needs: the peer registry, the admitted
/// peer list, and the piece-assignment state. Wrapped in an `Arc` by the
/// caller so worker tasks and an optional background choking-recalc
/// task can share it.
pub struct Scheduler {
    metainfo: Metainfo,
    config: SchedulerConfig,
    registry: PeerRegistry,
    admitted: Vec<PeerEndpoint>,
    rng: Box<dyn RngSource>,
    session_config: SessionConfig,
}

impl Scheduler {
    pub fn new(
        metainfo: Metainfo,
        admitted: Vec<PeerEndpoint>,
        config: SchedulerConfig,
        rng: Box<dyn RngSource>,
        peer_id: [u8; 20],
    ) -> Self {
        let session_config = SessionConfig {
            info_hash: metainfo.info_hash,
            peer_id,
            num_pieces: metainfo.num_pieces(),
            block_size: config.block_size,
            connect_timeout: config.connect_timeout,
            per_read_timeout: config.per_read_timeout,
        };
        Self {
            metainfo,
            registry: PeerRegistry::new(config.optimistic_unchoke_interval),
            config,
            admitted,
            rng,
            session_config,
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    /// Re-evaluates choking using this scheduler's own randomness
    /// source. Exposed so callers (the engine's periodic 30s timer) don't
    /// need to construct a second `RngSource`.
    pub fn recalculate_choking(&self) {
        self.registry
            .recalculate_choking(self.config.unchoked_peers, self.rng.as_ref());
    }

    fn piece_indices(&self) -> Vec<usize> {
        let total = self.metainfo.num_pieces();
        let limit = self
            .config
            .max_pieces
            .map(|n| (n as usize).min(total))
            .unwrap_or(total);
        if limit < total {
            warn!(limit, total, "max_pieces configured, truncating download");
        }
        (0..limit).collect()
    }

    /// Runs the worker pool to completion: returns the verified piece
    /// buffer in index order, or the fatal [`EngineError`] that ended
    /// the download early.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> EngineResult<Vec<Vec<u8>>> {
        let indices = self.piece_indices();
        let fetched = indices.len();
        let total = self.metainfo.num_pieces();

        let shared = Arc::new(Shared {
            piece_states: Mutex::new(vec![PieceState::Pending; total]),
            pending: Mutex::new(indices.into_iter().collect()),
            tried_peers: Mutex::new(HashMap::new()),
            pieces_buffer: Mutex::new(vec![None; total]),
            verified_count: AtomicUsize::new(0),
            fatal: Mutex::new(None),
        });

        let worker_count = self.config.max_parallel_sessions.min(total.max(1));
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..worker_count {
            let scheduler = Arc::clone(&self);
            let shared = Arc::clone(&shared);
            let mut worker_shutdown = shutdown.clone();
            join_set.spawn(async move { scheduler.worker_loop(&shared, &mut worker_shutdown).await });
        }
        while join_set.join_next().await.is_some() {}

        if *shutdown.borrow_and_update() {
            return Err(EngineError::Cancelled);
        }
        if let Some(i) = *shared.fatal.lock().unwrap() {
            return Err(EngineError::PieceUnobtainable(i));
        }
        if fetched < total {
            return Err(EngineError::Truncated { fetched, total });
        }

        let buffer = shared.pieces_buffer.lock().unwrap().clone();
        Ok(buffer.into_iter().map(|b| b.unwrap_or_default()).collect())
    }

    async fn worker_loop(&self, shared: &Shared, shutdown: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() || shared.fatal.lock().unwrap().is_some() {
                return;
            }
            let piece_index = {
                let mut pending = shared.pending.lock().unwrap();
                pending.pop_front()
            };
            let Some(piece_index) = piece_index else {
                return;
            };

            let peer = match self.pick_peer(shared, piece_index) {
                Some(peer) => peer,
                None => {
                    *shared.fatal.lock().unwrap() = Some(piece_index);
                    return;
                }
            };

            {
                let mut states = shared.piece_states.lock().unwrap();
                states[piece_index] = PieceState::InFlight(peer);
            }

            let addr = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
            let piece_size = self.metainfo.piece_size(piece_index);
            let result = fetch_piece(
                addr,
                &self.session_config,
                piece_index,
                piece_size,
                &self.registry,
            )
            .await;

            self.handle_worker_result(shared, piece_index, peer, result);
        }
    }

    fn pick_peer(&self, shared: &Shared, piece_index: usize) -> Option<PeerEndpoint> {
        let mut candidates = self.registry.best_peers_for_download(self.admitted.len());
        if candidates.is_empty() {
            candidates = self.admitted.clone();
        }
        let tried = shared.tried_peers.lock().unwrap();
        let untried: Vec<PeerEndpoint> = candidates
            .into_iter()
            .filter(|p| !tried.get(&piece_index).is_some_and(|t| t.contains(p)))
            .collect();
        drop(tried);
        if untried.is_empty() {
            return None;
        }
        Some(untried[piece_index % untried.len()])
    }

    fn handle_worker_result(
        &self,
        shared: &Shared,
        piece_index: usize,
        peer: PeerEndpoint,
        result: Result<Vec<u8>, SessionError>,
    ) {
        match result {
            Ok(bytes) => {
                let expected = self.metainfo.piece_digests[piece_index];
                let actual: [u8; 20] = Sha1::digest(&bytes).into();
                if actual == expected {
                    {
                        let mut states = shared.piece_states.lock().unwrap();
                        states[piece_index] = PieceState::Verified;
                    }
                    shared.pieces_buffer.lock().unwrap()[piece_index] = Some(bytes);
                    let verified = shared.verified_count.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(
                        piece_index,
                        verified,
                        total = self.metainfo.num_pieces(),
                        "piece verified"
                    );
                    if verified % 5 == 0 {
                        self.registry
                            .recalculate_choking(self.config.unchoked_peers, self.rng.as_ref());
                    }
                } else {
                    warn!(piece_index, peer_port = peer.port, "digest mismatch, requeuing piece");
                    self.requeue(shared, piece_index, peer);
                }
            }
            Err(err) => {
                info!(piece_index, peer_port = peer.port, error = %err, "session failed, requeuing piece");
                self.requeue(shared, piece_index, peer);
            }
        }
    }

    fn requeue(&self, shared: &Shared, piece_index: usize, peer: PeerEndpoint) {
        {
            let mut states = shared.piece_states.lock().unwrap();
            states[piece_index] = PieceState::Failed;
        }
        shared
            .tried_peers
            .lock()
            .unwrap()
            .entry(piece_index)
            .or_default()
            .insert(peer);
        shared.pending.lock().unwrap().push_back(piece_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            max_parallel_sessions: 2,
            unchoked_peers: 4,
            block_size: 16384,
            connect_timeout: Duration::from_secs(1),
            per_read_timeout: Duration::from_secs(1),
            optimistic_unchoke_interval: Duration::from_secs(30),
            max_pieces: None,
        }
    }

    #[test]
    fn piece_indices_respects_max_pieces() {
        let mut info = std::collections::BTreeMap::new();
        info.insert(b"name".to_vec(), crate::bencode::BencodeValue::ByteStr(b"f".to_vec()));
        info.insert(b"piece length".to_vec(), crate::bencode::BencodeValue::Int(4));
        info.insert(b"pieces".to_vec(), crate::bencode::BencodeValue::ByteStr(vec![0u8; 60]));
        info.insert(b"length".to_vec(), crate::bencode::BencodeValue::Int(12));
        let mut top = std::collections::BTreeMap::new();
        top.insert(
            b"announce".to_vec(),
            crate::bencode::BencodeValue::ByteStr(b"http://t/a".to_vec()),
        );
        top.insert(b"info".to_vec(), crate::bencode::BencodeValue::Dict(info));
        let metainfo = Metainfo::from_value(crate::bencode::BencodeValue::Dict(top)).unwrap();

        let mut config = test_config();
        config.max_pieces = Some(2);
        let scheduler = Scheduler::new(
            metainfo,
            vec![],
            config,
            Box::new(crate::registry::StdRngSource),
            [0u8; 20],
        );
        assert_eq!(scheduler.piece_indices(), vec![0, 1]);
    }
}
