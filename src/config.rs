//! Command-line configuration surface (§6 "Configuration").
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "leechrs", about = "A leeching-only BitTorrent client")]
pub struct Config {
    /// Path to the `.torrent` metainfo file to download.
    pub metainfo_path: PathBuf,

    /// Directory written output files are rooted under.
    #[arg(long, default_value = "downloads")]
    pub downloads_dir: PathBuf,

    /// Upper bound on concurrent peer connections.
    #[arg(long, default_value_t = 5)]
    pub max_parallel_sessions: usize,

    /// Top peers (K) kept unchoked by the tit-for-tat policy.
    #[arg(long, default_value_t = 4)]
    pub unchoked_peers: usize,

    /// Period, in seconds, for optimistic unchoke rotation.
    #[arg(long, default_value_t = 30)]
    pub optimistic_unchoke_interval_secs: u64,

    /// Bytes per block in `request` messages.
    #[arg(long, default_value_t = 16384)]
    pub block_size: u32,

    /// Per-socket-read deadline, in seconds.
    #[arg(long, default_value_t = 15)]
    pub per_read_timeout_secs: u64,

    /// Per-TCP-connect deadline, in seconds.
    #[arg(long, default_value_t = 15)]
    pub connect_timeout_secs: u64,

    /// Port advertised in the tracker announce; no listener is bound.
    #[arg(long, default_value_t = 6881)]
    pub listening_port: u16,

    /// If set, only the first N pieces are fetched (testing).
    #[arg(long)]
    pub max_pieces: Option<u64>,
}

impl Config {
    pub fn optimistic_unchoke_interval(&self) -> Duration {
        Duration::from_secs(self.optimistic_unchoke_interval_secs)
    }

    pub fn per_read_timeout(&self) -> Duration {
        Duration::from_secs(self.per_read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
