//! Top-level orchestration: loads metainfo, announces to the tracker,
//! runs the scheduler, and writes the verified output.
use crate::config::Config;
use crate::registry::{PeerEndpoint, StdRngSource};
use crate::scheduler::{EngineResult, Scheduler, SchedulerConfig};
use crate::storage::Storage;
use crate::torrent::Metainfo;
use crate::tracker::{self, Client};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::info;

pub async fn run(config: Config) -> EngineResult<()> {
    let started_at = Instant::now();
    let data = std::fs::read(&config.metainfo_path)?;
    let metainfo = Metainfo::from_bytes(&data)?;
    info!(
        name = %metainfo.name,
        pieces = metainfo.num_pieces(),
        total_length = metainfo.total_length,
        "loaded metainfo"
    );

    let tracker_client = Client::new(config.listening_port);
    let announce = tracker_client.announce(&metainfo).await?;
    let peers = tracker::dedup_peers(announce.peers);
    let admitted: Vec<PeerEndpoint> = peers
        .into_iter()
        .filter_map(|p| match p.ip {
            IpAddr::V4(ip) => Some(PeerEndpoint { ip, port: p.port }),
            IpAddr::V6(_) => None,
        })
        .collect();
    info!(peer_count = admitted.len(), "tracker announce succeeded");

    let scheduler_config = SchedulerConfig {
        max_parallel_sessions: config.max_parallel_sessions,
        unchoked_peers: config.unchoked_peers,
        block_size: config.block_size,
        connect_timeout: config.connect_timeout(),
        per_read_timeout: config.per_read_timeout(),
        optimistic_unchoke_interval: config.optimistic_unchoke_interval(),
        max_pieces: config.max_pieces,
    };

    let scheduler = Arc::new(Scheduler::new(
        metainfo,
        admitted,
        scheduler_config,
        Box::new(StdRngSource),
        tracker_client.peer_id(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctrlc_shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, cancelling in-flight sessions");
            let _ = ctrlc_shutdown_tx.send(true);
        }
    });

    let recalc_scheduler = Arc::clone(&scheduler);
    let mut recalc_shutdown = shutdown_rx.clone();
    let recalc_interval = config.optimistic_unchoke_interval();
    let recalc_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(recalc_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = ticker.tick() => recalc_scheduler.recalculate_choking(),
                _ = recalc_shutdown.changed() => break,
            }
        }
    });

    let run_result = Arc::clone(&scheduler).run(shutdown_rx).await;
    recalc_handle.abort();

    let pieces = run_result?;

    let storage = Storage::new(scheduler.metainfo(), config.downloads_dir.clone());
    storage.write_all(&pieces)?;

    let stats = scheduler.registry().snapshot_stats();
    info!(
        total_bytes = scheduler.metainfo().total_length,
        peers_seen = stats.peer_count,
        aggregate_rate = stats.aggregate_download_rate,
        elapsed_secs = started_at.elapsed().as_secs_f64(),
        "download complete"
    );

    Ok(())
}
