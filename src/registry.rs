//! Peer registry: per-peer statistics and the tit-for-tat choking policy
//! (§4.6), guarded by a single coarse-grained mutex (§9 "Thread-safe
//! mutable maps" — contention at K≈5 peers is negligible, and a single
//! lock avoids the deadlock risk of per-peer locks interacting with the
//! scheduler's completion queue).
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// `(ipv4, port)` — duplicates across announce tiers are collapsed to a
/// set before admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Injectable randomness for the optimistic-unchoke pick (§9 "Global
/// randomness"), so tests can substitute a deterministic sequence.
pub trait RngSource: Send + Sync {
    fn pick_index(&self, len: usize) -> usize;
}

#[derive(Debug, Default)]
pub struct StdRngSource;

impl RngSource for StdRngSource {
    fn pick_index(&self, len: usize) -> usize {
        rand::rng().random_range(0..len)
    }
}

#[derive(Debug, Clone)]
pub struct PeerStats {
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub we_choke_them: bool,
    pub they_choke_us: bool,
    pub they_interested: bool,
    pub we_interested: bool,
    pub connected_at: Instant,
    last_download_time: Option<Instant>,
    last_upload_time: Option<Instant>,
}

impl PeerStats {
    fn new() -> Self {
        Self {
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            download_rate: 0.0,
            upload_rate: 0.0,
            we_choke_them: true,
            they_choke_us: true,
            they_interested: false,
            we_interested: false,
            connected_at: Instant::now(),
            last_download_time: None,
            last_upload_time: None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    peers: HashMap<PeerEndpoint, PeerStats>,
    last_optimistic_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct RegistryStats {
    pub peer_count: usize,
    pub unchoked_count: usize,
    pub total_downloaded: u64,
    pub aggregate_download_rate: f64,
}

#[derive(Debug)]
pub struct PeerRegistry {
    inner: Mutex<Inner>,
    optimistic_unchoke_interval: Duration,
}

impl PeerRegistry {
    /// `optimistic_unchoke_interval` is the configured period (§6) between
    /// optimistic-unchoke rotations; matches the original's
    /// `self.last_optimistic_unchoke = time.time()` at construction, so the
    /// very first `recalculate_choking` call isn't spuriously "due".
    pub fn new(optimistic_unchoke_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                last_optimistic_at: Some(Instant::now()),
            }),
            optimistic_unchoke_interval,
        }
    }

    /// Ensures `endpoint` has a `PeerStats` entry; a no-op if already admitted.
    pub fn admit(&self, endpoint: PeerEndpoint) {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.entry(endpoint).or_insert_with(PeerStats::new);
    }

    /// Updates the download rate EMA (α=0.2) and byte counter for `endpoint`
    /// after receiving `n` bytes (§4.6 "Rate update").
    pub fn record_download(&self, endpoint: PeerEndpoint, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let stats = inner.peers.entry(endpoint).or_insert_with(PeerStats::new);
        if let Some(last) = stats.last_download_time {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instantaneous = n as f64 / dt;
                stats.download_rate = 0.8 * stats.download_rate + 0.2 * instantaneous;
            }
        }
        stats.bytes_downloaded += n;
        stats.last_download_time = Some(now);
    }

    #[allow(dead_code)]
    pub fn record_upload(&self, endpoint: PeerEndpoint, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let stats = inner.peers.entry(endpoint).or_insert_with(PeerStats::new);
        if let Some(last) = stats.last_upload_time {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instantaneous = n as f64 / dt;
                stats.upload_rate = 0.8 * stats.upload_rate + 0.2 * instantaneous;
            }
        }
        stats.bytes_uploaded += n;
        stats.last_upload_time = Some(now);
    }

    pub fn set_they_choke_us(&self, endpoint: PeerEndpoint, value: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .peers
            .entry(endpoint)
            .or_insert_with(PeerStats::new)
            .they_choke_us = value;
    }

    pub fn set_they_interested(&self, endpoint: PeerEndpoint, value: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .peers
            .entry(endpoint)
            .or_insert_with(PeerStats::new)
            .they_interested = value;
    }

    pub fn set_we_interested(&self, endpoint: PeerEndpoint, value: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .peers
            .entry(endpoint)
            .or_insert_with(PeerStats::new)
            .we_interested = value;
    }

    pub fn we_interested(&self, endpoint: PeerEndpoint) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .peers
            .get(&endpoint)
            .map(|s| s.we_interested)
            .unwrap_or(false)
    }

    pub fn they_choke_us(&self, endpoint: PeerEndpoint) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .peers
            .get(&endpoint)
            .map(|s| s.they_choke_us)
            .unwrap_or(true)
    }

    /// Re-evaluates which peers we unchoke (§4.6): top `k-1` by
    /// `download_rate` (ties broken by older `connected_at`), plus one
    /// fill slot drawn strictly from outside that top set — either a
    /// fresh random pick (if the 30s optimistic timer is due) or the
    /// next-best candidate otherwise. Returns the unchoked set.
    pub fn recalculate_choking(&self, k: usize, rng: &dyn RngSource) -> HashSet<PeerEndpoint> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        let mut candidates: Vec<PeerEndpoint> = inner
            .peers
            .iter()
            .filter(|(_, s)| s.they_interested && !s.they_choke_us)
            .map(|(e, _)| *e)
            .collect();
        candidates.sort_by(|a, b| {
            let sa = &inner.peers[a];
            let sb = &inner.peers[b];
            sb.download_rate
                .partial_cmp(&sa.download_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| sa.connected_at.cmp(&sb.connected_at))
        });

        let top_n = k.saturating_sub(1).min(candidates.len());
        let mut unchoked: HashSet<PeerEndpoint> = candidates[..top_n].iter().copied().collect();
        let remaining = &candidates[top_n..];

        let optimistic_due = inner
            .last_optimistic_at
            .map(|t| now.duration_since(t) >= self.optimistic_unchoke_interval)
            .unwrap_or(true);

        if !remaining.is_empty() {
            if optimistic_due {
                let pick = rng.pick_index(remaining.len());
                unchoked.insert(remaining[pick]);
                inner.last_optimistic_at = Some(now);
                debug!(?remaining, pick, "optimistic unchoke fired");
            } else {
                // Fill from the best candidate strictly outside the top
                // k-1, not from inside it (§9 open question).
                unchoked.insert(remaining[0]);
            }
        }

        for (endpoint, stats) in inner.peers.iter_mut() {
            stats.we_choke_them = !unchoked.contains(endpoint);
        }
        unchoked
    }

    /// Candidates with `!they_choke_us`, sorted by `download_rate`
    /// descending, up to `count` (§4.6 "Best peers for download").
    pub fn best_peers_for_download(&self, count: usize) -> Vec<PeerEndpoint> {
        let inner = self.inner.lock().unwrap();
        let mut ranked: Vec<(PeerEndpoint, f64)> = inner
            .peers
            .iter()
            .filter(|(_, s)| !s.they_choke_us)
            .map(|(e, s)| (*e, s.download_rate))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.into_iter().take(count).map(|(e, _)| e).collect()
    }

    pub fn snapshot_stats(&self) -> RegistryStats {
        let inner = self.inner.lock().unwrap();
        let total_downloaded = inner.peers.values().map(|s| s.bytes_downloaded).sum();
        let aggregate_download_rate = inner.peers.values().map(|s| s.download_rate).sum();
        let unchoked_count = inner.peers.values().filter(|s| !s.we_choke_them).count();
        RegistryStats {
            peer_count: inner.peers.len(),
            unchoked_count,
            total_downloaded,
            aggregate_download_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRng(usize);
    impl RngSource for FixedRng {
        fn pick_index(&self, _len: usize) -> usize {
            self.0
        }
    }

    fn endpoint(port: u16) -> PeerEndpoint {
        PeerEndpoint {
            ip: Ipv4Addr::new(127, 0, 0, 1),
            port,
        }
    }

    fn test_registry() -> PeerRegistry {
        PeerRegistry::new(Duration::from_secs(30))
    }

    #[test]
    fn rate_ema_converges_to_constant_rate() {
        // Property 5: feeding (n, dt) with n/dt = r repeatedly drives
        // download_rate -> r within 1% after >= 20 updates.
        let registry = test_registry();
        let e = endpoint(1);
        registry.admit(e);
        let r = 1000.0;
        {
            let mut inner = registry.inner.lock().unwrap();
            let stats = inner.peers.get_mut(&e).unwrap();
            stats.last_download_time = Some(Instant::now() - Duration::from_secs(1));
        }
        for _ in 0..40 {
            registry.record_download(e, 1000);
            let mut inner = registry.inner.lock().unwrap();
            let stats = inner.peers.get_mut(&e).unwrap();
            stats.last_download_time = Some(Instant::now() - Duration::from_secs(1));
        }
        let rate = {
            let inner = registry.inner.lock().unwrap();
            inner.peers[&e].download_rate
        };
        assert!((rate - r).abs() / r < 0.01, "rate {} did not converge to {}", rate, r);
    }

    #[test]
    fn choking_fairness_ties_broken_by_connected_at() {
        // Property 6: among peers with identical download_rate, older
        // connected_at wins the top slot.
        let registry = test_registry();
        let older = endpoint(1);
        let newer = endpoint(2);
        registry.admit(older);
        std::thread::sleep(Duration::from_millis(2));
        registry.admit(newer);
        registry.set_they_interested(older, true);
        registry.set_they_interested(newer, true);
        registry.set_they_choke_us(older, false);
        registry.set_they_choke_us(newer, false);

        let unchoked = registry.recalculate_choking(2, &FixedRng(0));
        assert!(unchoked.contains(&older));
    }

    #[test]
    fn optimistic_fill_comes_from_outside_top_k() {
        // Property: once the optimistic timer is due, the fill slot is a
        // random pick from strictly outside the top k-1, never from inside it.
        let registry = test_registry();
        let top = endpoint(1);
        let outside_a = endpoint(2);
        let outside_b = endpoint(3);
        for e in [top, outside_a, outside_b] {
            registry.admit(e);
            registry.set_they_interested(e, true);
            registry.set_they_choke_us(e, false);
        }
        registry.record_download(top, 10_000);

        {
            let mut inner = registry.inner.lock().unwrap();
            inner.last_optimistic_at = Some(Instant::now() - Duration::from_secs(31));
        }

        let unchoked = registry.recalculate_choking(2, &FixedRng(1));
        assert!(unchoked.contains(&top));
        assert!(unchoked.contains(&outside_b));
        assert!(!unchoked.contains(&outside_a));
    }

    #[test]
    fn fill_uses_best_remaining_when_optimistic_not_due() {
        // A freshly constructed registry seeds last_optimistic_at at
        // construction time (matching the original's behavior), so the
        // very first recalculation is never spuriously "due": the fill
        // slot goes to the best remaining candidate, not a random pick.
        let registry = test_registry();
        let top = endpoint(1);
        let outside_a = endpoint(2);
        let outside_b = endpoint(3);
        for e in [top, outside_a, outside_b] {
            registry.admit(e);
            registry.set_they_interested(e, true);
            registry.set_they_choke_us(e, false);
        }
        registry.record_download(top, 10_000);

        let unchoked = registry.recalculate_choking(2, &FixedRng(1));
        assert!(unchoked.contains(&top));
        assert!(unchoked.contains(&outside_a));
        assert!(!unchoked.contains(&outside_b));
    }

    #[test]
    fn best_peers_excludes_choking_peers() {
        let registry = test_registry();
        let fast = endpoint(1);
        let choking = endpoint(2);
        registry.admit(fast);
        registry.admit(choking);
        registry.record_download(fast, 1);
        registry.set_they_choke_us(choking, true);
        registry.set_they_choke_us(fast, false);

        let best = registry.best_peers_for_download(5);
        assert_eq!(best, vec![fast]);
    }
}
