//! Per-session byte counters and the process-wide stats registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

/// Counters for one session, shared by the client-side and backend-side
/// engines. `sent` is incremented by the client-side engine forwarding
/// toward the backend; `recv` by the backend-side engine forwarding toward
/// the client.
#[derive(Debug)]
pub struct Stats {
    pub sent: AtomicU64,
    pub recv: AtomicU64,
    start: Instant,
    end: OnceLock<Instant>,
    pub source: SocketAddr,
    pub destination: Mutex<Option<SocketAddr>>,
}

impl Stats {
    pub fn new(source: SocketAddr) -> Arc<Self> {
        Arc::new(Stats {
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            start: Instant::now(),
            end: OnceLock::new(),
            source,
            destination: Mutex::new(None),
        })
    }

    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_recv(&self, n: u64) {
        self.recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_destination(&self, dst: SocketAddr) {
        *self.destination.lock().unwrap() = Some(dst);
    }

    /// Mark the session closed. Idempotent: only the first call records the
    /// end timestamp.
    pub fn close(&self) {
        let _ = self.end.set(Instant::now());
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }

    pub fn duration_secs(&self) -> u64 {
        let end = self.end.get().copied().unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.start).as_secs()
    }
}

/// Process-wide collection of live [`Stats`], keyed by a monotonically
/// increasing connection id. Holds only weak references so a session's
/// `Stats` is dropped as soon as both engines release their `Arc`s; the
/// registry itself only ever reads through the `Weak` handles, pruning dead
/// entries as it goes.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, Weak<Stats>>>,
    total_sessions: AtomicU64,
    start: OnceLock<Instant>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let registry = Registry {
            next_id: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
            total_sessions: AtomicU64::new(0),
            start: OnceLock::new(),
        };
        let _ = registry.start.set(Instant::now());
        Arc::new(registry)
    }

    /// Register a new session's stats, returning its connection id.
    pub fn insert(&self, stats: &Arc<Stats>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().unwrap().insert(id, Arc::downgrade(stats));
        id
    }

    /// One record per live session: `(source, destination, sent, recv, duration_secs)`.
    pub fn detailed(&self) -> Vec<(SocketAddr, Option<SocketAddr>, u64, u64, u64)> {
        let mut sessions = self.sessions.lock().unwrap();
        let mut rows = Vec::new();
        sessions.retain(|_, weak| {
            if let Some(stats) = weak.upgrade() {
                rows.push((
                    stats.source,
                    *stats.destination.lock().unwrap(),
                    stats.sent(),
                    stats.recv(),
                    stats.duration_secs(),
                ));
                true
            } else {
                false
            }
        });
        rows
    }

    /// `(live_sessions, total_sessions, total_sent, total_recv, uptime_secs)`.
    pub fn summary(&self) -> (usize, u64, u64, u64, u64) {
        let rows = self.detailed();
        let live = rows.len();
        let total_sent: u64 = rows.iter().map(|r| r.2).sum();
        let total_recv: u64 = rows.iter().map(|r| r.3).sum();
        let uptime = self
            .start
            .get()
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);
        (
            live,
            self.total_sessions.load(Ordering::Relaxed),
            total_sent,
            total_recv,
            uptime,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn registry_tracks_live_sessions_until_dropped() {
        let registry = Registry::new();
        let stats = Stats::new(addr(1));
        registry.insert(&stats);
        stats.add_sent(5);
        stats.add_recv(7);

        let rows = registry.detailed();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2, 5);
        assert_eq!(rows[0].3, 7);

        drop(stats);
        assert_eq!(registry.detailed().len(), 0);
    }

    #[test]
    fn summary_aggregates_across_sessions() {
        let registry = Registry::new();
        let a = Stats::new(addr(1));
        let b = Stats::new(addr(2));
        registry.insert(&a);
        registry.insert(&b);
        a.add_sent(3);
        b.add_sent(4);

        let (live, total, sent, _recv, _uptime) = registry.summary();
        assert_eq!(live, 2);
        assert_eq!(total, 2);
        assert_eq!(sent, 7);
    }

    #[test]
    fn close_is_idempotent() {
        let stats = Stats::new(addr(1));
        stats.close();
        let first = stats.duration_secs();
        stats.close();
        let second = stats.duration_secs();
        assert_eq!(first, second);
    }
}
