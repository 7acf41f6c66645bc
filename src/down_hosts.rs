//! Process-wide cache of recently unreachable hosts
//!
//! A host that fails a connect attempt is remembered here for a fixed
//! time-to-live. Later attempts still try it, but only after every host
//! not known to be down. Entries expire via a lazy sweep that runs at most
//! once per sweep interval, piggybacked on ordinary calls.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Default entry lifetime
const DEFAULT_TTL: Duration = Duration::from_secs(600);
/// Minimum spacing between expiry sweeps
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct DownHostsCache {
    state: Mutex<State>,
    ttl: Duration,
    sweep_interval: Duration,
}

#[derive(Debug)]
struct State {
    hosts: HashMap<String, Instant>,
    last_sweep: Instant,
}

impl DownHostsCache {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                hosts: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            ttl,
            sweep_interval,
        }
    }

    /// Record a failed host so later attempts deprioritize it
    pub fn mark_down(&self, host: &str) {
        debug!(host, "marking host down");
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.hosts.insert(host.to_string(), now);
        state.maybe_sweep(now, self.ttl, self.sweep_interval);
    }

    pub fn is_down(&self, host: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.maybe_sweep(now, self.ttl, self.sweep_interval);
        match state.hosts.get(host) {
            Some(at) => now.duration_since(*at) < self.ttl,
            None => false,
        }
    }

    /// Stable partition moving entries whose host is down to the end.
    ///
    /// Relative order is preserved within both the up and down groups.
    pub fn reorder<T>(&self, items: &mut [T], host_of: impl Fn(&T) -> &str) {
        let down: Vec<bool> = items.iter().map(|it| self.is_down(host_of(it))).collect();
        if !down.iter().any(|&d| d) {
            return;
        }
        // rotations only move already-visited elements, so the precomputed
        // flags stay aligned with the unvisited tail
        let mut write = 0;
        for read in 0..items.len() {
            if !down[read] {
                items[write..=read].rotate_right(1);
                write += 1;
            }
        }
    }
}

impl Default for DownHostsCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_SWEEP_INTERVAL)
    }
}

impl State {
    fn maybe_sweep(&mut self, now: Instant, ttl: Duration, interval: Duration) {
        if now.duration_since(self.last_sweep) < interval {
            return;
        }
        self.last_sweep = now;
        self.hosts.retain(|_, at| now.duration_since(*at) < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorder_moves_down_hosts_to_end() {
        let cache = DownHostsCache::default();
        cache.mark_down("b");
        cache.mark_down("d");
        let mut hosts = vec!["a", "b", "c", "d", "e"];
        cache.reorder(&mut hosts, |h| h);
        assert_eq!(hosts, vec!["a", "c", "e", "b", "d"]);
    }

    #[test]
    fn reorder_preserves_order_when_nothing_down() {
        let cache = DownHostsCache::default();
        let mut hosts = vec!["a", "b", "c"];
        cache.reorder(&mut hosts, |h| h);
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = DownHostsCache::new(Duration::from_millis(0), Duration::from_secs(60));
        cache.mark_down("a");
        assert!(!cache.is_down("a"));
    }

    #[test]
    fn down_host_still_reported_within_ttl() {
        let cache = DownHostsCache::default();
        cache.mark_down("a");
        assert!(cache.is_down("a"));
        assert!(!cache.is_down("z"));
    }
}
