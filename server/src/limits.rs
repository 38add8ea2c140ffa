//! Per-IP REST rate limiting and client address resolution.
//!
//! Reads and writes draw from separate buckets (a busy dashboard polling
//! session state must not starve the occasional upload). Buckets are
//! fixed-window counters pruned periodically by the lifecycle supervisor.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

const WINDOW: Duration = Duration::from_secs(60);

struct Bucket {
    count: u32,
    reset_at: Instant,
}

#[derive(Default)]
struct BucketMap {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl BucketMap {
    /// Count one request; true while the IP stays within `cap` for the
    /// current window.
    fn allow(&self, ip: IpAddr, cap: u32) -> bool {
        let mut buckets = self.buckets.lock().expect("rate bucket mutex");
        let now = Instant::now();
        let bucket = buckets.entry(ip).or_insert(Bucket {
            count: 0,
            reset_at: now + WINDOW,
        });
        if now >= bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now + WINDOW;
        }
        bucket.count += 1;
        bucket.count <= cap
    }

    fn prune(&self) {
        let mut buckets = self.buckets.lock().expect("rate bucket mutex");
        let now = Instant::now();
        buckets.retain(|_, bucket| now < bucket.reset_at);
    }
}

/// REST rate limiter: read bucket for GET/HEAD, write bucket for the rest.
#[derive(Default)]
pub struct RateLimits {
    read: BucketMap,
    write: BucketMap,
}

impl RateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_read(&self, ip: IpAddr, cap: u32) -> bool {
        self.read.allow(ip, cap)
    }

    pub fn allow_write(&self, ip: IpAddr, cap: u32) -> bool {
        self.write.allow(ip, cap)
    }

    pub fn prune(&self) {
        self.read.prune();
        self.write.prune();
    }
}

/// Resolve the client address, honoring `trust_proxy` hops of
/// X-Forwarded-For. With `trust_proxy = 0` the socket peer address is
/// authoritative; with N, the Nth-from-last forwarded entry is used (the
/// nearer entries were appended by our own trusted proxies).
pub fn client_ip(peer: SocketAddr, headers: &HeaderMap, trust_proxy: usize) -> IpAddr {
    if trust_proxy == 0 {
        return peer.ip();
    }
    let forwarded: Vec<IpAddr> = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default();
    if forwarded.len() >= trust_proxy {
        forwarded[forwarded.len() - trust_proxy]
    } else {
        // Fewer hops than trusted: take the earliest entry, else the peer.
        forwarded.first().copied().unwrap_or_else(|| peer.ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn buckets_enforce_cap_per_window() {
        let limits = RateLimits::new();
        let addr = ip("10.1.1.1");
        for _ in 0..3 {
            assert!(limits.allow_read(addr, 3));
        }
        assert!(!limits.allow_read(addr, 3));
        // Writes are a separate bucket.
        assert!(limits.allow_write(addr, 3));
        // Other IPs unaffected.
        assert!(limits.allow_read(ip("10.1.1.2"), 3));
    }

    #[test]
    fn prune_keeps_live_buckets() {
        let limits = RateLimits::new();
        let addr = ip("10.2.2.2");
        assert!(limits.allow_read(addr, 10));
        limits.prune();
        // Bucket still inside its window: count continues.
        for _ in 0..9 {
            assert!(limits.allow_read(addr, 10));
        }
        assert!(!limits.allow_read(addr, 10));
    }

    #[test]
    fn client_ip_without_proxy_uses_peer() {
        let peer: SocketAddr = "192.168.1.5:1234".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        assert_eq!(client_ip(peer, &headers, 0), ip("192.168.1.5"));
    }

    #[test]
    fn client_ip_honors_trusted_hops() {
        let peer: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        // One trusted hop: last entry.
        assert_eq!(client_ip(peer, &headers, 1), ip("5.6.7.8"));
        // Two trusted hops: second from last.
        assert_eq!(client_ip(peer, &headers, 2), ip("1.2.3.4"));
        // More trusted hops than entries: earliest entry.
        assert_eq!(client_ip(peer, &headers, 5), ip("1.2.3.4"));
    }

    #[test]
    fn client_ip_falls_back_on_missing_header() {
        let peer: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        let headers = HeaderMap::new();
        assert_eq!(client_ip(peer, &headers, 2), ip("10.0.0.1"));
    }
}
