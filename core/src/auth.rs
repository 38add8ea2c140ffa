//! Token auth primitives: identity derivation, constant-time compare,
//! per-IP failure buckets, and the pending-auth slot counter.
//!
//! The auth token never appears in URLs or logs; WebSocket clients send it
//! as the payload of their first `auth` control frame, REST clients as a
//! bearer header. Either way the token is reduced to a short digest prefix
//! (the "identity key") that namespaces session names and store records.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Hex chars of the SHA-256 digest kept as the identity key.
const IDENTITY_PREFIX_LEN: usize = 16;

/// Identity used when no auth token is configured.
pub const DEFAULT_IDENTITY: &str = "default";

/// Auth failures allowed per IP inside one window.
const FAILURE_LIMIT: u32 = 5;

/// Length of the per-IP failure window.
const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Cap on connections sitting in the pre-auth state.
pub const PENDING_AUTH_CAP: usize = 50;

/// Derive the stable identity key for a token: a fixed-length hex prefix of
/// its SHA-256 digest. Empty token means auth is disabled and all
/// connections share [`DEFAULT_IDENTITY`].
pub fn identity_key(token: &str) -> String {
    if token.is_empty() {
        return DEFAULT_IDENTITY.to_string();
    }
    use std::fmt::Write;
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(IDENTITY_PREFIX_LEN);
    for byte in digest.iter().take(IDENTITY_PREFIX_LEN / 2) {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Constant-time byte comparison. A length mismatch returns false without
/// inspecting content; equal-length inputs are always scanned in full.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Check a presented token against the configured one. An empty configured
/// token accepts anything (auth disabled).
pub fn verify_token(configured: &str, presented: &str) -> bool {
    if configured.is_empty() {
        return true;
    }
    constant_time_eq(configured, presented)
}

#[derive(Clone, Copy)]
struct FailureBucket {
    count: u32,
    reset_at: Instant,
}

/// Per-IP auth failure tracker. Five failures inside a 60 s window block the
/// address until the window expires. `prune` bounds memory and is driven by
/// the lifecycle supervisor.
#[derive(Default)]
pub struct FailureTracker {
    buckets: Mutex<HashMap<IpAddr, FailureBucket>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed auth attempt from `ip`.
    pub fn record_failure(&self, ip: IpAddr) {
        let mut buckets = self.buckets.lock().expect("failure buckets mutex");
        let now = Instant::now();
        let bucket = buckets.entry(ip).or_insert(FailureBucket {
            count: 0,
            reset_at: now + FAILURE_WINDOW,
        });
        if now >= bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now + FAILURE_WINDOW;
        }
        bucket.count += 1;
    }

    /// True if `ip` is currently blocked from authenticating.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let buckets = self.buckets.lock().expect("failure buckets mutex");
        match buckets.get(&ip) {
            Some(bucket) => Instant::now() < bucket.reset_at && bucket.count >= FAILURE_LIMIT,
            None => false,
        }
    }

    /// Drop expired buckets.
    pub fn prune(&self) {
        let mut buckets = self.buckets.lock().expect("failure buckets mutex");
        let now = Instant::now();
        buckets.retain(|_, bucket| now < bucket.reset_at);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

/// Shared counter of connections waiting for their first auth frame. When
/// the cap is reached, new connections are rejected up front (close 4006)
/// so unauthenticated sockets cannot pile up.
#[derive(Default)]
pub struct PendingAuthSlots {
    count: Arc<AtomicUsize>,
}

impl PendingAuthSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take a slot. Returns a guard that releases on drop, or None
    /// when the cap is reached.
    pub fn acquire(&self) -> Option<PendingAuthGuard> {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current >= PENDING_AUTH_CAP {
                return None;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(PendingAuthGuard {
                        count: Arc::clone(&self.count),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

/// RAII slot held while a connection is pre-auth. Dropped on successful
/// auth, failed auth, or close-while-pending.
pub struct PendingAuthGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for PendingAuthGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}
