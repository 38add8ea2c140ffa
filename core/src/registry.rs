//! Session registry: which connection currently owns which session name.
//!
//! The registry holds at most one entry per session name. Binding over a
//! live entry kicks the prior owner (close 4002); unbinding is guarded by
//! connection identity so a reconnect race cannot remove the new owner's
//! entry (the registry never keeps connections alive, it only signals them).

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::CLOSE_REPLACED;

/// Session name prefix for everything this gateway manages.
pub const PRODUCT: &str = "webmux";

/// Longest user-supplied session suffix.
pub const MAX_SUFFIX_LEN: usize = 64;

/// Channel used to tell a connection task to close with a given code.
pub type KickSender = mpsc::UnboundedSender<u16>;
pub type KickReceiver = mpsc::UnboundedReceiver<u16>;

/// `[A-Za-z0-9_-]{1,64}`: the only user-supplied session ids accepted.
pub fn valid_suffix(suffix: &str) -> bool {
    !suffix.is_empty()
        && suffix.len() <= MAX_SUFFIX_LEN
        && suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Prefix owned by an identity: `webmux-<identity>`.
pub fn identity_prefix(identity: &str) -> String {
    format!("{PRODUCT}-{identity}")
}

/// Full session name. The suffix must already be validated; the server
/// controls everything before it.
pub fn session_name(identity: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => format!("{PRODUCT}-{identity}-{suffix}"),
        None => identity_prefix(identity),
    }
}

struct BoundConn {
    conn_id: Uuid,
    kick: KickSender,
}

/// Process-wide map of session name to the connection bound to it.
#[derive(Clone, Default)]
pub struct Registry {
    map: Arc<DashMap<String, BoundConn>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `conn_id` as the owner of `name`. A prior owner is kicked
    /// with close code 4002 before the new entry is visible.
    pub fn bind(&self, name: &str, conn_id: Uuid, kick: KickSender) {
        if let Some(prior) = self.map.insert(name.to_string(), BoundConn { conn_id, kick }) {
            let _ = prior.kick.send(CLOSE_REPLACED);
        }
    }

    /// Remove the entry for `name` only if `conn_id` still owns it. A
    /// kicked connection unbinding late must not evict its replacement.
    pub fn unbind(&self, name: &str, conn_id: Uuid) {
        self.map.remove_if(name, |_, bound| bound.conn_id == conn_id);
    }

    /// Snapshot of all currently bound names. May be slightly stale with
    /// respect to concurrent binds; the reaper tolerates that.
    pub fn active_names(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    /// Open connections whose session name starts with `prefix`; enforces
    /// the per-identity connection cap.
    pub fn count_for_identity_prefix(&self, prefix: &str) -> usize {
        self.map.iter().filter(|e| e.key().starts_with(prefix)).count()
    }

    /// True if `conn_id` currently owns `name`.
    pub fn owns(&self, name: &str, conn_id: Uuid) -> bool {
        self.map
            .get(name)
            .map(|bound| bound.conn_id == conn_id)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> (Uuid, KickSender, KickReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Uuid::new_v4(), tx, rx)
    }

    #[test]
    fn suffix_validation_boundaries() {
        assert!(valid_suffix("abc"));
        assert!(valid_suffix("A-b_9"));
        assert!(valid_suffix(&"x".repeat(64)));
        assert!(!valid_suffix(&"x".repeat(65)));
        assert!(!valid_suffix(""));
        assert!(!valid_suffix("a/b"));
        assert!(!valid_suffix("a b"));
        assert!(!valid_suffix("a.b"));
    }

    #[test]
    fn names_compose_from_identity_and_suffix() {
        assert_eq!(session_name("deadbeef", None), "webmux-deadbeef");
        assert_eq!(session_name("deadbeef", Some("abc")), "webmux-deadbeef-abc");
        assert_eq!(identity_prefix("deadbeef"), "webmux-deadbeef");
    }

    #[test]
    fn rebind_kicks_prior_owner() {
        let registry = Registry::new();
        let (id_a, kick_a, mut rx_a) = conn();
        let (id_b, kick_b, mut rx_b) = conn();

        registry.bind("webmux-x-s", id_a, kick_a);
        registry.bind("webmux-x-s", id_b, kick_b);

        assert_eq!(rx_a.try_recv().unwrap(), CLOSE_REPLACED);
        assert!(rx_b.try_recv().is_err());
        assert!(registry.owns("webmux-x-s", id_b));
        assert!(!registry.owns("webmux-x-s", id_a));
    }

    #[test]
    fn unbind_is_aba_safe() {
        let registry = Registry::new();
        let (id_a, kick_a, _rx_a) = conn();
        let (id_b, kick_b, _rx_b) = conn();

        registry.bind("webmux-x-s", id_a, kick_a);
        registry.bind("webmux-x-s", id_b, kick_b);

        // The kicked connection tears down late; the new owner survives.
        registry.unbind("webmux-x-s", id_a);
        assert!(registry.owns("webmux-x-s", id_b));

        registry.unbind("webmux-x-s", id_b);
        assert!(registry.active_names().is_empty());
    }

    #[test]
    fn prefix_count_scopes_by_identity() {
        let registry = Registry::new();
        let (id_a, kick_a, _ra) = conn();
        let (id_b, kick_b, _rb) = conn();
        let (id_c, kick_c, _rc) = conn();

        registry.bind("webmux-aaaa-one", id_a, kick_a);
        registry.bind("webmux-aaaa-two", id_b, kick_b);
        registry.bind("webmux-bbbb-one", id_c, kick_c);

        assert_eq!(registry.count_for_identity_prefix("webmux-aaaa"), 2);
        assert_eq!(registry.count_for_identity_prefix("webmux-bbbb"), 1);
        assert_eq!(registry.count_for_identity_prefix("webmux-cccc"), 0);

        let mut names = registry.active_names();
        names.sort();
        assert_eq!(names, ["webmux-aaaa-one", "webmux-aaaa-two", "webmux-bbbb-one"]);
    }
}
