//! Lifecycle supervisor tasks: keepalive ping/pong sweep, stale-session
//! reaper, rate-limit pruning, and shutdown plumbing. Each runs on its own
//! interval and exits when the shutdown token fires.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;

use common::config;
use common::registry::PRODUCT;

use crate::web_server::AppState;

/// Keepalive sweep interval. A peer that fails to pong between two sweeps
/// is considered dead.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Stale-session reaper interval.
const REAPER_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Failure-bucket and rate-bucket prune interval.
const PRUNE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub fn spawn_supervisors(state: &AppState) {
    tokio::spawn(keepalive_loop(state.clone()));
    tokio::spawn(reaper_loop(state.clone()));
    tokio::spawn(prune_loop(state.clone()));
}

/// Every sweep: connections that never answered the previous ping are
/// cancelled; the rest get their flag cleared and a fresh ping.
async fn keepalive_loop(state: AppState) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.tick().await; // immediate first tick is not a sweep
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let mut dead = 0usize;
        for entry in state.conns.iter() {
            if entry.alive.swap(false, Ordering::AcqRel) {
                entry.outbound.send(Message::Ping(Bytes::new()));
            } else {
                entry.token.cancel();
                dead += 1;
            }
        }
        if dead > 0 {
            tracing::info!(count = dead, "terminated unresponsive connections");
        }
    }
}

/// Hourly: kill gateway-owned tmux sessions that have no bound connection
/// and have been idle past the TTL. tmux's own activity timestamp stands
/// in for "last attached", so the TTL survives server restarts.
async fn reaper_loop(state: AppState) {
    let ttl_secs = config::ensure_loaded().session_ttl_hours as i64 * 3600;
    let mut ticker = tokio::time::interval(REAPER_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let sessions = match state.mux.list_all_with_activity().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(error = %e, "reaper could not list sessions");
                continue;
            }
        };
        let active: std::collections::HashSet<String> =
            state.registry.active_names().into_iter().collect();
        let now = chrono::Utc::now().timestamp();

        for session in sessions {
            if !session.name.starts_with(PRODUCT) || active.contains(&session.name) {
                continue;
            }
            if now - session.activity > ttl_secs {
                tracing::info!(session = %session.name, "reaping stale session");
                if let Err(e) = state.mux.kill(&session.name).await {
                    tracing::warn!(session = %session.name, error = %e, "reap failed");
                }
            }
        }
    }
}

async fn prune_loop(state: AppState) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        state.failures.prune();
        state.limits.prune();
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Force-exit if orderly shutdown hangs. Plain thread so a wedged runtime
/// cannot stall it.
pub fn spawn_shutdown_watchdog() {
    std::thread::spawn(|| {
        std::thread::sleep(Duration::from_secs(5));
        tracing::error!("shutdown watchdog fired, forcing exit");
        std::process::exit(1);
    });
}
