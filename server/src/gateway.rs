//! Connection gateway: one task per accepted WebSocket.
//!
//! State machine: `accepted` (awaiting the first `auth` frame under a 5 s
//! deadline) → `authenticated` → `bound` (PTY attached, pumping). Kicks,
//! PTY exit, shutdown, and keepalive termination all funnel into the same
//! select loop so teardown runs exactly once.
//!
//! The socket's send side is owned by a writer task fed through an
//! unbounded channel. An atomic counter tracks payload bytes queued but not
//! yet written; that counter is the "queued-byte count" the backpressure
//! watermarks act on, checked after each enqueue so the chunk that crosses
//! the line is still delivered.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::auth::{identity_key, verify_token, PendingAuthGuard};
use common::config;
use common::mux::MuxAdapter;
use common::protocol::{
    binary_frame, parse_binary_frame, ClientMsg, ServerMsg, CLOSE_GOING_AWAY, CLOSE_INIT_FAILED,
    CLOSE_INVALID_SESSION_ID, CLOSE_NORMAL, CLOSE_TOO_MANY_CONNECTIONS, CLOSE_TOO_MANY_PENDING,
    CLOSE_UNAUTHORIZED, TAG_FILE_CHUNK, TAG_INPUT, TAG_OUTPUT, TAG_SCROLLBACK,
    TAG_SCROLLBACK_CONTENT,
};
use common::pty::PtyChannel;
use common::registry::{identity_prefix, session_name, valid_suffix, KickReceiver};
use common::sandbox;

use crate::limits::client_ip;
use crate::web_server::AppState;

/// Deadline for the first `auth` frame.
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket queued-byte watermarks for the PTY pump.
const HIGH_WATERMARK: usize = 1024 * 1024;
const LOW_WATERMARK: usize = 512 * 1024;

/// Watermarks for the file-stream subprotocol (same values, separate
/// meaning: they gate the file reader, not the PTY).
const STREAM_HIGH_WATERMARK: usize = 1024 * 1024;
const STREAM_LOW_WATERMARK: usize = 512 * 1024;

/// Largest file the in-band stream will serve.
const STREAM_MAX_SIZE: u64 = 50 * 1024 * 1024;

/// File-stream read unit.
const STREAM_READ_SIZE: usize = 64 * 1024;

/// Minimum spacing between `capture-scrollback` requests per connection.
const CAPTURE_MIN_INTERVAL: Duration = Duration::from_secs(2);

/// Terminal dimension clamp range.
const MIN_DIM: u16 = 1;
const MAX_DIM: u16 = 500;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

fn clamp_dim(v: u16) -> u16 {
    v.clamp(MIN_DIM, MAX_DIM)
}

/// Commands for the writer task.
pub enum OutboundCmd {
    Msg(Message),
    /// Send a close frame with this code, then stop writing.
    Close { code: u16, reason: String },
    /// Stop writing without a close frame (dead peer).
    Terminate,
}

/// Handle to a connection's outbound pump. Cloned into the file-stream and
/// capture tasks; `queued` counts payload bytes accepted but not yet
/// written to the socket.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<OutboundCmd>,
    queued: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

fn payload_len(msg: &Message) -> usize {
    match msg {
        Message::Text(t) => t.len(),
        Message::Binary(b) => b.len(),
        _ => 0,
    }
}

impl Outbound {
    fn new(tx: mpsc::UnboundedSender<OutboundCmd>, queued: Arc<AtomicUsize>, drained: Arc<Notify>) -> Self {
        Self { tx, queued, drained }
    }

    /// Enqueue a message and return the queued-byte count after it.
    pub fn send(&self, msg: Message) -> usize {
        let len = payload_len(&msg);
        let after = self.queued.fetch_add(len, Ordering::AcqRel) + len;
        let _ = self.tx.send(OutboundCmd::Msg(msg));
        after
    }

    pub fn send_json(&self, msg: &ServerMsg) -> usize {
        self.send(Message::Text(msg.to_json().into()))
    }

    pub fn send_binary(&self, tag: u8, payload: &[u8]) -> usize {
        self.send(Message::Binary(binary_frame(tag, payload)))
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(OutboundCmd::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn terminate(&self) {
        let _ = self.tx.send(OutboundCmd::Terminate);
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves on the next drain notification (queued bytes fell under
    /// the low watermark).
    pub async fn drained(&self) {
        self.drained.notified().await;
    }
}

/// Per-connection entry in the process-wide table the keepalive sweep
/// iterates. Cancelling `token` tears the connection down abruptly (dead
/// peer); `alive` flips false on each sweep and true on every pong.
pub struct ConnEntry {
    pub alive: Arc<AtomicBool>,
    pub outbound: Outbound,
    pub token: CancellationToken,
}

pub type ConnTable = Arc<DashMap<Uuid, ConnEntry>>;

#[derive(serde::Deserialize)]
pub struct WsQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    /// Working directory for a newly created session.
    cwd: Option<String>,
    /// Initial terminal dimensions.
    cols: Option<u16>,
    rows: Option<u16>,
}

/// GET /ws?sessionId=<suffix>. The auth token travels in the first `auth`
/// frame, never in the URL, so it stays out of access logs.
pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<std::net::SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let cfg = config::ensure_loaded();
    let ip = client_ip(peer, &headers, cfg.trust_proxy);

    if let Some(suffix) = query.session_id.as_deref() {
        if !valid_suffix(suffix) {
            return ws.on_upgrade(|socket| {
                close_immediately(socket, CLOSE_INVALID_SESSION_ID, "invalid sessionId")
            });
        }
    }

    if state.failures.is_blocked(ip) {
        return ws.on_upgrade(|socket| {
            close_immediately(socket, CLOSE_UNAUTHORIZED, "too many auth failures")
        });
    }

    let pending = if cfg.auth_enabled() {
        match state.pending.acquire() {
            Some(guard) => Some(guard),
            None => {
                return ws.on_upgrade(|socket| {
                    close_immediately(socket, CLOSE_TOO_MANY_PENDING, "too many pending auth")
                })
            }
        }
    } else {
        None
    };

    ws.on_upgrade(move |socket| run_connection(socket, state, query, ip, pending))
}

async fn close_immediately(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Writer task: the only place that touches the socket's send half.
async fn writer_task(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundCmd>,
    queued: Arc<AtomicUsize>,
    drained: Arc<Notify>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            OutboundCmd::Msg(msg) => {
                let len = payload_len(&msg);
                let sent = ws_tx.send(msg).await.is_ok();
                let after = queued.fetch_sub(len, Ordering::AcqRel).saturating_sub(len);
                if after < LOW_WATERMARK {
                    // notify_one stores a permit when nobody is waiting
                    // yet, so a waiter that registers late still wakes.
                    drained.notify_waiters();
                    drained.notify_one();
                }
                if !sent {
                    break;
                }
            }
            OutboundCmd::Close { code, reason } => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
            OutboundCmd::Terminate => break,
        }
    }
}

enum AuthOutcome {
    /// Valid token presented.
    Authed,
    /// Invalid token: bucket the address.
    BadToken,
    /// Non-auth traffic before auth.
    NotAuth,
    /// Peer went away.
    Disconnected,
}

async fn wait_for_auth(ws_rx: &mut SplitStream<WebSocket>, configured: &str) -> AuthOutcome {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                return match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(ClientMsg::Auth { token }) => {
                        if verify_token(configured, &token) {
                            AuthOutcome::Authed
                        } else {
                            AuthOutcome::BadToken
                        }
                    }
                    _ => AuthOutcome::NotAuth,
                };
            }
            Some(Ok(Message::Binary(_))) => return AuthOutcome::NotAuth,
            Some(Ok(Message::Close(_))) | None => return AuthOutcome::Disconnected,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return AuthOutcome::Disconnected,
        }
    }
}

async fn run_connection(
    socket: WebSocket,
    state: AppState,
    query: WsQuery,
    ip: IpAddr,
    pending: Option<PendingAuthGuard>,
) {
    let cfg = config::ensure_loaded();
    let conn_id = Uuid::new_v4();

    let (ws_tx, mut ws_rx) = socket.split();
    let queued = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(Notify::new());
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let outbound = Outbound::new(out_tx, Arc::clone(&queued), Arc::clone(&drained));
    let writer = tokio::spawn(writer_task(ws_tx, out_rx, queued, drained));

    let alive = Arc::new(AtomicBool::new(true));
    let conn_token = CancellationToken::new();
    state.conns.insert(
        conn_id,
        ConnEntry {
            alive: Arc::clone(&alive),
            outbound: outbound.clone(),
            token: conn_token.clone(),
        },
    );

    // accepted → authenticated, or out.
    let authed = tokio::time::timeout(AUTH_TIMEOUT, wait_for_auth(&mut ws_rx, &cfg.auth_token)).await;
    let proceed = match authed {
        Ok(AuthOutcome::Authed) => true,
        Ok(AuthOutcome::BadToken) => {
            state.failures.record_failure(ip);
            outbound.close(CLOSE_UNAUTHORIZED, "invalid token");
            false
        }
        Ok(AuthOutcome::NotAuth) => {
            outbound.close(CLOSE_UNAUTHORIZED, "auth required");
            false
        }
        Ok(AuthOutcome::Disconnected) => false,
        Err(_) => {
            outbound.close(CLOSE_UNAUTHORIZED, "auth timeout");
            false
        }
    };
    // Pending slot is released on success and failure alike.
    drop(pending);

    if proceed {
        let identity = identity_key(&cfg.auth_token);
        bound_phase(
            &state, &outbound, &mut ws_rx, conn_id, &identity, &query, &alive, &conn_token,
        )
        .await;
    }

    state.conns.remove(&conn_id);
    // Ordered after anything already queued; stops the writer even when the
    // peer vanished without a close frame.
    outbound.terminate();
    let _ = writer.await;
    tracing::debug!(conn = %conn_id, "connection closed");
}

/// authenticated → bound → closed. Returns once the connection is done;
/// the caller finishes teardown.
#[allow(clippy::too_many_arguments)]
async fn bound_phase(
    state: &AppState,
    outbound: &Outbound,
    ws_rx: &mut SplitStream<WebSocket>,
    conn_id: Uuid,
    identity: &str,
    query: &WsQuery,
    alive: &Arc<AtomicBool>,
    conn_token: &CancellationToken,
) {
    let cfg = config::ensure_loaded();
    let name = session_name(identity, query.session_id.as_deref());
    let cols = clamp_dim(query.cols.unwrap_or(DEFAULT_COLS));
    let rows = clamp_dim(query.rows.unwrap_or(DEFAULT_ROWS));

    if state.registry.count_for_identity_prefix(&identity_prefix(identity))
        >= cfg.max_connections_per_identity
    {
        outbound.close(CLOSE_TOO_MANY_CONNECTIONS, "too many connections");
        return;
    }

    let (kick_tx, kick_rx) = mpsc::unbounded_channel();
    state.registry.bind(&name, conn_id, kick_tx);

    let init = init_session(state, outbound, &name, cols, rows, query.cwd.as_deref()).await;
    let (pty, output_rx, exit_rx) = match init {
        Ok(parts) => parts,
        Err(message) => {
            tracing::warn!(session = %name, error = %message, "session init failed");
            outbound.send_json(&ServerMsg::Error { message });
            outbound.close(CLOSE_INIT_FAILED, "session init failed");
            state.registry.unbind(&name, conn_id);
            return;
        }
    };

    tracing::info!(session = %name, conn = %conn_id, "bound");
    pump(
        state, outbound, ws_rx, kick_rx, &name, pty, output_rx, exit_rx, alive, conn_token,
    )
    .await;

    state.registry.unbind(&name, conn_id);
}

/// Steps 1–7 of session init: ensure the tmux session exists (create or
/// resume), deliver scrollback and `connected`, attach the PTY.
async fn init_session(
    state: &AppState,
    outbound: &Outbound,
    name: &str,
    cols: u16,
    rows: u16,
    client_cwd: Option<&str>,
) -> Result<
    (
        PtyChannel,
        mpsc::Receiver<Bytes>,
        tokio::sync::watch::Receiver<Option<common::pty::PtyExit>>,
    ),
    String,
> {
    let cfg = config::ensure_loaded();
    let mux = &state.mux;

    let exists = mux
        .has(name)
        .await
        .map_err(|e| format!("multiplexer unavailable: {e}"))?;

    let resumed = if exists {
        // Resize, capture and re-apply configuration in parallel; only the
        // capture result matters, the rest is best effort.
        let (resize, capture, configure) = tokio::join!(
            mux.resize(name, cols, rows),
            mux.capture(name),
            mux.configure(name),
        );
        if let Err(e) = resize {
            tracing::debug!(session = %name, error = %e, "resize on resume failed");
        }
        if let Err(e) = configure {
            tracing::debug!(session = %name, error = %e, "configure on resume failed");
        }
        match capture {
            Ok(scrollback) if !scrollback.is_empty() => {
                outbound.send_binary(TAG_SCROLLBACK, &scrollback);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(session = %name, error = %e, "capture on resume failed"),
        }
        true
    } else {
        let cwd = match client_cwd {
            Some(raw) => validated_cwd(raw).await.unwrap_or_else(|| cfg.default_cwd.clone()),
            None => cfg.default_cwd.clone(),
        };
        mux.create(name, cols, rows, &cwd)
            .await
            .map_err(|e| format!("failed to create session: {e}"))?;
        false
    };

    // `connected` precedes every output frame; scrollback (sent above on
    // resume) is the only frame allowed before it.
    outbound.send_json(&ServerMsg::Connected { resumed });

    let (pty, output_rx, exit_rx) =
        PtyChannel::attach(name, cols, rows).map_err(|e| format!("failed to attach pty: {e}"))?;
    Ok((pty, output_rx, exit_rx))
}

/// A client-supplied cwd is honored only if it is an absolute path to an
/// existing directory; anything else falls back to the configured default.
async fn validated_cwd(raw: &str) -> Option<std::path::PathBuf> {
    let path = std::path::Path::new(raw);
    if !path.is_absolute() {
        return None;
    }
    let canon = tokio::fs::canonicalize(path).await.ok()?;
    let meta = tokio::fs::metadata(&canon).await.ok()?;
    meta.is_dir().then_some(canon)
}

/// The bound-state select loop: PTY output, client frames, kicks, exit,
/// shutdown, keepalive, and drain notifications.
#[allow(clippy::too_many_arguments)]
async fn pump(
    state: &AppState,
    outbound: &Outbound,
    ws_rx: &mut SplitStream<WebSocket>,
    mut kick_rx: KickReceiver,
    name: &str,
    pty: PtyChannel,
    mut output_rx: mpsc::Receiver<Bytes>,
    mut exit_rx: tokio::sync::watch::Receiver<Option<common::pty::PtyExit>>,
    alive: &Arc<AtomicBool>,
    conn_token: &CancellationToken,
) {
    let mut pty_paused = false;
    let mut last_capture: Option<Instant> = None;
    let mut active_stream: Option<CancellationToken> = None;

    loop {
        // The drain arm below can race a notification fired between
        // iterations; this re-check keeps resume prompt regardless.
        if pty_paused && outbound.queued_bytes() < LOW_WATERMARK {
            pty.resume();
            pty_paused = false;
        }

        tokio::select! {
            Some(code) = kick_rx.recv() => {
                outbound.close(code, "replaced by new connection");
                break;
            }
            _ = state.shutdown.cancelled() => {
                outbound.close(CLOSE_GOING_AWAY, "server shutting down");
                break;
            }
            _ = conn_token.cancelled() => {
                // Keepalive declared the peer dead; no close handshake.
                outbound.terminate();
                break;
            }
            changed = exit_rx.changed() => {
                match changed {
                    Ok(()) if exit_rx.borrow().is_some() => {
                        outbound.close(CLOSE_NORMAL, "session ended");
                        break;
                    }
                    Ok(()) => {}
                    Err(_) => {
                        outbound.close(CLOSE_NORMAL, "session ended");
                        break;
                    }
                }
            }
            chunk = output_rx.recv() => {
                match chunk {
                    Some(data) => {
                        let after = outbound.send_binary(TAG_OUTPUT, &data);
                        // Checked after the send so the crossing chunk
                        // still goes out.
                        if after > HIGH_WATERMARK && !pty_paused {
                            pty.pause();
                            pty_paused = true;
                        }
                    }
                    None => {
                        outbound.close(CLOSE_NORMAL, "session ended");
                        break;
                    }
                }
            }
            _ = outbound.drained(), if pty_paused => {
                if outbound.queued_bytes() < LOW_WATERMARK {
                    pty.resume();
                    pty_paused = false;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Binary(frame))) => {
                        if let Some((TAG_INPUT, payload)) = parse_binary_frame(&frame) {
                            pty.write(&payload);
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMsg>(&text) {
                            Ok(msg) => handle_control(
                                state, outbound, name, &pty,
                                &mut last_capture, &mut active_stream, msg,
                            ),
                            Err(e) => tracing::debug!(error = %e, "unparseable control frame"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        alive.store(true, Ordering::Release);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    if let Some(token) = active_stream.take() {
        token.cancel();
    }
    pty.kill();
}

/// Dispatch one authenticated control message.
fn handle_control(
    state: &AppState,
    outbound: &Outbound,
    name: &str,
    pty: &PtyChannel,
    last_capture: &mut Option<Instant>,
    active_stream: &mut Option<CancellationToken>,
    msg: ClientMsg,
) {
    match msg {
        // Honored once, pre-bind; a repeat is ignored.
        ClientMsg::Auth { .. } => {}
        ClientMsg::Input { data } => pty.write(data.as_bytes()),
        ClientMsg::Resize { cols, rows } => {
            let cols = clamp_dim(cols);
            let rows = clamp_dim(rows);
            pty.resize(cols, rows);
            let mux = state.mux.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = mux.resize(&name, cols, rows).await {
                    tracing::debug!(session = %name, error = %e, "mux resize failed");
                }
            });
        }
        ClientMsg::Ping => {
            outbound.send_json(&ServerMsg::Pong {
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
        }
        ClientMsg::CaptureScrollback => {
            let now = Instant::now();
            if last_capture.is_some_and(|at| now.duration_since(at) < CAPTURE_MIN_INTERVAL) {
                return;
            }
            *last_capture = Some(now);
            let mux = state.mux.clone();
            let name = name.to_string();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                match mux.capture(&name).await {
                    Ok(raw) => {
                        let normalized = normalize_line_endings(&raw);
                        outbound.send_binary(TAG_SCROLLBACK_CONTENT, &normalized);
                    }
                    Err(e) => tracing::debug!(session = %name, error = %e, "capture failed"),
                }
            });
        }
        ClientMsg::StreamFile { path } => {
            // A new stream replaces any active one.
            if let Some(token) = active_stream.take() {
                token.cancel();
            }
            let token = CancellationToken::new();
            *active_stream = Some(token.clone());
            tokio::spawn(run_file_stream(
                outbound.clone(),
                state.mux.clone(),
                name.to_string(),
                path,
                token,
            ));
        }
        ClientMsg::CancelStream => {
            if let Some(token) = active_stream.take() {
                token.cancel();
            }
        }
    }
}

/// Bare `\n` becomes `\r\n` so captured lines render from column 0 in
/// xterm; existing `\r\n` pairs pass through untouched.
fn normalize_line_endings(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut prev = 0u8;
    for &b in raw {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// The file-stream subprotocol: sandbox-checked open, 64 KiB chunks with
/// watermark pauses, exactly one terminal frame unless cancelled.
async fn run_file_stream(
    outbound: Outbound,
    mux: MuxAdapter,
    session: String,
    path: String,
    token: CancellationToken,
) {
    let cwd = match mux.get_cwd(&session).await {
        Ok(cwd) => cwd,
        Err(e) => {
            tracing::debug!(session = %session, error = %e, "cwd lookup for stream failed");
            outbound.send_json(&ServerMsg::FileStreamError {
                message: "Invalid path".into(),
            });
            return;
        }
    };

    let resolved = match sandbox::validate_no_symlink(&path, &cwd).await {
        Ok(resolved) => resolved,
        Err(_) => {
            outbound.send_json(&ServerMsg::FileStreamError {
                message: "Invalid path".into(),
            });
            return;
        }
    };

    let meta = match tokio::fs::metadata(&resolved).await {
        Ok(meta) => meta,
        Err(_) => {
            outbound.send_json(&ServerMsg::FileStreamError {
                message: "Invalid path".into(),
            });
            return;
        }
    };
    if !meta.is_file() {
        outbound.send_json(&ServerMsg::FileStreamError {
            message: "Not a file".into(),
        });
        return;
    }
    if meta.len() > STREAM_MAX_SIZE {
        outbound.send_json(&ServerMsg::FileStreamError {
            message: "File too large".into(),
        });
        return;
    }

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let mut file = match tokio::fs::File::open(&resolved).await {
        Ok(file) => file,
        Err(e) => {
            outbound.send_json(&ServerMsg::FileStreamError {
                message: e.to_string(),
            });
            return;
        }
    };

    outbound.send_json(&ServerMsg::FileStreamStart {
        size: meta.len(),
        mtime,
    });

    let mut buf = vec![0u8; STREAM_READ_SIZE];
    loop {
        if token.is_cancelled() || outbound.is_closed() {
            return;
        }
        let n = match file.read(&mut buf).await {
            Ok(0) => {
                outbound.send_json(&ServerMsg::FileStreamEnd);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                outbound.send_json(&ServerMsg::FileStreamError {
                    message: e.to_string(),
                });
                return;
            }
        };

        let after = outbound.send_binary(TAG_FILE_CHUNK, &buf[..n]);
        if after > STREAM_HIGH_WATERMARK {
            // Pause reading until the socket drains under the low mark.
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = outbound.drained() => {
                        if outbound.is_closed() {
                            return;
                        }
                        if outbound.queued_bytes() < STREAM_LOW_WATERMARK {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_clamp_to_spec_range() {
        assert_eq!(clamp_dim(0), 1);
        assert_eq!(clamp_dim(1), 1);
        assert_eq!(clamp_dim(120), 120);
        assert_eq!(clamp_dim(500), 500);
        assert_eq!(clamp_dim(1000), 500);
    }

    #[test]
    fn line_endings_normalize_without_doubling() {
        assert_eq!(normalize_line_endings(b"a\nb"), b"a\r\nb");
        assert_eq!(normalize_line_endings(b"a\r\nb"), b"a\r\nb");
        assert_eq!(normalize_line_endings(b"\n\n"), b"\r\n\r\n");
        assert_eq!(normalize_line_endings(b""), b"");
        assert_eq!(normalize_line_endings(b"plain"), b"plain");
    }

    #[tokio::test]
    async fn outbound_counts_queued_bytes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbound = Outbound::new(tx, Arc::new(AtomicUsize::new(0)), Arc::new(Notify::new()));

        let after = outbound.send_binary(TAG_OUTPUT, &[0u8; 100]);
        assert_eq!(after, 101); // tag byte + payload
        let after = outbound.send_binary(TAG_OUTPUT, &[0u8; 50]);
        assert_eq!(after, 152);
        assert_eq!(outbound.queued_bytes(), 152);

        // Commands arrive in order with their payloads intact.
        match rx.recv().await.unwrap() {
            OutboundCmd::Msg(Message::Binary(b)) => assert_eq!(b.len(), 101),
            _ => panic!("expected binary message"),
        }
    }

    #[tokio::test]
    async fn outbound_close_reaches_writer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbound = Outbound::new(tx, Arc::new(AtomicUsize::new(0)), Arc::new(Notify::new()));
        outbound.close(CLOSE_UNAUTHORIZED, "auth required");
        match rx.recv().await.unwrap() {
            OutboundCmd::Close { code, reason } => {
                assert_eq!(code, CLOSE_UNAUTHORIZED);
                assert_eq!(reason, "auth required");
            }
            _ => panic!("expected close command"),
        }
    }
}
