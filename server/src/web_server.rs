//! Axum HTTP + WebSocket server: WS at /ws for xterm ↔ tmux attach, session
//! metadata API (GET/DELETE /api/sessions), sandboxed file API, and
//! per-identity storage (settings, drafts, annotations, tabs layout).
//!
//! Every /api endpoint except /api/health requires the bearer token and is
//! rate limited per IP (reads and writes separately). Responses carry
//! anti-embedding security headers and are compressed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Extension, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;

use common::auth::{constant_time_eq, identity_key, FailureTracker, PendingAuthSlots};
use common::config;
use common::mux::MuxAdapter;
use common::registry::{identity_prefix, Registry};
use common::store::Store;

use crate::files;
use crate::gateway::{self, ConnTable};
use crate::limits::{client_ip, RateLimits};

/// JSON request bodies are small; uploads get their own per-route cap.
const JSON_BODY_CAP: usize = 256 * 1024;
const UPLOAD_BODY_CAP: usize = 100 * 1024 * 1024;

type ApiError = (StatusCode, String);

/// Shared app state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub mux: MuxAdapter,
    pub store: Arc<Store>,
    pub failures: Arc<FailureTracker>,
    pub pending: Arc<PendingAuthSlots>,
    pub limits: Arc<RateLimits>,
    pub conns: ConnTable,
    /// Cancelled once at shutdown; gateway tasks close 1001 on it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self {
            registry: Registry::new(),
            mux: MuxAdapter::new(),
            store: Arc::new(store),
            failures: Arc::new(FailureTracker::new()),
            pending: Arc::new(PendingAuthSlots::new()),
            limits: Arc::new(RateLimits::new()),
            conns: ConnTable::default(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Authenticated identity, inserted by the auth middleware.
#[derive(Clone)]
pub struct Identity(pub String);

/// Ownership gate: `name` must be exactly the identity's prefix or extend
/// it with a `-` separated suffix. Failures are 404 so existence of other
/// identities' sessions is not disclosed.
pub fn session_for_identity(identity: &str, name: &str) -> Result<(), ApiError> {
    let prefix = identity_prefix(identity);
    let owned = name == prefix
        || name
            .strip_prefix(&prefix)
            .is_some_and(|rest| rest.starts_with('-'));
    if owned {
        Ok(())
    } else {
        Err((StatusCode::NOT_FOUND, "Not found".into()))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Bearer auth + per-IP read/write rate limiting for the /api surface.
async fn auth_middleware(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> Response {
    let cfg = config::ensure_loaded();
    let ip = client_ip(peer, req.headers(), cfg.trust_proxy);

    let is_read = matches!(*req.method(), Method::GET | Method::HEAD);
    let allowed = if is_read {
        state.limits.allow_read(ip, cfg.read_rate_per_minute)
    } else {
        state.limits.allow_write(ip, cfg.write_rate_per_minute)
    };
    if !allowed {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }

    if cfg.auth_enabled() {
        let presented = bearer_token(req.headers());
        if !presented.is_some_and(|token| constant_time_eq(&cfg.auth_token, token)) {
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    req.extensions_mut()
        .insert(Identity(identity_key(&cfg.auth_token)));
    next.run(req).await
}

async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'self'; script-src 'self'; frame-ancestors 'none'"),
    );
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    response
}

fn cors_layer() -> CorsLayer {
    let cfg = config::ensure_loaded();
    match cfg
        .cors_origin
        .as_deref()
        .and_then(|origin| origin.parse::<HeaderValue>().ok())
    {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        None => CorsLayer::new(),
    }
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{name}", delete(kill_session))
        .route("/api/sessions/{name}/cwd", get(session_cwd))
        .route("/api/sessions/{name}/files", get(files::list_files))
        .route("/api/sessions/{name}/files/download", get(files::download_file))
        .route(
            "/api/sessions/{name}/files/upload",
            post(files::upload_file).layer(DefaultBodyLimit::max(UPLOAD_BODY_CAP)),
        )
        .route("/api/sessions/{name}/files/touch", post(files::touch_file))
        .route(
            "/api/sessions/{name}/draft",
            get(get_draft).put(put_draft).delete(delete_draft),
        )
        .route(
            "/api/sessions/{name}/annotations",
            get(get_annotation).put(put_annotation),
        )
        .route("/api/settings/{key}", get(get_setting).put(put_setting))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(protected)
        .route("/api/health", get(health))
        .route("/api/tabs-layout", post(put_tabs_layout))
        .route("/ws", get(gateway::ws_handler))
        .layer(DefaultBodyLimit::max(JSON_BODY_CAP))
        .layer(CompressionLayer::new())
        .layer(cors_layer())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn run_web_server(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "webmux listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(serde::Serialize)]
struct SessionListItem {
    name: String,
    created_at: i64,
    active: bool,
}

/// GET /api/sessions — sessions belonging to the caller's identity, with
/// creation time and whether a connection is currently attached.
async fn list_sessions(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
) -> Result<Json<Vec<SessionListItem>>, ApiError> {
    let sessions = state
        .mux
        .list_all_with_activity()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let active: std::collections::HashSet<String> =
        state.registry.active_names().into_iter().collect();

    let list = sessions
        .into_iter()
        .filter(|s| session_for_identity(&identity, &s.name).is_ok())
        .map(|s| SessionListItem {
            active: active.contains(&s.name),
            name: s.name,
            created_at: s.created,
        })
        .collect();
    Ok(Json(list))
}

/// GET /api/sessions/{name}/cwd
async fn session_cwd(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    session_for_identity(&identity, &name)?;
    let cwd = state
        .mux
        .get_cwd(&name)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "Not found".into()))?;
    Ok(Json(serde_json::json!({ "cwd": cwd })))
}

/// DELETE /api/sessions/{name} — kill the tmux session.
async fn kill_session(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    session_for_identity(&identity, &name)?;
    state
        .mux
        .kill(&name)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

fn store_err(e: rusqlite::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(serde::Deserialize)]
struct ValueBody {
    value: String,
}

#[derive(serde::Deserialize)]
struct ContentBody {
    content: String,
}

#[derive(serde::Deserialize)]
struct AnnotationQuery {
    path: String,
}

/// GET /api/settings/{key}
async fn get_setting(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let value = state.store.get_setting(&identity, &key).map_err(store_err)?;
    Ok(Json(serde_json::json!({ "value": value })))
}

/// PUT /api/settings/{key}
async fn put_setting(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(key): Path<String>,
    Json(body): Json<ValueBody>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .put_setting(&identity, &key, &body.value)
        .map_err(store_err)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/sessions/{name}/draft
async fn get_draft(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    session_for_identity(&identity, &name)?;
    let content = state.store.get_draft(&identity, &name).map_err(store_err)?;
    Ok(Json(serde_json::json!({ "content": content })))
}

/// PUT /api/sessions/{name}/draft
async fn put_draft(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
    Json(body): Json<ContentBody>,
) -> Result<StatusCode, ApiError> {
    session_for_identity(&identity, &name)?;
    state
        .store
        .put_draft(&identity, &name, &body.content)
        .map_err(store_err)?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/sessions/{name}/draft
async fn delete_draft(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    session_for_identity(&identity, &name)?;
    state.store.delete_draft(&identity, &name).map_err(store_err)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/sessions/{name}/annotations?path=
async fn get_annotation(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
    Query(query): Query<AnnotationQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    session_for_identity(&identity, &name)?;
    let content = state
        .store
        .get_annotation(&identity, &name, &query.path)
        .map_err(store_err)?;
    Ok(Json(serde_json::json!({ "content": content })))
}

/// PUT /api/sessions/{name}/annotations?path=
async fn put_annotation(
    State(state): State<AppState>,
    Extension(Identity(identity)): Extension<Identity>,
    Path(name): Path<String>,
    Query(query): Query<AnnotationQuery>,
    Json(body): Json<ContentBody>,
) -> Result<StatusCode, ApiError> {
    session_for_identity(&identity, &name)?;
    state
        .store
        .put_annotation(&identity, &name, &query.path, &body.content)
        .map_err(store_err)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize)]
struct TabsLayoutBody {
    /// `sendBeacon` on page close cannot set headers; the token may ride
    /// in the body instead.
    #[serde(default)]
    token: Option<String>,
    layout: serde_json::Value,
}

const TABS_LAYOUT_KEY: &str = "tabs-layout";

/// POST /api/tabs-layout — outside the bearer middleware because of the
/// beacon path. The header wins when both carriers are present; a
/// mismatched pair is rejected outright.
async fn put_tabs_layout(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<TabsLayoutBody>,
) -> Result<StatusCode, ApiError> {
    let cfg = config::ensure_loaded();
    let ip = client_ip(peer, &headers, cfg.trust_proxy);
    if !state.limits.allow_write(ip, cfg.write_rate_per_minute) {
        return Err((StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded".into()));
    }

    if cfg.auth_enabled() {
        let header_ok = bearer_token(&headers)
            .map(|token| constant_time_eq(&cfg.auth_token, token));
        let body_ok = body
            .token
            .as_deref()
            .map(|token| constant_time_eq(&cfg.auth_token, token));
        let authed = match (header_ok, body_ok) {
            // Both carriers present: both must agree with the secret.
            (Some(h), Some(b)) => h && b,
            (Some(h), None) => h,
            (None, Some(b)) => b,
            (None, None) => false,
        };
        if !authed {
            return Err((StatusCode::UNAUTHORIZED, "Unauthorized".into()));
        }
    }

    let identity = identity_key(&cfg.auth_token);
    let value = serde_json::to_string(&body.layout)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    state
        .store
        .put_setting(&identity, TABS_LAYOUT_KEY, &value)
        .map_err(store_err)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_requires_separator_after_prefix() {
        assert!(session_for_identity("aaaa", "webmux-aaaa").is_ok());
        assert!(session_for_identity("aaaa", "webmux-aaaa-dev").is_ok());
        // String prefix without the separator is another identity.
        assert!(session_for_identity("aaaa", "webmux-aaaab").is_err());
        assert!(session_for_identity("aaaa", "webmux-bbbb-dev").is_err());
        assert!(session_for_identity("aaaa", "other-aaaa").is_err());
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("secret"));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
