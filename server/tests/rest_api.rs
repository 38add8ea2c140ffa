//! REST surface tests against a live listener: bearer auth, security
//! headers, per-identity storage, and the tabs-layout beacon path. The
//! multiplexer endpoints need a running tmux server and are exercised
//! elsewhere; everything here is tmux-free.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::auth::identity_key;
use common::registry::session_name;
use common::store::Store;
use server::web_server::{build_router, AppState};

const TOKEN: &str = "test-secret";

/// All tests share the process-wide config singleton; every test installs
/// the same values before first touching it, so ordering does not matter.
fn test_env() {
    std::env::set_var("WEBMUX_AUTH_TOKEN", TOKEN);
    std::env::set_var("WEBMUX_READ_RATE_PER_MINUTE", "100000");
    std::env::set_var("WEBMUX_WRITE_RATE_PER_MINUTE", "100000");
}

async fn start_server() -> SocketAddr {
    test_env();
    let state = AppState::new(Store::open_in_memory().unwrap());
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Minimal HTTP/1.1 request over a fresh connection; returns status code,
/// raw header block, and body.
async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> (u16, String, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (key, value) in headers {
        req.push_str(&format!("{key}: {value}\r\n"));
    }
    if let Some(body) = body {
        req.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n",
            body.len()
        ));
    }
    req.push_str("\r\n");
    if let Some(body) = body {
        req.push_str(body);
    }
    // The server may answer (and close) before the whole request is on the
    // wire, e.g. when it rejects an oversized body from Content-Length
    // alone; tolerate the resulting write/read errors and keep whatever
    // response bytes arrived.
    let _ = stream.write_all(req.as_bytes()).await;
    let mut raw = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    let text = String::from_utf8_lossy(&raw).into_owned();
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .expect("status line")
        .parse()
        .expect("numeric status");
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text.as_str(), ""));
    (status, head.to_string(), body.to_string())
}

fn auth_header() -> (&'static str, String) {
    ("Authorization", format!("Bearer {TOKEN}"))
}

#[tokio::test]
async fn health_needs_no_token_and_carries_security_headers() {
    let addr = start_server().await;
    let (status, head, body) = request(addr, "GET", "/api/health", &[], None).await;
    assert_eq!(status, 200);
    assert!(body.contains("ok"));
    let head = head.to_lowercase();
    assert!(head.contains("x-frame-options: deny"));
    assert!(head.contains("frame-ancestors 'none'"));
    assert!(head.contains("x-content-type-options: nosniff"));
}

#[tokio::test]
async fn missing_or_wrong_token_is_unauthorized() {
    let addr = start_server().await;

    let (status, _, _) = request(addr, "GET", "/api/sessions", &[], None).await;
    assert_eq!(status, 401);

    let (status, _, _) = request(
        addr,
        "GET",
        "/api/sessions",
        &[("Authorization", "Bearer wrong")],
        None,
    )
    .await;
    assert_eq!(status, 401);

    let (status, _, _) = request(
        addr,
        "GET",
        "/api/sessions",
        &[("Authorization", "Basic dXNlcjpwdw==")],
        None,
    )
    .await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn settings_round_trip() {
    let addr = start_server().await;
    let auth = auth_header();

    let (status, _, body) = request(
        addr,
        "GET",
        "/api/settings/theme",
        &[(auth.0, &auth.1)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("null"));

    let (status, _, _) = request(
        addr,
        "PUT",
        "/api/settings/theme",
        &[(auth.0, &auth.1)],
        Some(r#"{"value":"dark"}"#),
    )
    .await;
    assert_eq!(status, 204);

    let (status, _, body) = request(
        addr,
        "GET",
        "/api/settings/theme",
        &[(auth.0, &auth.1)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("dark"));
}

#[tokio::test]
async fn drafts_are_scoped_to_the_caller_identity() {
    let addr = start_server().await;
    let auth = auth_header();
    let identity = identity_key(TOKEN);
    let own = session_name(&identity, Some("editor"));
    let foreign = session_name("0000000000000000", Some("editor"));

    let (status, _, _) = request(
        addr,
        "PUT",
        &format!("/api/sessions/{own}/draft"),
        &[(auth.0, &auth.1)],
        Some(r#"{"content":"half-written command"}"#),
    )
    .await;
    assert_eq!(status, 204);

    let (status, _, body) = request(
        addr,
        "GET",
        &format!("/api/sessions/{own}/draft"),
        &[(auth.0, &auth.1)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("half-written command"));

    // Another identity's session name: 404, not 403, so nothing leaks.
    let (status, _, _) = request(
        addr,
        "GET",
        &format!("/api/sessions/{foreign}/draft"),
        &[(auth.0, &auth.1)],
        None,
    )
    .await;
    assert_eq!(status, 404);

    let (status, _, _) = request(
        addr,
        "DELETE",
        &format!("/api/sessions/{own}/draft"),
        &[(auth.0, &auth.1)],
        None,
    )
    .await;
    assert_eq!(status, 204);

    let (status, _, body) = request(
        addr,
        "GET",
        &format!("/api/sessions/{own}/draft"),
        &[(auth.0, &auth.1)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("null"));
}

#[tokio::test]
async fn annotations_round_trip() {
    let addr = start_server().await;
    let auth = auth_header();
    let identity = identity_key(TOKEN);
    let session = session_name(&identity, Some("notes"));

    let (status, _, _) = request(
        addr,
        "PUT",
        &format!("/api/sessions/{session}/annotations?path=src%2Fmain.rs"),
        &[(auth.0, &auth.1)],
        Some(r#"{"content":"needs a retry loop"}"#),
    )
    .await;
    assert_eq!(status, 204);

    let (status, _, body) = request(
        addr,
        "GET",
        &format!("/api/sessions/{session}/annotations?path=src%2Fmain.rs"),
        &[(auth.0, &auth.1)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("needs a retry loop"));

    // A different file path is a different record.
    let (status, _, body) = request(
        addr,
        "GET",
        &format!("/api/sessions/{session}/annotations?path=src%2Flib.rs"),
        &[(auth.0, &auth.1)],
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.contains("null"));
}

#[tokio::test]
async fn tabs_layout_accepts_body_token_but_header_wins() {
    let addr = start_server().await;
    let auth = auth_header();

    // Beacon path: token in body, no header.
    let (status, _, _) = request(
        addr,
        "POST",
        "/api/tabs-layout",
        &[],
        Some(&format!(r#"{{"token":"{TOKEN}","layout":{{"tabs":[]}}}}"#)),
    )
    .await;
    assert_eq!(status, 204);

    // Wrong body token.
    let (status, _, _) = request(
        addr,
        "POST",
        "/api/tabs-layout",
        &[],
        Some(r#"{"token":"wrong","layout":{}}"#),
    )
    .await;
    assert_eq!(status, 401);

    // Header and body disagree: rejected even though the header is valid.
    let (status, _, _) = request(
        addr,
        "POST",
        "/api/tabs-layout",
        &[(auth.0, &auth.1)],
        Some(r#"{"token":"wrong","layout":{}}"#),
    )
    .await;
    assert_eq!(status, 401);

    // Header alone.
    let (status, _, _) = request(
        addr,
        "POST",
        "/api/tabs-layout",
        &[(auth.0, &auth.1)],
        Some(r#"{"layout":{"tabs":[1,2]}}"#),
    )
    .await;
    assert_eq!(status, 204);
}

#[tokio::test]
async fn oversized_json_bodies_are_refused() {
    let addr = start_server().await;
    let auth = auth_header();
    let big = format!(r#"{{"value":"{}"}}"#, "x".repeat(300 * 1024));

    let (status, _, _) = request(
        addr,
        "PUT",
        "/api/settings/blob",
        &[(auth.0, &auth.1)],
        Some(&big),
    )
    .await;
    assert_eq!(status, 413);
}
