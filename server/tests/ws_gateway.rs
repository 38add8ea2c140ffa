//! Gateway close-code protocol against a live listener. These paths end
//! before any multiplexer call, so no tmux server is needed: invalid
//! session ids, pre-auth traffic, bad tokens, and the per-IP failure
//! window.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use common::store::Store;
use server::web_server::{build_router, AppState};

const TOKEN: &str = "test-secret";

fn test_env() {
    std::env::set_var("WEBMUX_AUTH_TOKEN", TOKEN);
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

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr, query: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws{query}"))
        .await
        .expect("websocket upgrade");
    ws
}

/// Read frames until the server's close frame; returns its code.
async fn wait_close_code(ws: &mut WsStream) -> u16 {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("close frame before timeout");
        match frame {
            Some(Ok(Message::Close(Some(frame)))) => return frame.code.into(),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("socket error before close frame: {e}"),
            None => panic!("stream ended without close frame"),
        }
    }
}

#[tokio::test]
async fn malformed_session_id_closes_4004() {
    let addr = start_server().await;

    let long = "x".repeat(65);
    let mut ws = connect(addr, &format!("?sessionId={long}")).await;
    assert_eq!(wait_close_code(&mut ws).await, 4004);

    let mut ws = connect(addr, "?sessionId=has.dots").await;
    assert_eq!(wait_close_code(&mut ws).await, 4004);
}

#[tokio::test]
async fn non_auth_first_frame_closes_4001() {
    let addr = start_server().await;

    // Control message before auth.
    let mut ws = connect(addr, "?sessionId=abc").await;
    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    assert_eq!(wait_close_code(&mut ws).await, 4001);

    // Binary input before auth.
    let mut ws = connect(addr, "?sessionId=abc").await;
    ws.send(Message::Binary(vec![0x02, b'l', b's'].into()))
        .await
        .unwrap();
    assert_eq!(wait_close_code(&mut ws).await, 4001);
}

#[tokio::test]
async fn invalid_token_closes_4001() {
    let addr = start_server().await;
    let mut ws = connect(addr, "?sessionId=abc").await;
    ws.send(Message::Text(
        r#"{"type":"auth","token":"not-the-secret"}"#.into(),
    ))
    .await
    .unwrap();
    assert_eq!(wait_close_code(&mut ws).await, 4001);
}

#[tokio::test]
async fn repeated_failures_block_the_address() {
    let addr = start_server().await;

    for _ in 0..5 {
        let mut ws = connect(addr, "").await;
        ws.send(Message::Text(r#"{"type":"auth","token":"wrong"}"#.into()))
            .await
            .unwrap();
        assert_eq!(wait_close_code(&mut ws).await, 4001);
    }

    // Sixth connection from the same address: closed before any auth
    // frame is read.
    let mut ws = connect(addr, "").await;
    assert_eq!(wait_close_code(&mut ws).await, 4001);
}
