//! Wire protocol for the /ws endpoint.
//!
//! Text frames carry JSON control messages tagged by `type`; binary frames
//! carry a one-byte type tag followed by the raw payload. Keystrokes and
//! terminal output ride the binary framing so the hot path never touches
//! UTF-8 validation or JSON.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Binary frame tags, server → client.
pub const TAG_OUTPUT: u8 = 0x01;
pub const TAG_SCROLLBACK: u8 = 0x03;
pub const TAG_SCROLLBACK_CONTENT: u8 = 0x04;
pub const TAG_FILE_CHUNK: u8 = 0x05;

/// Binary frame tag, client → server.
pub const TAG_INPUT: u8 = 0x02;

/// WebSocket close codes.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_REPLACED: u16 = 4002;
pub const CLOSE_INIT_FAILED: u16 = 4003;
pub const CLOSE_INVALID_SESSION_ID: u16 = 4004;
pub const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4005;
pub const CLOSE_TOO_MANY_PENDING: u16 = 4006;

/// Control messages accepted from the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMsg {
    /// First message on the socket; carries the shared secret.
    Auth { token: String },
    /// Legacy text fallback for keystrokes (binary INPUT is the hot path).
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
    CaptureScrollback,
    StreamFile { path: String },
    CancelStream,
}

/// Control messages sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMsg {
    Connected { resumed: bool },
    Pong { timestamp: i64 },
    Error { message: String },
    FileStreamStart { size: u64, mtime: i64 },
    FileStreamEnd,
    FileStreamError { message: String },
}

impl ServerMsg {
    /// JSON text payload for a text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Build a tagged binary frame: `[tag][payload]`.
pub fn binary_frame(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(tag);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split an incoming binary frame into its tag and payload. Empty frames
/// have no tag and are rejected.
pub fn parse_binary_frame(frame: &Bytes) -> Option<(u8, Bytes)> {
    if frame.is_empty() {
        return None;
    }
    Some((frame[0], frame.slice(1..)))
}
