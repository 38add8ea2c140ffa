//! webmux server: axum router, the WebSocket connection gateway, sandboxed
//! file REST, and lifecycle supervisors.

pub mod files;
pub mod gateway;
pub mod lifecycle;
pub mod limits;
pub mod web_server;
