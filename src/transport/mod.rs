//! Transport module - websocket connection setup.
//!
//! Provides:
//! - Connection path layout `/websocket/<session-id>/<page-path>`
//! - Page-side connect and host-side accept over tokio-tungstenite

mod websocket;

pub use websocket::{
    accept, connect, connection_url, generate_session_id, ClientStream, ConnectionPath,
    ServerStream, WEBSOCKET_PATH_PREFIX,
};
