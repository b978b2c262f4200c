//! WebSocket connect/accept and connection path handling.
//!
//! The connection target encodes a per-connection session id and the page
//! path that opened it, so the host can tell several tabs on the same page
//! apart while still grouping them by path.
//!
//! # Example
//!
//! ```
//! use pagewire::transport::{connection_url, ConnectionPath};
//!
//! let url = connection_url("ws://127.0.0.1:8300", "a1b2", "/reports/daily");
//! assert_eq!(url, "ws://127.0.0.1:8300/websocket/a1b2/reports/daily");
//!
//! let path = ConnectionPath::parse("/websocket/a1b2/reports/daily").unwrap();
//! assert_eq!(path.session_id, "a1b2");
//! assert_eq!(path.pathname, "/reports/daily");
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{PagewireError, Result};

/// Path prefix under which the host accepts page connections.
pub const WEBSOCKET_PATH_PREFIX: &str = "/websocket/";

/// Page-side websocket stream.
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Host-side websocket stream.
pub type ServerStream = WebSocketStream<TcpStream>;

/// Generate a session id for a new connection.
///
/// Not cryptographic: mixes wall-clock nanos, the process id and a
/// process-wide counter so ids never repeat within one process.
pub fn generate_session_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);

    format!(
        "{:x}{:04x}",
        nanos.wrapping_mul(0x517cc1b727220a95) ^ pid,
        seq & 0xffff
    )
}

/// Build the websocket URL for a page connection.
pub fn connection_url(base: &str, session_id: &str, pathname: &str) -> String {
    let base = base.trim_end_matches('/');
    let pathname = pathname.trim_start_matches('/');
    format!("{}{}{}/{}", base, WEBSOCKET_PATH_PREFIX, session_id, pathname)
}

/// Session id and page path extracted from a connection request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPath {
    pub session_id: String,
    /// Page path, always starting with `/`.
    pub pathname: String,
}

impl ConnectionPath {
    /// Parse `/websocket/<session-id>[/<page-path>]`.
    pub fn parse(path: &str) -> Result<Self> {
        let rest = path.strip_prefix(WEBSOCKET_PATH_PREFIX).ok_or_else(|| {
            PagewireError::Protocol(format!("not a websocket path: {}", path))
        })?;

        let (session_id, page) = match rest.split_once('/') {
            Some((session_id, page)) => (session_id, page),
            None => (rest, ""),
        };

        if session_id.is_empty() {
            return Err(PagewireError::Protocol(format!(
                "missing session id: {}",
                path
            )));
        }

        Ok(Self {
            session_id: session_id.to_string(),
            pathname: format!("/{}", page),
        })
    }
}

/// Open a page-side websocket connection.
pub async fn connect(url: &str) -> Result<ClientStream> {
    let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
    Ok(stream)
}

/// Accept a host-side websocket connection and return its parsed path.
pub async fn accept(stream: TcpStream) -> Result<(ServerStream, ConnectionPath)> {
    let mut request_path = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        request_path = req.uri().path().to_string();
        Ok::<_, ErrorResponse>(resp)
    })
    .await?;

    let path = ConnectionPath::parse(&request_path)?;
    Ok((ws, path))
}
