//! Handle to one connected page.
//!
//! Provides:
//! - `eval` - run code on the page and wait for its value
//! - `eval_pending` - send now, wait later
//! - `eval_detached` - fire-and-forget
//! - `alert` / `browser_download` - helpers built on `eval_detached`
//!
//! # Thread Safety
//!
//! `PageHandle` is `Clone` and can be shared freely across tasks. Every
//! clone talks to the same connection through its writer channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;

use crate::clock::{now_ms, ClockSkew};
use crate::download::download_code;
use crate::error::{PagewireError, Result};
use crate::protocol::{reserved, Envelope, EvalRequest, IdAllocator, HOST_ID_PREFIX};
use crate::router::{PendingCalls, PendingReturn};
use crate::writer::WriterHandle;

/// Source of host-assigned connection ids.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct PageInner {
    connection_id: u64,
    session_id: String,
    pathname: String,
    writer: WriterHandle,
    ids: IdAllocator,
    pending: PendingCalls,
    skew: Mutex<ClockSkew>,
    eval_timeout: Duration,
}

/// Handle to a connected page.
#[derive(Clone)]
pub struct PageHandle {
    inner: Arc<PageInner>,
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("connection_id", &self.inner.connection_id)
            .field("session_id", &self.inner.session_id)
            .field("pathname", &self.inner.pathname)
            .finish()
    }
}

impl PageHandle {
    pub(crate) fn new(
        session_id: String,
        pathname: String,
        writer: WriterHandle,
        eval_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PageInner {
                connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                session_id,
                pathname,
                writer,
                ids: IdAllocator::new(HOST_ID_PREFIX),
                pending: PendingCalls::new(),
                skew: Mutex::new(ClockSkew::new()),
                eval_timeout,
            }),
        }
    }

    /// Host-assigned id, unique for every connection in this process.
    #[inline]
    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id
    }

    /// Random per-connection id chosen by the page. Not guaranteed unique.
    #[inline]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Path of the page, e.g. `/reports`.
    #[inline]
    pub fn pathname(&self) -> &str {
        &self.inner.pathname
    }

    /// Whether the connection's writer has stopped.
    pub fn is_closed(&self) -> bool {
        self.inner.writer.is_closed()
    }

    /// Run `code` on the page and wait for its value.
    ///
    /// Fails with `Timeout` after the configured eval timeout and with
    /// `ConnectionClosed` if the page disconnects first. Evaluation
    /// failures on the page arrive as a string value, not an error.
    pub async fn eval(&self, code: &str) -> Result<Value> {
        let pending = self.eval_pending(code).await?;
        let id = pending.id().to_string();
        match tokio::time::timeout(self.inner.eval_timeout, pending.wait()).await {
            Ok(res) => res,
            Err(_) => {
                self.inner.pending.cancel(&id);
                tracing::warn!(id = %id, "Evaluation timed out");
                Err(PagewireError::Timeout)
            }
        }
    }

    /// Send `code` and return the continuation without waiting.
    pub async fn eval_pending(&self, code: &str) -> Result<PendingReturn> {
        let id = self.inner.ids.next_id();
        let pending = self.inner.pending.register(&id);

        let mut request = EvalRequest::new(id.clone(), code, true);
        request.event_time_ms = Some(now_ms());
        if let Err(e) = self.inner.writer.send(&Envelope::Evaluate(request)).await {
            self.inner.pending.cancel(&id);
            return Err(e);
        }
        Ok(pending)
    }

    /// Send `code` without asking for a reply.
    pub async fn eval_detached(&self, code: &str) -> Result<()> {
        let mut request = EvalRequest::new(self.inner.ids.next_id(), code, false);
        request.event_time_ms = Some(now_ms());
        self.inner.writer.send(&Envelope::Evaluate(request)).await
    }

    /// Show `message` on the page.
    pub async fn alert(&self, message: &str) -> Result<()> {
        let code = format!("{}({})", reserved::ALERT, serde_json::to_string(message)?);
        self.eval_detached(&code).await
    }

    /// Hand `data` to the page as a file download.
    pub async fn browser_download(&self, filename: &str, data: &[u8]) -> Result<()> {
        self.eval_detached(&download_code(filename, data)?).await
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<()> {
        self.inner.writer.close().await
    }

    /// Page-minus-host clock offset, once the page has synchronized.
    pub fn time_offset_ms(&self) -> Option<i64> {
        self.skew().offset_ms()
    }

    /// Host-clock time of the most recent page event.
    pub fn last_event_time_ms(&self) -> Option<i64> {
        self.skew().last_event_ms()
    }

    /// Number of evaluations waiting for a return value.
    pub fn pending_evaluations(&self) -> usize {
        self.inner.pending.len()
    }

    fn skew(&self) -> MutexGuard<'_, ClockSkew> {
        self.inner.skew.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update clock bookkeeping from an inbound envelope.
    ///
    /// A `synchronize_time` first resets the offset; every envelope carrying
    /// a timestamp, the sync included, then updates the last event time.
    pub(crate) fn record_envelope(&self, envelope: &Envelope) {
        if let Envelope::SynchronizeTime(sync) = envelope {
            self.synchronize(sync.event_time_ms);
        }
        if let Some(page_ms) = envelope.event_time_ms() {
            self.observe(page_ms);
        }
    }

    fn synchronize(&self, page_ms: i64) {
        let mut skew = self.skew();
        skew.synchronize(page_ms, now_ms());
        tracing::debug!(
            session_id = %self.inner.session_id,
            offset_ms = skew.offset_ms().unwrap_or_default(),
            "Clock synchronized"
        );
    }

    fn observe(&self, page_ms: i64) -> i64 {
        self.skew().observe(page_ms)
    }

    pub(crate) fn resolve(&self, caller_id: &str, retval: Value) -> bool {
        self.inner.pending.resolve(caller_id, retval)
    }

    /// Fail every outstanding evaluation. Returns how many were failed.
    pub(crate) fn close_pending(&self) -> usize {
        self.inner.pending.close()
    }

    #[cfg(test)]
    pub(crate) fn writer(&self) -> &WriterHandle {
        &self.inner.writer
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::writer::spawn_writer_task_default;
    use futures_util::StreamExt;
    use serde_json::json;
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    pub(crate) type PeerStream = WebSocketStream<tokio::io::DuplexStream>;

    /// A page handle wired to an in-memory websocket peer.
    pub(crate) async fn page_pair(eval_timeout: Duration) -> (PageHandle, PeerStream) {
        let (host_io, page_io) = duplex(64 * 1024);
        let host_ws = WebSocketStream::from_raw_socket(host_io, Role::Server, None).await;
        let page_ws = WebSocketStream::from_raw_socket(page_io, Role::Client, None).await;

        let (sink, _source) = host_ws.split();
        let (writer, _task) = spawn_writer_task_default(sink);
        let page = PageHandle::new("s1".into(), "/".into(), writer, eval_timeout);
        (page, page_ws)
    }

    pub(crate) async fn next_envelope(peer: &mut PeerStream) -> Envelope {
        loop {
            match peer.next().await {
                Some(Ok(Message::Text(text))) => return JsonCodec::decode(text.as_bytes()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_eval_round_trip() {
        let (page, mut peer) = page_pair(Duration::from_secs(5)).await;

        let task = {
            let page = page.clone();
            tokio::spawn(async move { page.eval("1+1").await })
        };

        let request = match next_envelope(&mut peer).await {
            Envelope::Evaluate(r) => r,
            other => panic!("expected eval_js, got {:?}", other),
        };
        assert_eq!(request.id, "py_0");
        assert_eq!(request.code, "1+1");
        assert!(request.send_return_value);

        assert!(page.resolve(&request.id, json!(2)));
        assert_eq!(task.await.unwrap().unwrap(), json!(2));
        assert_eq!(page.pending_evaluations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eval_timeout_forgets_entry() {
        let (page, _peer) = page_pair(Duration::from_secs(1)).await;

        let res = page.eval("slow()").await;
        assert!(matches!(res, Err(PagewireError::Timeout)));
        assert_eq!(page.pending_evaluations(), 0);
        // A late reply is dropped.
        assert!(!page.resolve("py_0", json!(1)));
    }

    #[tokio::test]
    async fn test_close_pending_fails_waiters() {
        let (page, mut peer) = page_pair(Duration::from_secs(5)).await;

        let pending = page.eval_pending("wait()").await.unwrap();
        let _ = next_envelope(&mut peer).await;

        assert_eq!(page.close_pending(), 1);
        assert!(matches!(
            pending.wait().await,
            Err(PagewireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_alert_and_download_are_detached() {
        let (page, mut peer) = page_pair(Duration::from_secs(5)).await;

        page.alert("say \"hi\"").await.unwrap();
        match next_envelope(&mut peer).await {
            Envelope::Evaluate(r) => {
                assert_eq!(r.code, r#"alert("say \"hi\"")"#);
                assert!(!r.send_return_value);
            }
            other => panic!("unexpected {:?}", other),
        }

        page.browser_download("a.txt", b"hi").await.unwrap();
        match next_envelope(&mut peer).await {
            Envelope::Evaluate(r) => {
                assert_eq!(r.code, r#"browser_download("a.txt", "aGk=")"#);
                assert!(!r.send_return_value);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clock_tracking() {
        let (page, _peer) = page_pair(Duration::from_secs(5)).await;
        assert_eq!(page.time_offset_ms(), None);

        let page_now = now_ms() + 10_000;
        page.synchronize(page_now);
        let offset = page.time_offset_ms().unwrap();
        assert!((9_000..=10_000).contains(&offset));

        let adjusted = page.observe(page_now + 500);
        assert_eq!(adjusted, page_now + 500 - offset);
        assert_eq!(page.last_event_time_ms(), Some(adjusted));
        assert!(!page.writer().is_closed());
    }

    #[tokio::test]
    async fn test_sync_envelope_sets_last_event_time() {
        let (page, _peer) = page_pair(Duration::from_secs(5)).await;
        let sync = Envelope::SynchronizeTime(crate::protocol::TimeSync {
            id: "js_0".into(),
            event_time_ms: now_ms(),
        });

        page.record_envelope(&sync);
        assert!(page.time_offset_ms().is_some());
        let last = page.last_event_time_ms().unwrap();
        assert!((now_ms() - last).abs() < 5_000);
    }

    #[tokio::test]
    async fn test_extreme_sync_timestamp_is_harmless() {
        let (page, _peer) = page_pair(Duration::from_secs(5)).await;
        page.record_envelope(&Envelope::SynchronizeTime(crate::protocol::TimeSync {
            id: "js_0".into(),
            event_time_ms: i64::MIN,
        }));
        page.record_envelope(&Envelope::Return(crate::protocol::ReturnValue {
            id: "js_1".into(),
            caller_id: "py_0".into(),
            retval: Value::Null,
            event_time_ms: Some(i64::MAX),
        }));
        assert_eq!(page.last_event_time_ms(), Some(i64::MAX));
    }

    #[tokio::test]
    async fn test_connection_ids_are_distinct() {
        let (a, _pa) = page_pair(Duration::from_secs(5)).await;
        let (b, _pb) = page_pair(Duration::from_secs(5)).await;
        assert_eq!(a.session_id(), b.session_id());
        assert_ne!(a.connection_id(), b.connection_id());
    }
}
