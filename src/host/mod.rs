//! Host-side server: accepts page connections and dispatches their calls.
//!
//! Provides:
//! - [`HostBuilder`] - registers functions and lifecycle hooks
//! - [`Host`] - listens for pages on `/websocket/<session-id>/<page-path>`
//! - [`PageHandle`] - evaluates code on one connected page
//! - [`PageDirectory`] - lists the currently connected pages
//!
//! # Example
//!
//! ```ignore
//! use pagewire::Host;
//!
//! #[tokio::main]
//! async fn main() -> pagewire::Result<()> {
//!     let host = Host::builder()
//!         .function("ready", |page, (origin, path, query): (String, String, String)| async move {
//!             tracing::info!("{} ready at {}{}{}", page.session_id(), origin, path, query);
//!             Ok(())
//!         })
//!         .function("greet", |page, (name,): (String,)| async move {
//!             // Needs a page evaluator that understands expressions; the
//!             // default one answers `1+1` with a SyntaxError string.
//!             let answer = page.eval("1+1").await?;
//!             page.alert(&format!("Hello, {}! 1+1={}", name, answer)).await
//!         })
//!         .bind("127.0.0.1:8300")
//!         .await?;
//!
//!     host.serve().await
//! }
//! ```

mod connection;
mod page;
mod registry;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::Result;
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

pub use page::PageHandle;
pub use registry::{BoxFuture, FunctionRegistry, Handler, HandlerResult, TypedHandler};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8300;

/// Default time a blocking evaluation waits for its return value.
pub const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Hook run when a page connects or disconnects.
pub type PageHook = Box<dyn Fn(&PageHandle) + Send + Sync + 'static>;

/// Callback run on every heartbeat tick.
pub type HeartbeatHook = Arc<dyn Fn(&PageDirectory) + Send + Sync + 'static>;

/// First delay after a failed accept.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);

/// Longest delay between accept retries.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before the next accept, doubling while accepts keep failing.
fn next_backoff(current: Option<Duration>) -> Duration {
    match current {
        None => ACCEPT_BACKOFF_MIN,
        Some(d) => (d * 2).min(ACCEPT_BACKOFF_MAX),
    }
}

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// How long [`PageHandle::eval`] waits for a reply.
    pub eval_timeout: Duration,
    /// Capacity of each connection's outbound and call queues.
    pub channel_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            eval_timeout: DEFAULT_EVAL_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Connected pages, keyed by host-assigned connection id.
///
/// Session ids come from the page and may repeat; two connections with the
/// same session id are tracked separately.
#[derive(Clone, Default)]
pub struct PageDirectory {
    pages: Arc<Mutex<HashMap<u64, PageHandle>>>,
}

impl PageDirectory {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PageHandle>> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, page: PageHandle) {
        self.lock().insert(page.connection_id(), page);
    }

    pub(crate) fn remove(&self, connection_id: u64) {
        self.lock().remove(&connection_id);
    }

    /// All connected pages.
    pub fn pages(&self) -> Vec<PageHandle> {
        self.lock().values().cloned().collect()
    }

    /// Connected pages showing `pathname`.
    pub fn pages_at(&self, pathname: &str) -> Vec<PageHandle> {
        self.lock()
            .values()
            .filter(|p| p.pathname() == pathname)
            .cloned()
            .collect()
    }

    /// Look up a page by session id.
    ///
    /// When several live connections share the id, the newest one wins.
    pub fn get(&self, session_id: &str) -> Option<PageHandle> {
        self.lock()
            .values()
            .filter(|p| p.session_id() == session_id)
            .max_by_key(|p| p.connection_id())
            .cloned()
    }

    /// Look up a page by connection id.
    pub fn get_connection(&self, connection_id: u64) -> Option<PageHandle> {
        self.lock().get(&connection_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State shared by every connection of one host.
pub(crate) struct Shared {
    pub(crate) config: HostConfig,
    pub(crate) registry: FunctionRegistry,
    pub(crate) pages: PageDirectory,
    pub(crate) on_open: Vec<PageHook>,
    pub(crate) on_close: Vec<PageHook>,
}

/// Builder for configuring and creating a host.
#[derive(Default)]
pub struct HostBuilder {
    config: HostConfig,
    registry: FunctionRegistry,
    on_open: Vec<PageHook>,
    on_close: Vec<PageHook>,
    heartbeat: Option<(Duration, HeartbeatHook)>,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function pages can call.
    ///
    /// The handler receives the calling page and the positional arguments
    /// deserialized into `T`.
    pub fn function<F, T, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(PageHandle, T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register(name, handler);
        self
    }

    /// Run `hook` whenever a page connects.
    pub fn on_open<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PageHandle) + Send + Sync + 'static,
    {
        self.on_open.push(Box::new(hook));
        self
    }

    /// Run `hook` whenever a page disconnects.
    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PageHandle) + Send + Sync + 'static,
    {
        self.on_close.push(Box::new(hook));
        self
    }

    /// Run `callback` every `interval` while serving.
    ///
    /// The first tick fires one full interval after [`Host::serve`] starts.
    /// The callback gets the live page directory, so it can push code to
    /// every connected page. A zero interval is raised to one millisecond.
    pub fn heartbeat<F>(mut self, interval: Duration, callback: F) -> Self
    where
        F: Fn(&PageDirectory) + Send + Sync + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        self.heartbeat = Some((interval, Arc::new(callback)));
        self
    }

    /// Set how long a blocking evaluation waits.
    ///
    /// Default: 1 second
    pub fn eval_timeout(mut self, timeout: Duration) -> Self {
        self.config.eval_timeout = timeout;
        self
    }

    /// Set the per-connection queue capacity. Values below 1 become 1.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    /// Bind the listener.
    pub async fn bind(self, addr: impl ToSocketAddrs) -> Result<Host> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Host listening");

        Ok(Host {
            listener,
            heartbeat: self.heartbeat,
            shared: Arc::new(Shared {
                config: self.config,
                registry: self.registry,
                pages: PageDirectory::default(),
                on_open: self.on_open,
                on_close: self.on_close,
            }),
        })
    }
}

/// A bound host, ready to serve pages.
pub struct Host {
    listener: TcpListener,
    heartbeat: Option<(Duration, HeartbeatHook)>,
    shared: Arc<Shared>,
}

impl Host {
    /// Create a new host builder.
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the set of connected pages. Stays valid while serving.
    pub fn directory(&self) -> PageDirectory {
        self.shared.pages.clone()
    }

    /// All connected pages.
    pub fn pages(&self) -> Vec<PageHandle> {
        self.shared.pages.pages()
    }

    /// Connected pages showing `pathname`.
    pub fn pages_at(&self, pathname: &str) -> Vec<PageHandle> {
        self.shared.pages.pages_at(pathname)
    }

    /// Accept connections forever, one task per page.
    ///
    /// Failed accepts (for example when out of file descriptors) are retried
    /// after a growing delay capped at one second.
    pub async fn serve(self) -> Result<()> {
        let pages = self.shared.pages.clone();
        let _heartbeat = self
            .heartbeat
            .map(|(interval, callback)| AbortOnDrop(spawn_heartbeat(interval, callback, pages)));

        let mut backoff = None;
        loop {
            let (tcp, peer) = match self.listener.accept().await {
                Ok(conn) => {
                    backoff = None;
                    conn
                }
                Err(e) => {
                    let delay = next_backoff(backoff);
                    backoff = Some(delay);
                    tracing::warn!(retry_in = ?delay, "Accept failed: {}", e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            tracing::debug!(peer = %peer, "Accepted connection");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = connection::serve_connection(tcp, shared).await {
                    tracing::warn!(peer = %peer, "Connection ended with error: {}", e);
                }
            });
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn spawn_heartbeat(
    interval: Duration,
    callback: HeartbeatHook,
    pages: PageDirectory,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            tracing::trace!(pages = pages.len(), "Heartbeat");
            callback(&pages);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.eval_timeout, Duration::from_secs(1));
        assert_eq!(config.channel_capacity, 1024);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let builder = HostBuilder::new().channel_capacity(0);
        assert_eq!(builder.config.channel_capacity, 1);
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        let mut delay = next_backoff(None);
        assert_eq!(delay, Duration::from_millis(10));
        delay = next_backoff(Some(delay));
        assert_eq!(delay, Duration::from_millis(20));
        for _ in 0..20 {
            delay = next_backoff(Some(delay));
        }
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ticks_after_each_interval() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (page, _peer) = page::tests::page_pair(DEFAULT_EVAL_TIMEOUT).await;
        let pages = PageDirectory::default();
        pages.insert(page);

        let task = AbortOnDrop(spawn_heartbeat(
            Duration::from_secs(30),
            Arc::new(move |dir: &PageDirectory| {
                tx.send(dir.len()).ok();
            }),
            pages,
        ));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().ok(), Some(1));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rx.try_recv().ok(), Some(1));
        assert!(rx.try_recv().is_err());

        drop(task);
    }

    #[tokio::test]
    async fn test_directory_filters_by_path() {
        let (a, _pa) = page::tests::page_pair(DEFAULT_EVAL_TIMEOUT).await;
        let dir = PageDirectory::default();
        dir.insert(a.clone());

        assert_eq!(dir.len(), 1);
        assert_eq!(dir.pages_at("/").len(), 1);
        assert!(dir.pages_at("/other").is_empty());
        assert!(dir.get(a.session_id()).is_some());

        dir.remove(a.connection_id());
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn test_directory_keeps_pages_sharing_session_id() {
        let (first, _p1) = page::tests::page_pair(DEFAULT_EVAL_TIMEOUT).await;
        let (second, _p2) = page::tests::page_pair(DEFAULT_EVAL_TIMEOUT).await;
        assert_eq!(first.session_id(), second.session_id());

        let dir = PageDirectory::default();
        dir.insert(first.clone());
        dir.insert(second.clone());
        assert_eq!(dir.len(), 2);
        assert_eq!(
            dir.get(first.session_id()).unwrap().connection_id(),
            second.connection_id()
        );

        dir.remove(first.connection_id());
        assert_eq!(dir.len(), 1);
        assert!(dir.get_connection(second.connection_id()).is_some());
        assert_eq!(dir.pages_at("/").len(), 1);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let host = Host::builder()
            .function("noop", |_page, _: ()| async { Ok(()) })
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        assert_ne!(host.local_addr().unwrap().port(), 0);
        assert!(host.pages().is_empty());
        assert!(host.shared.registry.contains("noop"));
    }

    #[tokio::test]
    async fn test_dispatch_runs_handler() {
        let (page, _peer) = page::tests::page_pair(DEFAULT_EVAL_TIMEOUT).await;
        let mut registry = FunctionRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register("record", move |page: PageHandle, (n,): (i64,)| {
            let tx = tx.clone();
            async move {
                tx.send((page.session_id().to_string(), n)).ok();
                Ok(())
            }
        });

        let fut = registry
            .dispatch("record", page.clone(), vec![serde_json::json!(7)])
            .unwrap();
        fut.await.unwrap();
        assert_eq!(rx.recv().await, Some(("s1".to_string(), 7)));

        assert!(matches!(
            registry.dispatch("missing", page, vec![]),
            Err(crate::PagewireError::HandlerNotFound(_))
        ));
    }
}
