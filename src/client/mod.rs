//! Page-side client: connection lifecycle and outbound calls.
//!
//! The [`ClientBuilder`] configures the page, the [`Client`] owns the single
//! live connection and drives the lifecycle:
//! 1. Connect to `/websocket/<session-id>/<page-path>`
//! 2. Send `synchronize_time`, run the startup hook, then call `ready`
//!    (first open) or `reconnect`
//! 3. Evaluate inbound `eval_js` requests one at a time, in arrival order
//! 4. On close or error, wait the reconnect delay and start over
//!
//! Application code holds a [`ClientHandle`] and issues calls through it.
//! Calls go out on whichever connection is live when the client picks them
//! up; calls made while disconnected are dropped.
//!
//! # Example
//!
//! ```ignore
//! use pagewire::client::{Client, PageLocation};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> pagewire::Result<()> {
//!     // The default evaluator only runs `name(json, ...)` operations such as
//!     // `alert("hi")`; expression code like `1+1` fails with a SyntaxError.
//!     // Install a custom `Evaluator` to run anything else.
//!     let (client, handle) = Client::builder("ws://127.0.0.1:8300")
//!         .location(PageLocation::new("http://127.0.0.1:8300", "/", ""))
//!         .on_startup(|call| tracing::info!("{} about to be sent", call.function()))
//!         .build();
//!     tokio::spawn(client.run());
//!
//!     handle.wait_for_state(pagewire::client::ConnectionState::Open).await?;
//!     handle.call("greet", vec![json!("Ada")])?;
//!     Ok(())
//! }
//! ```

mod lifecycle;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::codec::JsonCodec;
use crate::error::{PagewireError, Result};
use crate::eval::{EvalHandler, Evaluator, Notifier, OperationRegistry, TracingNotifier};
use crate::protocol::{CallOptions, Envelope};
use crate::transport::{self, connection_url, generate_session_id, ClientStream};
use crate::writer::{spawn_writer_task, WriterConfig, DEFAULT_CHANNEL_CAPACITY};

pub use lifecycle::{
    ConnectionState, Lifecycle, ReconnectTimer, StartupCall, DEFAULT_RECONNECT_DELAY,
};
use session::Session;

/// Default host URL.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8300";

/// How long a shutdown waits for the close frame to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Location of the page, reported to the host in `ready`/`reconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLocation {
    /// Scheme, host and port, e.g. `http://127.0.0.1:8300`.
    pub origin: String,
    /// Path, e.g. `/reports`.
    pub pathname: String,
    /// Query string including `?`, or empty.
    pub search: String,
}

impl PageLocation {
    pub fn new(
        origin: impl Into<String>,
        pathname: impl Into<String>,
        search: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            pathname: pathname.into(),
            search: search.into(),
        }
    }

    /// Full URL of the page.
    pub fn href(&self) -> String {
        format!("{}{}{}", self.origin, self.pathname, self.search)
    }

    /// Arguments for the startup call: origin, path, query.
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            Value::String(self.origin.clone()),
            Value::String(self.pathname.clone()),
            Value::String(self.search.clone()),
        ]
    }
}

impl Default for PageLocation {
    fn default() -> Self {
        Self::new("http://127.0.0.1:8300", "/", "")
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host base URL, e.g. `ws://127.0.0.1:8300`.
    pub url: String,
    /// Page location.
    pub location: PageLocation,
    /// Delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Capacity of the command and outbound queues.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            location: PageLocation::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Page-local hook run on every open, before the startup call goes out.
pub type StartupHook = Box<dyn Fn(StartupCall) + Send + Sync + 'static>;

/// Builder for configuring and creating a page client.
pub struct ClientBuilder {
    config: ClientConfig,
    evaluator: Option<Box<dyn Evaluator>>,
    on_startup: Option<StartupHook>,
    notifier: Arc<dyn Notifier>,
    download_dir: PathBuf,
}

impl ClientBuilder {
    /// Create a builder targeting the host at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                url: url.into(),
                ..ClientConfig::default()
            },
            evaluator: None,
            on_startup: None,
            notifier: Arc::new(TracingNotifier),
            download_dir: std::env::temp_dir(),
        }
    }

    /// Set the page location.
    pub fn location(mut self, location: PageLocation) -> Self {
        self.config.location = location;
        self
    }

    /// Set the reconnect delay.
    ///
    /// Default: 5 seconds
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set the command and outbound queue capacity. Values below 1 become 1.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    /// Use a custom evaluator for `eval_js` requests.
    ///
    /// Default: [`OperationRegistry::with_builtins`], which only understands
    /// registered operations written as `name(json, ...)`. Any other code,
    /// including plain expressions like `1+1`, is answered with a
    /// `SyntaxError` string, so hosts that evaluate expressions need a
    /// custom evaluator here.
    pub fn evaluator(mut self, evaluator: impl Evaluator) -> Self {
        self.evaluator = Some(Box::new(evaluator));
        self
    }

    /// Run `hook` on every open, after time sync and before the startup
    /// call. It receives [`StartupCall::Ready`] on the first open and
    /// [`StartupCall::Reconnect`] afterwards.
    pub fn on_startup<F>(mut self, hook: F) -> Self
    where
        F: Fn(StartupCall) + Send + Sync + 'static,
    {
        self.on_startup = Some(Box::new(hook));
        self
    }

    /// Set the diagnostic channel.
    ///
    /// Default: [`TracingNotifier`]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Directory where the default evaluator saves downloads.
    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Build the client and a handle for issuing calls.
    pub fn build(self) -> (Client, ClientHandle) {
        let evaluator: Box<dyn Evaluator> = match self.evaluator {
            Some(e) => e,
            None => Box::new(OperationRegistry::with_builtins(
                self.notifier.clone(),
                self.download_dir,
            )),
        };

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let client = Client {
            lifecycle: Lifecycle::new(self.config.reconnect_delay),
            config: self.config,
            eval: EvalHandler::new(evaluator, self.notifier),
            on_startup: self.on_startup,
            commands: rx,
            state_tx,
        };
        let handle = ClientHandle {
            tx,
            state: state_rx,
        };
        (client, handle)
    }
}

enum ClientCommand {
    Invoke {
        function: String,
        args: Vec<Value>,
        options: CallOptions,
    },
    Shutdown,
}

enum Flow {
    Closed,
    Shutdown,
}

/// The page client. Owns the single live connection.
pub struct Client {
    config: ClientConfig,
    lifecycle: Lifecycle,
    eval: EvalHandler,
    on_startup: Option<StartupHook>,
    commands: mpsc::Receiver<ClientCommand>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Run the lifecycle until shut down.
    ///
    /// Reconnects forever at the fixed delay. Returns once
    /// [`ClientHandle::shutdown`] is called or every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        loop {
            self.lifecycle.begin_connect();
            self.publish_state();

            let url = connection_url(
                &self.config.url,
                &generate_session_id(),
                &self.config.location.pathname,
            );
            tracing::debug!(url = %url, "Connecting");

            match self.connect(&url).await {
                Ok(Some(stream)) => match self.run_connection(stream).await {
                    Ok(Flow::Shutdown) => return Ok(()),
                    Ok(Flow::Closed) => tracing::info!("Connection closed"),
                    Err(e) => tracing::warn!("Connection error: {}", e),
                },
                Ok(None) => return Ok(()),
                Err(e) => tracing::warn!("Connect failed: {}", e),
            }

            self.lifecycle.on_close();
            self.publish_state();
            tracing::debug!(
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "Reconnect scheduled"
            );

            if let Flow::Shutdown = self.wait_for_reconnect().await {
                return Ok(());
            }
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.lifecycle.state());
    }

    /// Connect, dropping calls that arrive meanwhile.
    ///
    /// `Ok(None)` means the client was shut down while connecting.
    async fn connect(&mut self, url: &str) -> Result<Option<ClientStream>> {
        let connect = transport::connect(url);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                res = &mut connect => return res.map(Some),
                cmd = self.commands.recv() => {
                    if let Flow::Shutdown = drop_while_disconnected(cmd) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn wait_for_reconnect(&mut self) -> Flow {
        loop {
            tokio::select! {
                _ = self.lifecycle.timer_mut().fired() => return Flow::Closed,
                cmd = self.commands.recv() => {
                    if let Flow::Shutdown = drop_while_disconnected(cmd) {
                        return Flow::Shutdown;
                    }
                }
            }
        }
    }

    /// Serve one open connection until it closes.
    async fn run_connection(&mut self, stream: ClientStream) -> Result<Flow> {
        let (sink, mut source) = stream.split();
        let (writer, writer_task) = spawn_writer_task(
            sink,
            WriterConfig {
                channel_capacity: self.config.channel_capacity,
            },
        );
        let session = Session::new(writer);

        let startup = self.lifecycle.on_open();
        session.synchronize_time()?;
        if let Some(hook) = &self.on_startup {
            hook(startup);
        }
        session.invoke(
            startup.function(),
            self.config.location.to_args(),
            CallOptions::optional(),
        )?;
        self.publish_state();
        tracing::info!(startup = startup.function(), "Connected");

        let flow = loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_inbound(&session, text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => self.handle_inbound(&session, &data),
                    Some(Ok(Message::Close(_))) | None => break Flow::Closed,
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        // Errors are handled exactly like a close.
                        tracing::warn!("Socket error: {}", e);
                        break Flow::Closed;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(ClientCommand::Invoke { function, args, options }) => {
                        if let Err(e) = session.invoke(&function, args, options) {
                            tracing::warn!(function = %function, "Call not sent: {}", e);
                        }
                    }
                    Some(ClientCommand::Shutdown) | None => {
                        let _ = session.writer().close().await;
                        break Flow::Shutdown;
                    }
                },
            }
        };

        drop(session);
        match flow {
            Flow::Shutdown => {
                let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer_task).await;
            }
            Flow::Closed => writer_task.abort(),
        }
        Ok(flow)
    }

    /// Route one inbound message. Never fails the connection.
    fn handle_inbound(&mut self, session: &Session, bytes: &[u8]) {
        match JsonCodec::decode(bytes) {
            Ok(Envelope::Evaluate(request)) => {
                if let Err(e) = session.evaluate(&mut self.eval, &request) {
                    tracing::warn!(caller_id = %request.id, "Return value not sent: {}", e);
                }
            }
            Ok(other) => {
                tracing::debug!(
                    cmd = other.command().as_str(),
                    id = other.id(),
                    "Ignoring envelope not addressed to the page"
                );
            }
            Err(PagewireError::UnknownCommand(cmd)) => {
                tracing::warn!(cmd = %cmd, "Ignoring unknown command");
            }
            Err(e) => tracing::warn!("Dropping malformed envelope: {}", e),
        }
    }
}

fn drop_while_disconnected(cmd: Option<ClientCommand>) -> Flow {
    match cmd {
        Some(ClientCommand::Invoke { function, .. }) => {
            tracing::debug!(function = %function, "Dropping call while disconnected");
            Flow::Closed
        }
        Some(ClientCommand::Shutdown) | None => Flow::Shutdown,
    }
}

/// Handle for issuing host-bound calls.
///
/// Cheaply cloneable. All call methods return as soon as the call is
/// queued; they never wait for the host.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ClientCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ClientHandle {
    /// Queue a host-bound call with explicit policy flags.
    pub fn invoke(&self, function: &str, args: Vec<Value>, options: CallOptions) -> Result<()> {
        self.tx
            .try_send(ClientCommand::Invoke {
                function: function.to_string(),
                args,
                options,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PagewireError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => PagewireError::ConnectionClosed,
            })
    }

    /// Call a function the host must define.
    pub fn call(&self, function: &str, args: Vec<Value>) -> Result<()> {
        self.invoke(function, args, CallOptions::strict())
    }

    /// Call a function the host may not define.
    pub fn call_optional(&self, function: &str, args: Vec<Value>) -> Result<()> {
        self.invoke(function, args, CallOptions::optional())
    }

    /// Call a function on a dedicated host task.
    pub fn call_dedicated(&self, function: &str, args: Vec<Value>) -> Result<()> {
        self.invoke(function, args, CallOptions::dedicated())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map_err(|_| PagewireError::ConnectionClosed)?;
        Ok(())
    }

    /// Close the connection and stop the client.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(ClientCommand::Shutdown)
            .await
            .map_err(|_| PagewireError::ConnectionClosed)
    }
}
