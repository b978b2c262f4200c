//! # pagewire
//!
//! Bidirectional call/return bridge between a page and a host over a
//! single websocket.
//!
//! Either side may invoke named functions on the other:
//! - the page sends `call_py` to run a host function (fire-and-forget)
//! - the host sends `eval_js` to run code on the page, optionally
//!   receiving the value back as `return_py`
//!
//! ## Architecture
//!
//! - **Page side**: [`Client`] owns one connection, reconnects at a fixed
//!   delay, and evaluates host requests through an [`eval::Evaluator`]
//! - **Host side**: [`Host`] accepts many pages, dispatches their calls to
//!   registered functions, and hands out a [`PageHandle`] per page
//! - **Wire**: JSON text frames tagged by `cmd`, see [`protocol`]
//!
//! The page's default evaluator is [`eval::OperationRegistry`], a small
//! interpreter for registered operations written as `name(json, ...)`.
//! It is not a script engine: `page.eval("1+1")` against a default page
//! returns a `SyntaxError` string. Pass a custom evaluator to
//! [`ClientBuilder::evaluator`] when the host sends expressions.
//!
//! ## Example
//!
//! ```ignore
//! use pagewire::{Client, Host};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> pagewire::Result<()> {
//!     let host = Host::builder()
//!         .function("greet", |page, (name,): (String,)| async move {
//!             // `alert` is a builtin operation of the default evaluator.
//!             page.alert(&format!("Hello, {}!", name)).await
//!         })
//!         .bind("127.0.0.1:8300")
//!         .await?;
//!     tokio::spawn(host.serve());
//!
//!     let (client, handle) = Client::builder("ws://127.0.0.1:8300").build();
//!     tokio::spawn(client.run());
//!     handle.call("greet", vec![json!("Ada")])?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod clock;
pub mod codec;
pub mod download;
pub mod error;
pub mod eval;
pub mod host;
pub mod navigation;
pub mod protocol;
pub mod router;
pub mod transport;
pub mod writer;

pub use client::{Client, ClientBuilder, ClientHandle, ConnectionState, PageLocation};
pub use error::{PagewireError, Result};
pub use host::{Host, HostBuilder, PageDirectory, PageHandle};
pub use navigation::NavigationHook;
