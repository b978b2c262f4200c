//! Hello Page - a page-side client with a small operation table.
//!
//! This example demonstrates:
//! - Building a client that reconnects on its own
//! - Exposing page operations the host can evaluate
//! - Calling host functions and reporting navigation
//!
//! Start `hello_host` first.

use std::sync::Arc;

use pagewire::eval::{EvalError, OperationRegistry, TracingNotifier};
use pagewire::{Client, ConnectionState, NavigationHook, PageLocation};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pagewire=debug"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    let download_dir = std::env::temp_dir().join("pagewire-downloads");
    let mut ops = OperationRegistry::with_builtins(Arc::new(TracingNotifier), &download_dir);
    ops.register("add", |(a, b): (i64, i64)| Ok(json!(a + b)));
    ops.register("heartbeat", |_: Vec<Value>| {
        tracing::debug!("Heartbeat");
        Ok(Value::Null)
    });
    ops.register("fail", |_: Vec<Value>| -> Result<Value, EvalError> {
        Err(EvalError::Failed("requested failure".into()))
    });

    let (client, handle) = Client::builder("ws://127.0.0.1:8300")
        .location(PageLocation::new("http://127.0.0.1:8300", "/", ""))
        .evaluator(ops)
        .on_startup(|call| tracing::info!(startup = call.function(), "Page loaded"))
        .build();
    let runner = tokio::spawn(client.run());

    handle.wait_for_state(ConnectionState::Open).await?;
    handle.call("greet", vec![json!("Ada")])?;

    let nav = NavigationHook::new(handle.clone());
    nav.on_popstate(json!({"step": 1}), "http://127.0.0.1:8300/#step1")?;

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await?;
    runner.await??;
    Ok(())
}
