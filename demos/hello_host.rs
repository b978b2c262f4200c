//! Hello Host - serves pages and talks back to them.
//!
//! This example demonstrates:
//! - Registering host functions with typed arguments
//! - Evaluating code on the calling page and awaiting its value
//! - Open/close hooks and a periodic heartbeat to every page on a path
//!
//! # Running
//!
//! ```text
//! cargo run --example hello_host
//! cargo run --example hello_page    # in another terminal
//! ```

use std::time::Duration;

use pagewire::host::DEFAULT_PORT;
use pagewire::Host;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pagewire=debug"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    let host = Host::builder()
        .function(
            "ready",
            |page, (origin, path, query): (String, String, String)| async move {
                tracing::info!(
                    session_id = %page.session_id(),
                    "Page ready at {}{}{}",
                    origin,
                    path,
                    query
                );
                page.alert("Welcome!").await
            },
        )
        .function(
            "reconnect",
            |page, (_origin, path, _query): (String, String, String)| async move {
                tracing::info!(session_id = %page.session_id(), path = %path, "Page reconnected");
                Ok(())
            },
        )
        .function("greet", |page, (name,): (String,)| async move {
            let sum = page.eval("add(1, 1)").await?;
            page.alert(&format!("Hello, {}! 1+1={}", name, sum)).await?;
            page.browser_download("greeting.txt", format!("Hello, {}!\n", name).as_bytes())
                .await
        })
        .on_open(|page| tracing::info!(pathname = %page.pathname(), "Page opened"))
        .on_close(|page| tracing::info!(pathname = %page.pathname(), "Page closed"))
        .eval_timeout(Duration::from_secs(2))
        // Broadcast a heartbeat to every page on "/".
        .heartbeat(Duration::from_secs(10), |pages| {
            for page in pages.pages_at("/") {
                tokio::spawn(async move {
                    if let Err(e) = page.eval_detached("heartbeat").await {
                        tracing::warn!("Heartbeat failed: {}", e);
                    }
                });
            }
        })
        .bind(("127.0.0.1", DEFAULT_PORT))
        .await?;

    host.serve().await?;
    Ok(())
}
