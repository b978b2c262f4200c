//! Per-connection host loop.
//!
//! ```text
//! socket ─► read loop ─┬─ synchronize_time ─► clock skew
//!                      ├─ return_py ────────► pending evaluations
//!                      ├─ call_py ──────────► serial worker (in order)
//!                      └─ call_py (new_thread) ─► spawned task
//! ```
//!
//! The read loop never waits on a handler, so a handler that evaluates
//! code on its own page still receives the reply.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::{PageHandle, Shared};
use crate::codec::JsonCodec;
use crate::error::{PagewireError, Result};
use crate::protocol::{CallRequest, Envelope};
use crate::transport::{self, ServerStream};
use crate::writer::{spawn_writer_task, WriterConfig};

/// Serve one accepted TCP connection until the page disconnects.
pub(crate) async fn serve_connection(tcp: TcpStream, shared: Arc<Shared>) -> Result<()> {
    let (ws, path) = transport::accept(tcp).await?;
    let (sink, mut source) = ws.split();
    let (writer, writer_task) = spawn_writer_task(
        sink,
        WriterConfig {
            channel_capacity: shared.config.channel_capacity,
        },
    );

    let page = PageHandle::new(
        path.session_id,
        path.pathname,
        writer,
        shared.config.eval_timeout,
    );
    tracing::info!(
        session_id = %page.session_id(),
        pathname = %page.pathname(),
        "Page connected"
    );
    shared.pages.insert(page.clone());
    for hook in &shared.on_open {
        hook(&page);
    }

    let (serial_tx, serial_rx) = mpsc::channel(shared.config.channel_capacity);
    tokio::spawn(serial_worker(serial_rx, shared.clone(), page.clone()));

    let result = match AssertUnwindSafe(read_loop(&mut source, &shared, &page, &serial_tx))
        .catch_unwind()
        .await
    {
        Ok(res) => res,
        Err(_) => Err(PagewireError::Protocol("read loop panicked".into())),
    };

    let failed = page.close_pending();
    if failed > 0 {
        tracing::debug!(failed, "Failed outstanding evaluations");
    }
    shared.pages.remove(page.connection_id());
    for hook in &shared.on_close {
        hook(&page);
    }
    writer_task.abort();

    tracing::info!(session_id = %page.session_id(), "Page disconnected");
    result
}

async fn read_loop(
    source: &mut futures_util::stream::SplitStream<ServerStream>,
    shared: &Arc<Shared>,
    page: &PageHandle,
    serial_tx: &mpsc::Sender<CallRequest>,
) -> Result<()> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => handle_inbound(text.as_bytes(), shared, page, serial_tx),
            Some(Ok(Message::Binary(data))) => handle_inbound(&data, shared, page, serial_tx),
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

fn handle_inbound(
    bytes: &[u8],
    shared: &Arc<Shared>,
    page: &PageHandle,
    serial_tx: &mpsc::Sender<CallRequest>,
) {
    let envelope = match JsonCodec::decode(bytes) {
        Ok(e) => e,
        Err(PagewireError::UnknownCommand(cmd)) => {
            tracing::warn!(cmd = %cmd, "Ignoring unknown command");
            return;
        }
        Err(e) => {
            tracing::warn!("Dropping malformed envelope: {}", e);
            return;
        }
    };

    page.record_envelope(&envelope);

    match envelope {
        Envelope::Call(call) if call.new_thread => {
            tokio::spawn(run_call(shared.clone(), page.clone(), call));
        }
        Envelope::Call(call) => {
            if let Err(e) = serial_tx.try_send(call) {
                let call = e.into_inner();
                tracing::warn!(function = %call.function, "Call queue full, dropping call");
            }
        }
        Envelope::Return(ret) => {
            page.resolve(&ret.caller_id, ret.retval);
        }
        Envelope::Evaluate(req) => {
            tracing::warn!(id = %req.id, "Ignoring eval_js sent by a page");
        }
        // Clock bookkeeping is already done.
        Envelope::SynchronizeTime(_) => {}
    }
}

/// Runs non-dedicated calls one at a time, in arrival order.
async fn serial_worker(
    mut rx: mpsc::Receiver<CallRequest>,
    shared: Arc<Shared>,
    page: PageHandle,
) {
    while let Some(call) = rx.recv().await {
        run_call(shared.clone(), page.clone(), call).await;
    }
}

/// Dispatch one call and report failures back to the page.
async fn run_call(shared: Arc<Shared>, page: PageHandle, call: CallRequest) {
    let options = call.options();
    let function = call.function;
    tracing::debug!(function = %function, id = %call.id, "Dispatching call");

    let fut = match shared.registry.dispatch(&function, page.clone(), call.args) {
        Ok(fut) => fut,
        Err(e @ PagewireError::HandlerNotFound(_)) => {
            if options.require_defined {
                tracing::error!(function = %function, "{}", e);
                notify_page(&page, &e.to_string()).await;
            } else {
                tracing::debug!(function = %function, "Optional call has no handler");
            }
            return;
        }
        Err(e) => {
            tracing::error!(function = %function, "Dispatch failed: {}", e);
            return;
        }
    };

    let message = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("Error in {}: {}", function, e),
        Err(_) => format!("Error in {}: handler panicked", function),
    };
    tracing::error!(function = %function, "{}", message);
    notify_page(&page, &message).await;
}

async fn notify_page(page: &PageHandle, message: &str) {
    if let Err(e) = page.alert(message).await {
        tracing::debug!("Could not alert page: {}", e);
    }
}
