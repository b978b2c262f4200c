//! Page-side connection session.
//!
//! One session exists per open connection. It owns the connection's id
//! counter and writer handle; when the connection closes the session is
//! dropped, so nothing carries over to the next connection.

use serde_json::Value;

use crate::clock::{self, now_ms};
use crate::error::Result;
use crate::eval::EvalHandler;
use crate::protocol::{CallOptions, CallRequest, Envelope, EvalRequest, IdAllocator, PAGE_ID_PREFIX};
use crate::writer::WriterHandle;

pub(crate) struct Session {
    ids: IdAllocator,
    writer: WriterHandle,
}

impl Session {
    pub(crate) fn new(writer: WriterHandle) -> Self {
        Self {
            ids: IdAllocator::new(PAGE_ID_PREFIX),
            writer,
        }
    }

    /// Send the one-per-connection clock reading.
    pub(crate) fn synchronize_time(&self) -> Result<()> {
        self.writer.try_send(&clock::synchronize_time(&self.ids))
    }

    /// Send a host-bound call. Returns the envelope id.
    pub(crate) fn invoke(
        &self,
        function: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<String> {
        let id = self.ids.next_id();
        let call = CallRequest::new(id.clone(), function, args, options).at(now_ms());
        self.writer.try_send(&Envelope::Call(call))?;
        Ok(id)
    }

    /// Run an evaluate request and send the reply if one is wanted.
    pub(crate) fn evaluate(&self, handler: &mut EvalHandler, request: &EvalRequest) -> Result<()> {
        match handler.handle(request, &self.ids) {
            Some(reply) => self.writer.try_send(&Envelope::Return(reply)),
            None => Ok(()),
        }
    }

    pub(crate) fn writer(&self) -> &WriterHandle {
        &self.writer
    }
}
