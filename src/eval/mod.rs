//! Evaluation handler - runs host-issued `eval_js` requests on the page side.
//!
//! Provides:
//! - [`Evaluator`] - the capability the host's code runs against
//! - [`Notifier`] - local diagnostic channel for failures and alerts
//! - [`EvalHandler`] - executes one request and builds the optional reply
//! - [`OperationRegistry`] - constrained interpreter over named operations
//!
//! Failures never escape the handler: they are reported to the notifier
//! and, when the host asked for a reply, sent back as the `retval` string.
//!
//! # Example
//!
//! ```
//! use pagewire::eval::{EvalError, EvalHandler, TracingNotifier};
//! use pagewire::protocol::{EvalRequest, IdAllocator, PAGE_ID_PREFIX};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let evaluator = |code: &str| -> Result<serde_json::Value, EvalError> {
//!     match code {
//!         "1+1" => Ok(json!(2)),
//!         other => Err(EvalError::Failed(format!("cannot evaluate {}", other))),
//!     }
//! };
//! let mut handler = EvalHandler::new(Box::new(evaluator), Arc::new(TracingNotifier));
//! let ids = IdAllocator::new(PAGE_ID_PREFIX);
//!
//! let reply = handler.handle(&EvalRequest::new("h_7", "1+1", true), &ids).unwrap();
//! assert_eq!(reply.caller_id, "h_7");
//! assert_eq!(reply.retval, json!(2));
//! ```

mod operations;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::clock::now_ms;
use crate::protocol::{EvalRequest, IdAllocator, ReturnValue};

pub use operations::{parse_invocation, Operation, OperationRegistry, TypedOperation};

/// Failure of a single evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// Code could not be parsed.
    #[error("SyntaxError: {0}")]
    Syntax(String),

    /// Code named an operation the page does not provide.
    #[error("ReferenceError: {0} is not defined")]
    UnknownOperation(String),

    /// Operation ran and failed.
    #[error("Error: {0}")]
    Failed(String),
}

/// Capability that executes host-supplied code on the page side.
pub trait Evaluator: Send + 'static {
    /// Evaluate `code`, returning its value or a failure.
    fn evaluate(&mut self, code: &str) -> Result<Value, EvalError>;
}

impl<F> Evaluator for F
where
    F: FnMut(&str) -> Result<Value, EvalError> + Send + 'static,
{
    fn evaluate(&mut self, code: &str) -> Result<Value, EvalError> {
        self(code)
    }
}

/// Local diagnostic channel.
///
/// Evaluation failures are always reported here so host-authored bugs are
/// never silent, whether or not the host expects a reply.
pub trait Notifier: Send + Sync + 'static {
    /// An evaluation failed; `code` is the failing source.
    fn evaluation_failed(&self, code: &str, error: &str);

    /// Host asked the page to show a message.
    fn alert(&self, message: &str);
}

/// Notifier that reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn evaluation_failed(&self, code: &str, error: &str) {
        tracing::error!(code = %code, "Evaluation failed: {}", error);
    }

    fn alert(&self, message: &str) {
        tracing::warn!("Alert: {}", message);
    }
}

/// Executes `eval_js` requests one at a time.
pub struct EvalHandler {
    evaluator: Box<dyn Evaluator>,
    notifier: Arc<dyn Notifier>,
}

impl EvalHandler {
    pub fn new(evaluator: Box<dyn Evaluator>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            evaluator,
            notifier,
        }
    }

    /// Run one request to completion.
    ///
    /// Returns the `return_py` payload to send when `send_return_value` is
    /// set, `None` otherwise. The reply's id is drawn from `ids`.
    pub fn handle(&mut self, request: &EvalRequest, ids: &IdAllocator) -> Option<ReturnValue> {
        let retval = match self.run(&request.code) {
            Ok(value) => value,
            Err(description) => {
                self.notifier.evaluation_failed(&request.code, &description);
                Value::String(description)
            }
        };

        if !request.send_return_value {
            return None;
        }

        Some(ReturnValue {
            id: ids.next_id(),
            caller_id: request.id.clone(),
            retval,
            event_time_ms: Some(now_ms()),
        })
    }

    /// Evaluate, folding errors and panics into a description.
    fn run(&mut self, code: &str) -> Result<Value, String> {
        let evaluator = &mut self.evaluator;
        match catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(code))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "evaluator panicked".to_string());
                Err(EvalError::Failed(reason).to_string())
            }
        }
    }
}
