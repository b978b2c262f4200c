//! Function registry for dispatching page calls by name.
//!
//! Handlers receive the calling page and the call's positional arguments,
//! deserialized into the handler's argument type. A JSON array maps onto a
//! tuple, a `Vec`, or any sequence type.
//!
//! # Example
//!
//! ```ignore
//! use pagewire::host::FunctionRegistry;
//!
//! let mut registry = FunctionRegistry::new();
//!
//! registry.register("greet", |page, (name,): (String,)| async move {
//!     page.alert(&format!("Hello, {}!", name)).await
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::PageHandle;
use crate::error::{PagewireError, Result};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a call with raw positional arguments.
    fn call(&self, page: PageHandle, args: Vec<Value>) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes arguments before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(PageHandle, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(PageHandle, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(PageHandle, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, page: PageHandle, args: Vec<Value>) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match decode_args(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        Box::pin((self.handler)(page, parsed))
    }
}

/// Deserialize positional arguments.
///
/// An empty argument list also accepts `()` and other unit-like types.
fn decode_args<T: DeserializeOwned>(args: Vec<Value>) -> Result<T> {
    let empty = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(v) => Ok(v),
        Err(_) if empty => Ok(serde_json::from_value(Value::Null)?),
        Err(e) => Err(e.into()),
    }
}

/// Registry mapping function names to handlers.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Box<dyn Handler>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A later registration under the same name wins.
    pub fn register<F, T, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(PageHandle, T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let typed = TypedHandler::new(handler);
        if self
            .functions
            .insert(name.to_string(), Box::new(typed))
            .is_some()
        {
            tracing::debug!(function = %name, "Replacing handler");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered function names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(|s| s.as_str())
    }

    /// Start the handler for `name`.
    ///
    /// Fails with `HandlerNotFound` when nothing is registered under `name`.
    pub fn dispatch(
        &self,
        name: &str,
        page: PageHandle,
        args: Vec<Value>,
    ) -> Result<BoxFuture<'static, HandlerResult>> {
        let handler = self
            .functions
            .get(name)
            .ok_or_else(|| PagewireError::HandlerNotFound(name.to_string()))?;

        Ok(handler.call(page, args))
    }
}
