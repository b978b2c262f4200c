//! Constrained interpreter over named operations.
//!
//! Instead of executing arbitrary source, the page exposes a fixed table of
//! operations. The host sends code shaped like a call:
//!
//! ```text
//! name                      no arguments
//! name(json, json, ...)     arguments are JSON values
//! ```
//!
//! A trailing `;` is allowed. Anything else is a syntax error, and any name
//! not in the table is a reference error.
//!
//! # Example
//!
//! ```
//! use pagewire::eval::{Evaluator, OperationRegistry};
//! use serde_json::{json, Value};
//!
//! let mut ops = OperationRegistry::new();
//! ops.register("add", |(a, b): (i64, i64)| Ok(json!(a + b)));
//!
//! assert_eq!(ops.evaluate("add(1, 1)").unwrap(), json!(2));
//! assert!(ops.evaluate("rm(\"-rf\")").is_err());
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{EvalError, Evaluator, Notifier};
use crate::download;
use crate::protocol::reserved;

/// A page-side operation.
pub trait Operation: Send + Sync + 'static {
    /// Run with the raw JSON arguments.
    fn call(&self, args: Vec<Value>) -> Result<Value, EvalError>;
}

/// Wrapper that deserializes the argument list before calling the function.
pub struct TypedOperation<F, T>
where
    F: Fn(T) -> Result<Value, EvalError> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    func: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> Operation for TypedOperation<F, T>
where
    F: Fn(T) -> Result<Value, EvalError> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    fn call(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        let parsed: T = serde_json::from_value(Value::Array(args))
            .map_err(|e| EvalError::Failed(format!("invalid arguments: {}", e)))?;
        (self.func)(parsed)
    }
}

/// Table of operations the host is allowed to invoke.
#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Box<dyn Operation>>,
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in `alert` and `browser_download`
    /// operations.
    ///
    /// `alert(message)` forwards to the notifier. `browser_download(name,
    /// base64)` decodes the payload and saves it under `download_dir`,
    /// returning the written path.
    pub fn with_builtins(notifier: Arc<dyn Notifier>, download_dir: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new();

        registry.register(reserved::ALERT, move |(message,): (Value,)| {
            match message {
                Value::String(s) => notifier.alert(&s),
                other => notifier.alert(&other.to_string()),
            }
            Ok(Value::Null)
        });

        let dir = download_dir.into();
        registry.register(
            reserved::BROWSER_DOWNLOAD,
            move |(filename, payload): (String, String)| {
                let path = download::save_base64(&dir, &filename, &payload)
                    .map_err(|e| EvalError::Failed(e.to_string()))?;
                Ok(Value::String(path.display().to_string()))
            },
        );

        registry
    }

    /// Register an operation whose arguments deserialize into `T`.
    ///
    /// Use a tuple for positional arguments, or `Vec<Value>` to take them raw.
    pub fn register<F, T>(&mut self, name: &str, func: F)
    where
        F: Fn(T) -> Result<Value, EvalError> + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        let op = TypedOperation {
            func,
            _phantom: PhantomData,
        };
        self.operations.insert(name.to_string(), Box::new(op));
    }

    /// Whether an operation is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered operation names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(|k| k.as_str())
    }

    /// Invoke an operation by name.
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        let op = self
            .operations
            .get(name)
            .ok_or_else(|| EvalError::UnknownOperation(name.to_string()))?;
        op.call(args)
    }
}

impl Evaluator for OperationRegistry {
    fn evaluate(&mut self, code: &str) -> Result<Value, EvalError> {
        match parse_invocation(code)? {
            Some((name, args)) => self.invoke(&name, args),
            None => Ok(Value::Null),
        }
    }
}

/// Split `name(args...)` into the name and its JSON arguments.
///
/// Returns `None` for empty code.
pub fn parse_invocation(code: &str) -> Result<Option<(String, Vec<Value>)>, EvalError> {
    let code = code.trim();
    let code = code.strip_suffix(';').unwrap_or(code).trim();
    if code.is_empty() {
        return Ok(None);
    }

    let (name, args) = match code.find('(') {
        None => (code, Vec::new()),
        Some(open) => {
            let inner = code[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| EvalError::Syntax(format!("missing ) in {}", code)))?;
            let args: Vec<Value> = serde_json::from_str(&format!("[{}]", inner))
                .map_err(|e| EvalError::Syntax(format!("bad arguments: {}", e)))?;
            (code[..open].trim(), args)
        }
    };

    if !is_identifier(name) {
        return Err(EvalError::Syntax(format!("unexpected token in {}", code)));
    }

    Ok(Some((name.to_string(), args)))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Alerts(Mutex<Vec<String>>);

    impl Notifier for Alerts {
        fn evaluation_failed(&self, _code: &str, _error: &str) {}

        fn alert(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse_invocation("").unwrap(), None);
        assert_eq!(parse_invocation("  ; ").unwrap(), None);
        assert_eq!(
            parse_invocation("refresh").unwrap(),
            Some(("refresh".to_string(), vec![]))
        );
        assert_eq!(
            parse_invocation("show()").unwrap(),
            Some(("show".to_string(), vec![]))
        );
        assert_eq!(
            parse_invocation("  set_text(\"#title\", \"a, b\", [1, {\"k\": null}]);").unwrap(),
            Some((
                "set_text".to_string(),
                vec![json!("#title"), json!("a, b"), json!([1, {"k": null}])]
            ))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_invocation("show(1"),
            Err(EvalError::Syntax(_))
        ));
        assert!(matches!(
            parse_invocation("show(undefined)"),
            Err(EvalError::Syntax(_))
        ));
        assert!(matches!(
            parse_invocation("1+1"),
            Err(EvalError::Syntax(_))
        ));
        assert!(matches!(
            parse_invocation("(show)(1)"),
            Err(EvalError::Syntax(_))
        ));
    }

    #[test]
    fn test_register_and_invoke() {
        let mut ops = OperationRegistry::new();
        ops.register("add", |(a, b): (i64, i64)| Ok(json!(a + b)));
        ops.register("count", |args: Vec<Value>| Ok(json!(args.len())));

        assert!(ops.contains("add"));
        assert_eq!(ops.evaluate("add(2, 3)").unwrap(), json!(5));
        assert_eq!(ops.evaluate("count(1, \"x\", null)").unwrap(), json!(3));
        assert_eq!(ops.evaluate("").unwrap(), Value::Null);

        let mut names: Vec<&str> = ops.names().collect();
        names.sort();
        assert_eq!(names, vec!["add", "count"]);
    }

    #[test]
    fn test_unknown_operation() {
        let mut ops = OperationRegistry::new();
        assert_eq!(
            ops.evaluate("eval(\"anything\")").unwrap_err(),
            EvalError::UnknownOperation("eval".into())
        );
    }

    #[test]
    fn test_bad_argument_types() {
        let mut ops = OperationRegistry::new();
        ops.register("add", |(a, b): (i64, i64)| Ok(json!(a + b)));

        assert!(matches!(
            ops.evaluate("add(\"x\", 1)"),
            Err(EvalError::Failed(_))
        ));
    }

    #[test]
    fn test_builtin_alert() {
        let alerts = Arc::new(Alerts::default());
        let mut ops = OperationRegistry::with_builtins(alerts.clone(), std::env::temp_dir());

        assert_eq!(ops.evaluate("alert(\"careful\")").unwrap(), Value::Null);
        assert_eq!(ops.evaluate("alert(42)").unwrap(), Value::Null);
        assert_eq!(*alerts.0.lock().unwrap(), vec!["careful", "42"]);
    }

    #[test]
    fn test_builtin_browser_download() {
        let dir = std::env::temp_dir().join(format!(
            "pagewire-ops-{}",
            crate::transport::generate_session_id()
        ));
        let mut ops = OperationRegistry::with_builtins(Arc::new(Alerts::default()), &dir);

        // "hello" in base64
        let path = ops
            .evaluate("browser_download(\"greeting.txt\", \"aGVsbG8=\")")
            .unwrap();
        let path = PathBuf::from(path.as_str().unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
