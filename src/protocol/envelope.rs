//! Envelope types.
//!
//! The envelope is a tagged union over the four commands. Each variant
//! carries only the fields that command uses, so there is no
//! "field may or may not be present" ambiguity once decoded.
//!
//! # Example
//!
//! ```
//! use pagewire::protocol::{CallOptions, CallRequest, Envelope};
//! use serde_json::json;
//!
//! let call = CallRequest::new("js_0", "greet", vec![json!("Ada")], CallOptions::strict());
//! let env = Envelope::Call(call);
//! assert_eq!(env.id(), "js_0");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope command tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `synchronize_time`
    SynchronizeTime,
    /// `call_py`
    Call,
    /// `eval_js`
    Evaluate,
    /// `return_py`
    Return,
}

impl Command {
    /// All known commands.
    pub const ALL: [Command; 4] = [
        Command::SynchronizeTime,
        Command::Call,
        Command::Evaluate,
        Command::Return,
    ];

    /// Wire name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::SynchronizeTime => "synchronize_time",
            Command::Call => "call_py",
            Command::Evaluate => "eval_js",
            Command::Return => "return_py",
        }
    }

    /// Look up a command by wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

/// The unit exchanged over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Envelope {
    /// Page clock reading, sent once per connection before anything else.
    #[serde(rename = "synchronize_time")]
    SynchronizeTime(TimeSync),
    /// Page asks the host to run a named function.
    #[serde(rename = "call_py")]
    Call(CallRequest),
    /// Host asks the page to evaluate code.
    #[serde(rename = "eval_js")]
    Evaluate(EvalRequest),
    /// Page reports the outcome of an evaluate request.
    #[serde(rename = "return_py")]
    Return(ReturnValue),
}

impl Envelope {
    /// The envelope's command tag.
    pub fn command(&self) -> Command {
        match self {
            Envelope::SynchronizeTime(_) => Command::SynchronizeTime,
            Envelope::Call(_) => Command::Call,
            Envelope::Evaluate(_) => Command::Evaluate,
            Envelope::Return(_) => Command::Return,
        }
    }

    /// The envelope id.
    pub fn id(&self) -> &str {
        match self {
            Envelope::SynchronizeTime(e) => &e.id,
            Envelope::Call(e) => &e.id,
            Envelope::Evaluate(e) => &e.id,
            Envelope::Return(e) => &e.id,
        }
    }

    /// Sender wall-clock time in milliseconds, if carried.
    pub fn event_time_ms(&self) -> Option<i64> {
        match self {
            Envelope::SynchronizeTime(e) => Some(e.event_time_ms),
            Envelope::Call(e) => e.event_time_ms,
            Envelope::Evaluate(e) => e.event_time_ms,
            Envelope::Return(e) => e.event_time_ms,
        }
    }
}

/// `synchronize_time` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSync {
    pub id: String,
    pub event_time_ms: i64,
}

/// Dispatch policy flags for a host-bound call.
///
/// The two flags are independent; all four combinations are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallOptions {
    /// Host must report an error if the target is undefined.
    pub require_defined: bool,
    /// Host runs the call on its own task instead of the connection's
    /// serial call worker.
    pub dedicated_context: bool,
}

impl CallOptions {
    /// Target must exist on the host.
    pub const fn strict() -> Self {
        Self {
            require_defined: true,
            dedicated_context: false,
        }
    }

    /// Missing target is a silent no-op on the host.
    pub const fn optional() -> Self {
        Self {
            require_defined: false,
            dedicated_context: false,
        }
    }

    /// Target must exist and runs on a dedicated host task.
    pub const fn dedicated() -> Self {
        Self {
            require_defined: true,
            dedicated_context: true,
        }
    }

    /// Toggle the dedicated-context flag.
    pub const fn in_dedicated_context(mut self, dedicated: bool) -> Self {
        self.dedicated_context = dedicated;
        self
    }
}

/// `call_py` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: String,
    #[serde(rename = "py_func_name")]
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub no_error_if_undefined: bool,
    #[serde(default)]
    pub new_thread: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time_ms: Option<i64>,
}

impl CallRequest {
    /// Build a call without a timestamp.
    pub fn new(
        id: impl Into<String>,
        function: impl Into<String>,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Self {
        Self {
            id: id.into(),
            function: function.into(),
            args,
            no_error_if_undefined: !options.require_defined,
            new_thread: options.dedicated_context,
            event_time_ms: None,
        }
    }

    /// Attach the sender timestamp.
    pub fn at(mut self, event_time_ms: i64) -> Self {
        self.event_time_ms = Some(event_time_ms);
        self
    }

    /// Policy flags carried by this call.
    pub fn options(&self) -> CallOptions {
        CallOptions {
            require_defined: !self.no_error_if_undefined,
            dedicated_context: self.new_thread,
        }
    }
}

/// `eval_js` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRequest {
    pub id: String,
    #[serde(rename = "js_code")]
    pub code: String,
    #[serde(default)]
    pub send_return_value: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time_ms: Option<i64>,
}

impl EvalRequest {
    pub fn new(id: impl Into<String>, code: impl Into<String>, send_return_value: bool) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            send_return_value,
            event_time_ms: None,
        }
    }
}

/// `return_py` payload.
///
/// `retval` holds either the evaluated value or a failure description;
/// the envelope does not distinguish the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnValue {
    pub id: String,
    pub caller_id: String,
    #[serde(default)]
    pub retval: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_names() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_wire(cmd.as_str()), Some(cmd));
        }
        assert_eq!(Command::from_wire("launch_rockets"), None);
    }

    #[test]
    fn test_call_options_map_to_flags() {
        let strict = CallRequest::new("js_0", "f", vec![], CallOptions::strict());
        assert!(!strict.no_error_if_undefined);
        assert!(!strict.new_thread);

        let optional = CallRequest::new("js_1", "f", vec![], CallOptions::optional());
        assert!(optional.no_error_if_undefined);
        assert!(!optional.new_thread);

        let dedicated = CallRequest::new("js_2", "f", vec![], CallOptions::dedicated());
        assert!(!dedicated.no_error_if_undefined);
        assert!(dedicated.new_thread);

        let both = CallOptions::optional().in_dedicated_context(true);
        let req = CallRequest::new("js_3", "f", vec![], both);
        assert!(req.no_error_if_undefined);
        assert!(req.new_thread);
        assert_eq!(req.options(), both);
    }

    #[test]
    fn test_envelope_serializes_with_cmd_tag() {
        let env = Envelope::Call(
            CallRequest::new("js_0", "greet", vec![json!("Ada")], CallOptions::strict()).at(17),
        );
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["cmd"], "call_py");
        assert_eq!(value["py_func_name"], "greet");
        assert_eq!(value["args"], json!(["Ada"]));
        assert_eq!(value["no_error_if_undefined"], false);
        assert_eq!(value["new_thread"], false);
        assert_eq!(value["event_time_ms"], 17);
    }

    #[test]
    fn test_eval_without_timestamp_omits_field() {
        let env = Envelope::Evaluate(EvalRequest::new("py_1", "1+1", true));
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["cmd"], "eval_js");
        assert_eq!(value["js_code"], "1+1");
        assert!(value.get("event_time_ms").is_none());
        assert_eq!(env.event_time_ms(), None);
    }

    #[test]
    fn test_accessors() {
        let env = Envelope::SynchronizeTime(TimeSync {
            id: "js_0".into(),
            event_time_ms: 99,
        });
        assert_eq!(env.command(), Command::SynchronizeTime);
        assert_eq!(env.id(), "js_0");
        assert_eq!(env.event_time_ms(), Some(99));
    }
}
