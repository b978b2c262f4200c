//! JSON codec using `serde_json`.
//!
//! Decoding is two-step: the message is first parsed into a JSON value so
//! an unrecognized `cmd` can be reported as
//! [`UnknownCommand`](crate::PagewireError::UnknownCommand) instead of a
//! generic parse failure. Callers log and drop those envelopes; the
//! connection stays open.

use serde_json::Value;

use crate::error::{PagewireError, Result};
use crate::protocol::{Command, Envelope};

/// JSON codec for protocol envelopes.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode an envelope to a JSON text message.
    ///
    /// # Errors
    ///
    /// Returns error if an argument or return value cannot be serialized.
    #[inline]
    pub fn encode(envelope: &Envelope) -> Result<String> {
        Ok(serde_json::to_string(envelope)?)
    }

    /// Decode one websocket message into an envelope.
    ///
    /// # Errors
    ///
    /// - `Json` if the bytes are not JSON or a known command is missing fields
    /// - `Protocol` if the message is not an object or has no string `cmd`
    /// - `UnknownCommand` if `cmd` is not one of the four known commands
    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        let value: Value = serde_json::from_slice(bytes)?;

        let cmd = match value.get("cmd") {
            Some(Value::String(cmd)) => cmd,
            Some(_) => return Err(PagewireError::Protocol("cmd is not a string".into())),
            None if value.is_object() => {
                return Err(PagewireError::Protocol("missing cmd".into()))
            }
            None => return Err(PagewireError::Protocol("envelope is not an object".into())),
        };

        if Command::from_wire(cmd).is_none() {
            return Err(PagewireError::UnknownCommand(cmd.clone()));
        }

        Ok(serde_json::from_value(value)?)
    }
}
