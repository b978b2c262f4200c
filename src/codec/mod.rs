//! Codec module - envelope serialization for the websocket.
//!
//! - [`JsonCodec`] - one JSON object per websocket message
//!
//! # Design
//!
//! Like the rest of the crate, the codec is a marker struct with static
//! methods rather than a trait object.
//!
//! # Example
//!
//! ```
//! use pagewire::codec::JsonCodec;
//! use pagewire::protocol::{Envelope, EvalRequest};
//!
//! let env = Envelope::Evaluate(EvalRequest::new("py_0", "1+1", true));
//! let text = JsonCodec::encode(&env).unwrap();
//! assert_eq!(JsonCodec::decode(text.as_bytes()).unwrap(), env);
//! ```

mod json;

pub use json::JsonCodec;
