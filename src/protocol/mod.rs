//! Protocol module - envelope types and connection-scoped ids.
//!
//! Every websocket message is one JSON object, an [`Envelope`], tagged by
//! its `cmd` field:
//!
//! | `cmd`              | Direction    | Payload            |
//! |--------------------|--------------|--------------------|
//! | `synchronize_time` | page -> host | [`TimeSync`]       |
//! | `call_py`          | page -> host | [`CallRequest`]    |
//! | `eval_js`          | host -> page | [`EvalRequest`]    |
//! | `return_py`        | page -> host | [`ReturnValue`]    |

mod envelope;
mod ids;

pub use envelope::{
    CallOptions, CallRequest, Command, Envelope, EvalRequest, ReturnValue, TimeSync,
};
pub use ids::{IdAllocator, HOST_ID_PREFIX, PAGE_ID_PREFIX};

/// Host function names with reserved meaning.
pub mod reserved {
    /// Sent on the first successful connection of a page.
    pub const READY: &str = "ready";
    /// Sent on every later successful connection of a page.
    pub const RECONNECT: &str = "reconnect";
    /// Sent on browser history navigation.
    pub const POPSTATE: &str = "popstate";
    /// Page-side operation name used by the host to show an error.
    pub const ALERT: &str = "alert";
    /// Page-side operation name used by the host to trigger a file save.
    pub const BROWSER_DOWNLOAD: &str = "browser_download";
}
