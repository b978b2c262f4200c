//! Navigation hook - reports history navigation to the host.
//!
//! Each back/forward step becomes a `popstate` call carrying the history
//! state and the new href. The call is optional: hosts that do not define
//! `popstate` ignore it silently.

use serde_json::Value;

use crate::client::ClientHandle;
use crate::error::Result;
use crate::protocol::reserved;

/// Forwards history navigation events to the host.
#[derive(Clone)]
pub struct NavigationHook {
    client: ClientHandle,
}

impl NavigationHook {
    pub fn new(client: ClientHandle) -> Self {
        Self { client }
    }

    /// A back/forward navigation happened.
    ///
    /// `state` is the history entry's state, `Value::Null` if none.
    pub fn on_popstate(&self, state: Value, href: &str) -> Result<()> {
        tracing::debug!(href = %href, "popstate");
        self.client.call_optional(
            reserved::POPSTATE,
            vec![state, Value::String(href.to_string())],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;

    #[tokio::test]
    async fn test_popstate_with_closed_client_fails() {
        let (client, handle) = Client::builder("ws://127.0.0.1:9").build();
        drop(client);

        let hook = NavigationHook::new(handle);
        assert!(hook.on_popstate(Value::Null, "http://h/a").is_err());
    }
}
