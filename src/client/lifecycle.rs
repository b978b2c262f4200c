//! Connection lifecycle state machine.
//!
//! ```text
//! Connecting ──open──► Open ──close/error──► Closed ──timer──► Connecting
//!      └──────────────close/error────────────────┘
//! ```
//!
//! Every close or error cancels any pending reconnect timer and starts a
//! new one, so at most one timer exists at a time. Retries repeat forever at
//! a fixed delay.

use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::reserved;

/// Default delay before a reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// State of the page's single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Startup call sent right after the clock sync on each open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupCall {
    /// First successful open.
    Ready,
    /// Any later open.
    Reconnect,
}

impl StartupCall {
    /// Host function name for this call.
    pub fn function(self) -> &'static str {
        match self {
            StartupCall::Ready => reserved::READY,
            StartupCall::Reconnect => reserved::RECONNECT,
        }
    }
}

/// Single-slot reconnect timer.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    deadline: Option<Instant>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any pending timer with one firing after `delay`.
    pub fn schedule(&mut self, delay: Duration) {
        self.cancel();
        self.deadline = Some(Instant::now() + delay);
    }

    /// Cancel the pending timer. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Wait for the pending timer to fire, then clear it.
    ///
    /// Never completes if nothing is scheduled. Cancel-safe: dropping the
    /// future leaves the timer pending.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

/// Lifecycle bookkeeping for one page.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    opened_before: bool,
    reconnect_delay: Duration,
    timer: ReconnectTimer,
}

impl Lifecycle {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Connecting,
            opened_before: false,
            reconnect_delay,
            timer: ReconnectTimer::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// A connection attempt starts.
    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The handshake succeeded. Returns which startup call to send.
    pub fn on_open(&mut self) -> StartupCall {
        self.timer.cancel();
        self.state = ConnectionState::Open;
        let call = if self.opened_before {
            StartupCall::Reconnect
        } else {
            StartupCall::Ready
        };
        self.opened_before = true;
        call
    }

    /// The connection closed or errored, in any state.
    pub fn on_close(&mut self) {
        self.state = ConnectionState::Closed;
        self.timer.schedule(self.reconnect_delay);
    }

    pub fn timer(&self) -> &ReconnectTimer {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut ReconnectTimer {
        &mut self.timer
    }
}
