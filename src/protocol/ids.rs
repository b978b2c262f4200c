//! Connection-scoped envelope id allocation.
//!
//! Ids are `<prefix><counter>`, with the counter starting at 0 for every
//! new connection. A fresh allocator is created per connection, so ids from
//! a superseded connection never continue into the next one.

use std::sync::atomic::{AtomicU64, Ordering};

/// Prefix for ids issued by the page side.
pub const PAGE_ID_PREFIX: &str = "js_";

/// Prefix for ids issued by the host side.
pub const HOST_ID_PREFIX: &str = "py_";

/// Monotonic id counter for one connection.
#[derive(Debug)]
pub struct IdAllocator {
    prefix: &'static str,
    next: AtomicU64,
}

impl IdAllocator {
    /// Create an allocator starting at 0.
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            next: AtomicU64::new(0),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }

    /// Number of ids issued so far.
    #[inline]
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}
