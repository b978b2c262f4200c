//! Clock synchronization.
//!
//! The page sends exactly one `synchronize_time` envelope per connection,
//! before its startup call. The host never answers it; it records the
//! difference between the page clock and its own, then translates every
//! later `event_time_ms` into host time.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::{Envelope, IdAllocator, TimeSync};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Build the `synchronize_time` envelope for a freshly opened connection.
pub fn synchronize_time(ids: &IdAllocator) -> Envelope {
    Envelope::SynchronizeTime(TimeSync {
        id: ids.next_id(),
        event_time_ms: now_ms(),
    })
}

/// Host-side skew estimate for one page connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockSkew {
    offset_ms: Option<i64>,
    last_event_ms: Option<i64>,
}

impl ClockSkew {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a page clock reading taken at `host_ms` on the host.
    ///
    /// Page timestamps are untrusted; arithmetic saturates at the `i64` range.
    pub fn synchronize(&mut self, page_ms: i64, host_ms: i64) {
        self.offset_ms = Some(page_ms.saturating_sub(host_ms));
    }

    /// Translate a page timestamp into host time and remember it.
    ///
    /// Before any synchronization the offset is taken as zero.
    pub fn observe(&mut self, page_ms: i64) -> i64 {
        let host_ms = page_ms.saturating_sub(self.offset_ms.unwrap_or(0));
        self.last_event_ms = Some(host_ms);
        host_ms
    }

    /// Page clock minus host clock, once known.
    #[inline]
    pub fn offset_ms(&self) -> Option<i64> {
        self.offset_ms
    }

    /// Host-time timestamp of the most recent page event.
    #[inline]
    pub fn last_event_ms(&self) -> Option<i64> {
        self.last_event_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PAGE_ID_PREFIX;

    #[test]
    fn test_synchronize_time_envelope() {
        let ids = IdAllocator::new(PAGE_ID_PREFIX);
        let before = now_ms();
        let env = synchronize_time(&ids);

        match env {
            Envelope::SynchronizeTime(sync) => {
                assert_eq!(sync.id, "js_0");
                assert!(sync.event_time_ms >= before);
            }
            other => panic!("expected synchronize_time, got {:?}", other),
        }
    }

    #[test]
    fn test_skew_translation() {
        let mut skew = ClockSkew::new();
        // Page clock runs 250ms ahead of the host.
        skew.synchronize(10_250, 10_000);
        assert_eq!(skew.offset_ms(), Some(250));

        assert_eq!(skew.observe(11_250), 11_000);
        assert_eq!(skew.last_event_ms(), Some(11_000));
    }

    #[test]
    fn test_observe_before_sync_uses_zero_offset() {
        let mut skew = ClockSkew::new();
        assert_eq!(skew.observe(500), 500);
        assert_eq!(skew.offset_ms(), None);
    }

    #[test]
    fn test_resync_replaces_offset() {
        let mut skew = ClockSkew::new();
        skew.synchronize(100, 0);
        skew.synchronize(0, 100);
        assert_eq!(skew.offset_ms(), Some(-100));
    }

    #[test]
    fn test_extreme_timestamps_saturate() {
        let mut skew = ClockSkew::new();
        skew.synchronize(i64::MIN, 1_700_000_000_000);
        assert_eq!(skew.offset_ms(), Some(i64::MIN));
        assert_eq!(skew.observe(i64::MAX), i64::MAX);
        assert_eq!(skew.observe(0), i64::MAX);

        skew.synchronize(i64::MAX, -1);
        assert_eq!(skew.offset_ms(), Some(i64::MAX));
        assert_eq!(skew.observe(i64::MIN), i64::MIN);
        assert_eq!(skew.last_event_ms(), Some(i64::MIN));
    }
}
