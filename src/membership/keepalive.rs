//! Keepalive tracking.
//!
//! All liveness information funnels through one tracker per node: join and
//! keepalive POSTs call `heard_from`, and errors observed on any request
//! path feed back through `on_err`.

use crate::types::NodeId;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_heard: Instant,
    failed_calls: u32,
}

/// Per-peer liveness tracker.
#[derive(Debug)]
pub struct KeepaliveTracker {
    heard: DashMap<NodeId, Liveness>,
    /// A peer silent for longer than this is considered timed out.
    window: Duration,
}

impl KeepaliveTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            heard: DashMap::new(),
            window,
        }
    }

    /// Record a sign of life. With `reset`, prior failures are forgiven
    /// (a full re-registration as opposed to a periodic beat).
    pub fn heard_from(&self, id: &str, reset: bool) {
        let mut entry = self.heard.entry(id.to_string()).or_insert(Liveness {
            last_heard: Instant::now(),
            failed_calls: 0,
        });
        entry.last_heard = Instant::now();
        if reset {
            entry.failed_calls = 0;
        }
    }

    /// Record a request-path failure against a peer.
    pub fn on_err(&self, id: &str, err: &crate::error::Error) {
        let mut entry = self.heard.entry(id.to_string()).or_insert(Liveness {
            last_heard: Instant::now(),
            failed_calls: 0,
        });
        entry.failed_calls += 1;
        let failed = entry.failed_calls;
        drop(entry);
        if failed >= 3 {
            warn!(node = id, failed, error = %err, "peer keeps failing");
        }
    }

    /// Time since the peer was last heard from.
    pub fn time_since(&self, id: &str) -> Option<Duration> {
        self.heard.get(id).map(|e| e.last_heard.elapsed())
    }

    /// True when the peer has been silent beyond the keepalive window.
    pub fn timed_out(&self, id: &str) -> bool {
        match self.time_since(id) {
            Some(elapsed) => elapsed > self.window,
            None => true, // never heard from
        }
    }

    /// Consecutive failures recorded against the peer.
    pub fn failures(&self, id: &str) -> u32 {
        self.heard.get(id).map(|e| e.failed_calls).unwrap_or(0)
    }

    /// Forget a removed peer.
    pub fn forget(&self, id: &str) {
        self.heard.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_heard_from_and_timeout() {
        let tracker = KeepaliveTracker::new(Duration::from_millis(50));
        assert!(tracker.timed_out("t1"));
        tracker.heard_from("t1", false);
        assert!(!tracker.timed_out("t1"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(tracker.timed_out("t1"));
    }

    #[test]
    fn test_on_err_accumulates_and_reset_forgives() {
        let tracker = KeepaliveTracker::new(Duration::from_secs(10));
        tracker.heard_from("t1", false);
        tracker.on_err("t1", &Error::Timeout);
        tracker.on_err("t1", &Error::Timeout);
        assert_eq!(tracker.failures("t1"), 2);

        // periodic beat does not forgive
        tracker.heard_from("t1", false);
        assert_eq!(tracker.failures("t1"), 2);

        // full re-registration does
        tracker.heard_from("t1", true);
        assert_eq!(tracker.failures("t1"), 0);
    }

    #[test]
    fn test_forget() {
        let tracker = KeepaliveTracker::new(Duration::from_secs(10));
        tracker.heard_from("t1", false);
        tracker.forget("t1");
        assert!(tracker.timed_out("t1"));
    }
}
