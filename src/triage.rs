//! Triage capture: a short-lived handoff slot between a sysadmin-request
//! trigger and the task that consumes it (spec.md §4.6).
//!
//! Entries are claimed exactly once via `take`; a background sweep evicts
//! anything left unclaimed past its expiry rather than per-entry timers,
//! matching the scheduler's own tick-based liveness model.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct CapturedEntry {
    payload: Value,
    captured_at: Instant,
}

/// `DashMap`-backed capture table keyed by `requestId`.
pub struct TriageCapture {
    entries: DashMap<String, CapturedEntry>,
    expiry: Duration,
}

impl TriageCapture {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            expiry,
        }
    }

    pub fn put(&self, request_id: String, payload: Value) {
        self.entries.insert(
            request_id,
            CapturedEntry {
                payload,
                captured_at: Instant::now(),
            },
        );
    }

    /// Remove and return a capture if present and not yet expired.
    pub fn take(&self, request_id: &str) -> Option<Value> {
        let (_, entry) = self.entries.remove(request_id)?;
        if entry.captured_at.elapsed() > self.expiry {
            return None;
        }
        Some(entry.payload)
    }

    fn sweep(&self) {
        let expiry = self.expiry;
        self.entries
            .retain(|_, entry| entry.captured_at.elapsed() <= expiry);
    }
}

/// Spawn the background sweep loop. The returned handle should be aborted on
/// node shutdown.
pub fn spawn_sweeper(capture: Arc<TriageCapture>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            capture.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn take_consumes_entry_exactly_once() {
        let capture = TriageCapture::new(Duration::from_secs(300));
        capture.put("triage-1".into(), json!({"text": "hi"}));

        assert!(capture.take("triage-1").is_some());
        assert!(capture.take("triage-1").is_none());
    }

    #[test]
    fn sweep_evicts_expired_entries() {
        let capture = TriageCapture::new(Duration::from_millis(0));
        capture.put("triage-1".into(), json!({"text": "hi"}));
        std::thread::sleep(Duration::from_millis(5));
        capture.sweep();
        assert!(capture.take("triage-1").is_none());
    }
}
