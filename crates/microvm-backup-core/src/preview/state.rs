//! Shared state guarded by one mutex with one associated condition variable,
//! plus the per-archive single-flight completion handle.
//!
//! Mirrors the teacher's `pool.rs` handoff primitive (`Mutex<VecDeque<_>>` +
//! `Condvar`) but adds the priority-queue and membership-set bookkeeping this
//! service's admission rules require.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::archive::ArchiveInfo;

/// One of four outcomes for a previewed archive. Only `Ready` is cacheable.
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewRecord {
    Ready { text: String, info: ArchiveInfo },
    Loading { text: String },
    Timeout { text: String },
    Error { text: String },
}

impl PreviewRecord {
    pub fn status(&self) -> &'static str {
        match self {
            PreviewRecord::Ready { .. } => "ready",
            PreviewRecord::Loading { .. } => "loading",
            PreviewRecord::Timeout { .. } => "timeout",
            PreviewRecord::Error { .. } => "error",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            PreviewRecord::Ready { text, .. } => text,
            PreviewRecord::Loading { text } => text,
            PreviewRecord::Timeout { text } => text,
            PreviewRecord::Error { text } => text,
        }
    }
}

/// Many-waiters, one-producer completion handle for a single in-flight fetch.
/// The cache mutex is never held while waiting on this — only this handle's
/// own (separate) mutex is.
pub struct Completion {
    result: Mutex<Option<PreviewRecord>>,
    cvar: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cvar: Condvar::new(),
        }
    }

    pub fn publish(&self, record: PreviewRecord) {
        let mut guard = self.result.lock().expect("completion mutex poisoned");
        *guard = Some(record);
        self.cvar.notify_all();
    }

    /// Waits up to `dur` for a result. Returns `None` on expiry — the
    /// underlying fetch is not cancelled; its eventual success still
    /// populates the cache for the next caller.
    pub fn wait_timeout(&self, dur: Duration) -> Option<PreviewRecord> {
        let guard = self.result.lock().expect("completion mutex poisoned");
        let (guard, _) = self
            .cvar
            .wait_timeout_while(guard, dur, |r| r.is_none())
            .expect("completion condvar poisoned");
        guard.clone()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of work dequeued by a worker: which archive, and whether it is a
/// demand fetch (with its retry deadline) or a single-attempt prefetch.
pub enum WorkItem {
    Demand { archive: String, deadline: Instant },
    Prefetch { archive: String },
}

/// All of C5's shared bookkeeping. See the invariants enumerated in the
/// module-level documentation of `preview::mod`.
pub struct PreviewState {
    pub records: HashMap<String, PreviewRecord>,
    pub inflight: HashMap<String, std::sync::Arc<Completion>>,
    pub demand_deadlines: HashMap<String, Instant>,
    pub demand_queue: VecDeque<String>,
    pub prefetch_queue: VecDeque<String>,
    pub queued_demand: HashSet<String>,
    pub queued_prefetch: HashSet<String>,
    pub active_demand: usize,
    pub stop: bool,
}

impl PreviewState {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            inflight: HashMap::new(),
            demand_deadlines: HashMap::new(),
            demand_queue: VecDeque::new(),
            prefetch_queue: VecDeque::new(),
            queued_demand: HashSet::new(),
            queued_prefetch: HashSet::new(),
            active_demand: 0,
            stop: false,
        }
    }

    /// True iff no demand is queued or currently executing — the gate that
    /// admits new prefetches.
    pub fn no_demand_pending(&self) -> bool {
        self.active_demand == 0 && self.demand_queue.is_empty()
    }
}

impl Default for PreviewState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_wait_timeout_expires_without_publish() {
        let c = Completion::new();
        let result = c.wait_timeout(Duration::from_millis(20));
        assert!(result.is_none());
    }

    #[test]
    fn test_completion_publish_then_wait_returns_immediately() {
        let c = Completion::new();
        c.publish(PreviewRecord::Ready {
            text: "ok".to_string(),
            info: ArchiveInfo::unknown("a"),
        });
        let result = c.wait_timeout(Duration::from_millis(20));
        assert_eq!(result.unwrap().status(), "ready");
    }

    #[test]
    fn test_no_demand_pending_true_when_empty() {
        let state = PreviewState::new();
        assert!(state.no_demand_pending());
    }

    #[test]
    fn test_no_demand_pending_false_with_active_demand() {
        let mut state = PreviewState::new();
        state.active_demand = 1;
        assert!(!state.no_demand_pending());
    }

    #[test]
    fn test_no_demand_pending_false_with_queued_demand() {
        let mut state = PreviewState::new();
        state.demand_queue.push_back("a".to_string());
        assert!(!state.no_demand_pending());
    }
}
