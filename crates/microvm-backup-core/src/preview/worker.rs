//! The two fixed worker threads: priority draining, jittered-backoff retry
//! for demand fetches, single-attempt-no-retry for prefetches, and the
//! publication ordering that keeps `records` consistent with `inflight`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use super::state::{PreviewRecord, WorkItem};
use super::Inner;

const RETRY_BASE: Duration = Duration::from_millis(80);
const RETRY_CAP: Duration = Duration::from_millis(300);

pub fn worker_loop(inner: Arc<Inner>) {
    loop {
        match next_work(&inner) {
            None => return,
            Some(WorkItem::Demand { archive, deadline }) => run_demand(&inner, archive, deadline),
            Some(WorkItem::Prefetch { archive }) => run_prefetch(&inner, archive),
        }
    }
}

/// Blocks on the shared condition variable until there is work or shutdown
/// is requested. Demand is always drained before prefetch; prefetch is only
/// ever returned when no demand is queued or executing.
fn next_work(inner: &Arc<Inner>) -> Option<WorkItem> {
    let mut state = inner.state.lock().expect("preview state mutex poisoned");
    loop {
        if state.stop {
            return None;
        }
        if let Some(archive) = state.demand_queue.pop_front() {
            state.queued_demand.remove(&archive);
            state.active_demand += 1;
            let deadline = state
                .demand_deadlines
                .get(&archive)
                .copied()
                .unwrap_or_else(Instant::now);
            return Some(WorkItem::Demand { archive, deadline });
        }
        if state.no_demand_pending() {
            if let Some(archive) = state.prefetch_queue.pop_front() {
                state.queued_prefetch.remove(&archive);
                return Some(WorkItem::Prefetch { archive });
            }
        }
        state = inner.cvar.wait(state).expect("preview condvar poisoned");
    }
}

fn run_demand(inner: &Arc<Inner>, archive: String, deadline: Instant) {
    let mut attempt: u32 = 0;
    loop {
        match inner.client.fetch_archive_info(&inner.vm_cfg, &archive) {
            Ok(info) => {
                let record = PreviewRecord::Ready {
                    text: crate::summary::format_preview_text(&info),
                    info,
                };
                finish_demand(inner, &archive, record, true);
                return;
            }
            Err(err) => {
                let now = Instant::now();
                if inner.client.is_lock_failure(&err) && now < deadline {
                    let remaining = deadline.saturating_duration_since(now);
                    let base = RETRY_BASE.saturating_mul(1u32 << attempt.min(8)).min(RETRY_CAP);
                    let jitter_secs = rand::thread_rng().gen_range(0.0..(base.as_secs_f64() * 0.25));
                    let sleep_for = base.min(remaining) + Duration::from_secs_f64(jitter_secs);
                    std::thread::sleep(sleep_for.min(remaining));
                    attempt += 1;
                    continue;
                }
                let record = PreviewRecord::Error {
                    text: err.full_message(),
                };
                finish_demand(inner, &archive, record, false);
                return;
            }
        }
    }
}

fn run_prefetch(inner: &Arc<Inner>, archive: String) {
    // Single attempt only: prefetch failures are discarded, never retried,
    // never cached, so a cold repository lock never burns a demand-quality
    // retry budget on speculative work.
    let record = match inner.client.fetch_archive_info(&inner.vm_cfg, &archive) {
        Ok(info) => PreviewRecord::Ready {
            text: crate::summary::format_preview_text(&info),
            info,
        },
        Err(err) => PreviewRecord::Error {
            text: err.full_message(),
        },
    };
    let cacheable = matches!(record, PreviewRecord::Ready { .. });
    publish(inner, &archive, record, cacheable);
}

fn finish_demand(inner: &Arc<Inner>, archive: &str, record: PreviewRecord, cacheable: bool) {
    publish(inner, archive, record, cacheable);
    let mut state = inner.state.lock().expect("preview state mutex poisoned");
    state.active_demand = state.active_demand.saturating_sub(1);
    drop(state);
    inner.cvar.notify_all();
}

/// Inserts into `records` (if cacheable) and removes from `inflight` and
/// `demand_deadlines` under the state mutex, releases it, then fulfils the
/// completion — so any waiter who observes the completion has already had
/// the cache mutex released and can immediately re-query `records`.
fn publish(inner: &Arc<Inner>, archive: &str, record: PreviewRecord, cacheable: bool) {
    let completion = {
        let mut state = inner.state.lock().expect("preview state mutex poisoned");
        if cacheable {
            state.records.insert(archive.to_string(), record.clone());
        }
        state.demand_deadlines.remove(archive);
        state.inflight.remove(archive)
    };
    if let Some(completion) = completion {
        completion.publish(record);
    }
}
