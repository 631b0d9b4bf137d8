//! Process-wide quotas
//!
//! Three counters advance over a run: records read from the index, files
//! extracted, and files truncated. Each may have a ceiling. Every operation is
//! a single check-and-increment under one lock, so two workers racing for the
//! last slot under a ceiling can never both win.
//!
//! Extraction uses a two-step reservation. A worker claims an
//! [`ExtractionSlot`] before it fetches and commits it after the sink accepted
//! the bytes. Dropping an uncommitted slot gives it back and wakes workers
//! waiting in [`QuotaTracker::reserve_extracted`]. Committed counts never
//! decrease, and no record is fetched once the remaining extraction room is
//! spoken for by records already in flight.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// Upper bound for one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ceiling {
    #[default]
    Unbounded,
    AtMost(u64),
}

impl Ceiling {
    /// Interpret a configured value where `-1` means unbounded.
    pub fn from_limit(limit: i64) -> Option<Self> {
        match limit {
            -1 => Some(Ceiling::Unbounded),
            n if n >= 0 => Some(Ceiling::AtMost(n as u64)),
            _ => None,
        }
    }

    fn admits(self, count: u64) -> bool {
        match self {
            Ceiling::Unbounded => true,
            Ceiling::AtMost(max) => count < max,
        }
    }

    fn reached(self, count: u64) -> bool {
        !self.admits(count)
    }
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ceiling::Unbounded => write!(f, "unbounded"),
            Ceiling::AtMost(n) => write!(f, "{}", n),
        }
    }
}

/// Ceilings for the three counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaLimits {
    pub max_records: Ceiling,
    pub max_files_extracted: Ceiling,
    pub max_files_truncated: Ceiling,
}

#[derive(Debug, Default)]
struct QuotaState {
    records_seen: u64,
    files_extracted: u64,
    files_truncated: u64,
    extraction_reserved: u64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QuotaSnapshot {
    pub records_seen: u64,
    pub files_extracted: u64,
    pub files_truncated: u64,
    pub extraction_in_flight: u64,
}

/// Shared quota state for one run.
#[derive(Debug)]
pub struct QuotaTracker {
    limits: QuotaLimits,
    state: Mutex<QuotaState>,
    halted: AtomicBool,
    settled: Notify,
}

impl QuotaTracker {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(QuotaState::default()),
            halted: AtomicBool::new(false),
            settled: Notify::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(QuotaLimits::default())
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    // Every critical section is a handful of integer operations with no
    // panicking paths, so a poisoned lock still holds consistent counters.
    fn state(&self) -> MutexGuard<'_, QuotaState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one record read from the index, unless the record ceiling is hit.
    pub fn try_admit_record(&self) -> bool {
        let mut state = self.state();
        if self.limits.max_records.admits(state.records_seen) {
            state.records_seen += 1;
            true
        } else {
            false
        }
    }

    /// Count one extracted file in a single step.
    pub fn try_count_extracted(&self) -> bool {
        match self.try_reserve_extracted() {
            Some(slot) => {
                slot.commit();
                true
            }
            None => false,
        }
    }

    /// Claim room for one extracted file without counting it yet.
    pub fn try_reserve_extracted(&self) -> Option<ExtractionSlot<'_>> {
        let mut state = self.state();
        self.claim(&mut state)
    }

    /// Claim room for one extracted file, waiting while all remaining room is
    /// held by uncommitted slots.
    ///
    /// Returns `None` once committed files reach the extraction ceiling, or
    /// after [`QuotaTracker::halt`].
    pub async fn reserve_extracted(&self) -> Option<ExtractionSlot<'_>> {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            // registered before the check, so a settle in between still wakes us
            settled.as_mut().enable();

            if self.halted.load(Ordering::Acquire) {
                return None;
            }
            {
                let mut state = self.state();
                if self.limits.max_files_extracted.reached(state.files_extracted) {
                    return None;
                }
                if let Some(slot) = self.claim(&mut state) {
                    return Some(slot);
                }
            }

            settled.await;
        }
    }

    fn claim(&self, state: &mut QuotaState) -> Option<ExtractionSlot<'_>> {
        let claimed = state.files_extracted + state.extraction_reserved;
        if !self.limits.max_files_extracted.admits(claimed) {
            return None;
        }
        state.extraction_reserved += 1;
        Some(ExtractionSlot {
            tracker: self,
            settled: false,
        })
    }

    /// Count one truncated file, unless the truncation ceiling is hit.
    pub fn try_count_truncated(&self) -> bool {
        let mut state = self.state();
        if self.limits.max_files_truncated.admits(state.files_truncated) {
            state.files_truncated += 1;
            true
        } else {
            false
        }
    }

    /// True once any ceiling is reached, or after [`QuotaTracker::halt`].
    ///
    /// The producer polls this to stop reading the index. Work already
    /// handed to a worker is not cancelled.
    pub fn should_stop(&self) -> bool {
        if self.halted.load(Ordering::Acquire) {
            return true;
        }
        let state = self.state();
        self.limits.max_records.reached(state.records_seen) || self.outputs_reached(&state)
    }

    /// True once the extracted or truncated ceiling is reached.
    ///
    /// Workers check this before starting on a queued record. Reaching the
    /// record ceiling alone does not stop records that were already admitted.
    pub fn outputs_exhausted(&self) -> bool {
        if self.halted.load(Ordering::Acquire) {
            return true;
        }
        let state = self.state();
        self.outputs_reached(&state)
    }

    fn outputs_reached(&self, state: &QuotaState) -> bool {
        self.limits.max_files_extracted.reached(state.files_extracted)
            || self.limits.max_files_truncated.reached(state.files_truncated)
    }

    /// Stop admission regardless of counters, e.g. after a fatal error.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.settled.notify_waiters();
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let state = self.state();
        QuotaSnapshot {
            records_seen: state.records_seen,
            files_extracted: state.files_extracted,
            files_truncated: state.files_truncated,
            extraction_in_flight: state.extraction_reserved,
        }
    }

    fn settle_reservation(&self, commit: bool) {
        {
            let mut state = self.state();
            state.extraction_reserved = state.extraction_reserved.saturating_sub(1);
            if commit {
                state.files_extracted += 1;
            }
        }
        self.settled.notify_waiters();
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Claimed room for one extracted file.
///
/// Commit it once the file is stored. Dropping it without committing gives
/// the room back to other workers.
#[must_use = "an extraction slot is released when dropped"]
#[derive(Debug)]
pub struct ExtractionSlot<'a> {
    tracker: &'a QuotaTracker,
    settled: bool,
}

impl ExtractionSlot<'_> {
    pub fn commit(mut self) {
        self.settled = true;
        self.tracker.settle_reservation(true);
    }
}

impl Drop for ExtractionSlot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.settle_reservation(false);
        }
    }
}
