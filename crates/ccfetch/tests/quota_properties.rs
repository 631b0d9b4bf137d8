//! Property tests for quota accounting under concurrent load

use ccfetch::quota::{Ceiling, QuotaLimits, QuotaTracker};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

/// What a simulated worker does with an admitted record.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Extract,
    ExtractThenFailEmit,
    Truncate,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        3 => Just(Outcome::Extract),
        1 => Just(Outcome::ExtractThenFailEmit),
        2 => Just(Outcome::Truncate),
    ]
}

fn ceiling() -> impl Strategy<Value = i64> {
    prop_oneof![Just(-1i64), 0i64..20]
}

/// Drive the tracker the way a worker does, checking the invariant at every step.
fn work(quota: &QuotaTracker, plan: &[Outcome]) {
    for &step in plan {
        if !quota.try_admit_record() {
            return;
        }
        if quota.outputs_exhausted() {
            continue;
        }
        match step {
            Outcome::Extract => {
                if let Some(slot) = quota.try_reserve_extracted() {
                    slot.commit();
                }
            }
            Outcome::ExtractThenFailEmit => {
                if let Some(slot) = quota.try_reserve_extracted() {
                    drop(slot);
                    quota.try_count_truncated();
                }
            }
            Outcome::Truncate => {
                quota.try_count_truncated();
            }
        }

        let s = quota.snapshot();
        assert!(s.files_extracted + s.files_truncated <= s.records_seen);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ceilings_hold_under_concurrency(
        max_records in ceiling(),
        max_extracted in ceiling(),
        max_truncated in ceiling(),
        plans in prop::collection::vec(prop::collection::vec(outcome(), 0..40), 1..8),
    ) {
        let quota = Arc::new(QuotaTracker::new(QuotaLimits {
            max_records: Ceiling::from_limit(max_records).unwrap(),
            max_files_extracted: Ceiling::from_limit(max_extracted).unwrap(),
            max_files_truncated: Ceiling::from_limit(max_truncated).unwrap(),
        }));

        let handles: Vec<_> = plans
            .into_iter()
            .map(|plan| {
                let quota = quota.clone();
                thread::spawn(move || work(&quota, &plan))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let s = quota.snapshot();
        if max_records >= 0 {
            prop_assert!(s.records_seen <= max_records as u64);
        }
        if max_extracted >= 0 {
            prop_assert!(s.files_extracted <= max_extracted as u64);
        }
        if max_truncated >= 0 {
            prop_assert!(s.files_truncated <= max_truncated as u64);
        }
        prop_assert!(s.files_extracted + s.files_truncated <= s.records_seen);
        prop_assert_eq!(s.extraction_in_flight, 0);
    }

    #[test]
    fn unbounded_never_rejects(n in 0usize..500) {
        let quota = QuotaTracker::unbounded();
        for _ in 0..n {
            prop_assert!(quota.try_admit_record());
            prop_assert!(quota.try_count_extracted());
        }
        prop_assert!(!quota.should_stop());
        prop_assert_eq!(quota.snapshot().files_extracted, n as u64);
    }
}
