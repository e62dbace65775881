//! Property-based tests for extension liveness and version checks.
//!
//! Verifies:
//! - connected and stale are exclusive once a sync has happened
//! - connected iff the last sync is younger than the threshold
//! - is_reconnect iff the poll gap exceeds RECONNECT_GAP
//! - version_mismatch is symmetric and false whenever major.minor agree
//! - active test IDs behave like a sorted set

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use gasoline_core::extension_state::{
    ExtensionState, RECONNECT_GAP, major_minor, version_mismatch,
};

const THRESHOLD: Duration = Duration::from_secs(10);

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_version() -> impl Strategy<Value = String> {
    prop_oneof![
        (0u32..5, 0u32..5, 0u32..20).prop_map(|(a, b, c)| format!("{a}.{b}.{c}")),
        (0u32..5, 0u32..5).prop_map(|(a, b)| format!("{a}.{b}")),
        Just(String::new()),
        Just("dev".to_string()),
    ]
}

fn arb_gaps() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..20_000, 1..20)
}

// ────────────────────────────────────────────────────────────────────
// Properties
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn liveness_follows_gaps(gaps in arb_gaps(), check_ms in 0u64..30_000) {
        let mut state = ExtensionState::new();
        let start = Instant::now();
        let mut now = start;
        let mut last: Option<Instant> = None;
        for gap in gaps {
            now += Duration::from_millis(gap);
            let t = state.record_sync("s", None, "c", now, Utc::now(), THRESHOLD);
            match last {
                None => {
                    prop_assert!(t.first_connect);
                    prop_assert!(!t.is_reconnect);
                    prop_assert!(!t.was_disconnected);
                }
                Some(prev) => {
                    let elapsed = now - prev;
                    prop_assert!(!t.first_connect);
                    prop_assert_eq!(t.is_reconnect, elapsed > RECONNECT_GAP);
                    prop_assert_eq!(t.was_disconnected, elapsed >= THRESHOLD);
                    prop_assert_eq!(t.since_last_poll, elapsed);
                }
            }
            last = Some(now);
        }

        let check_at = now + Duration::from_millis(check_ms);
        let connected = state.is_connected(check_at, THRESHOLD);
        let stale = state.is_stale(check_at, THRESHOLD);
        prop_assert!(connected ^ stale);
        prop_assert_eq!(connected, Duration::from_millis(check_ms) < THRESHOLD);
        prop_assert_eq!(state.status(check_at, THRESHOLD).connected, connected);
    }

    #[test]
    fn mismatch_symmetric(a in arb_version(), b in arb_version()) {
        prop_assert_eq!(version_mismatch(&a, &b), version_mismatch(&b, &a));
    }

    #[test]
    fn same_major_minor_never_mismatch(major in 0u32..5, minor in 0u32..5, p1 in 0u32..50, p2 in 0u32..50) {
        let a = format!("{major}.{minor}.{p1}");
        let b = format!("{major}.{minor}.{p2}");
        prop_assert!(!version_mismatch(&a, &b));
        prop_assert_eq!(major_minor(&a), major_minor(&b));
    }

    #[test]
    fn mismatch_implies_both_parse(a in arb_version(), b in arb_version()) {
        if version_mismatch(&a, &b) {
            prop_assert!(major_minor(&a).is_some());
            prop_assert!(major_minor(&b).is_some());
            prop_assert_ne!(major_minor(&a), major_minor(&b));
        }
    }

    #[test]
    fn test_ids_match_set_model(ops in prop::collection::vec((any::<bool>(), 0u8..6), 0..40)) {
        let mut state = ExtensionState::new();
        let mut model = BTreeSet::new();
        for (start, id) in ops {
            let id = format!("test-{id}");
            if start {
                state.start_test(&id);
                model.insert(id);
            } else {
                state.end_test(&id);
                model.remove(&id);
            }
        }
        let expected: Vec<String> = model.into_iter().collect();
        prop_assert_eq!(state.active_test_id_count(), expected.len());
        prop_assert_eq!(state.active_test_ids(), expected);
    }
}
