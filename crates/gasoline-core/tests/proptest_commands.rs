//! Property-based tests for command status handling.
//!
//! Verifies:
//! - normalize is total, case- and whitespace-insensitive
//! - canonical names normalize to themselves
//! - unknown strings normalize to complete
//! - first terminal write wins in the dispatcher, whatever order statuses arrive
//! - failure statuses land in get_failed_commands exactly once

use proptest::prelude::*;
use std::sync::Arc;

use gasoline_core::clock::ManualClock;
use gasoline_core::commands::CommandStatus;
use gasoline_core::config::QueryConfig;
use gasoline_core::query_dispatcher::QueryDispatcher;

const KNOWN: &[&str] = &[
    "", "ok", "success", "succeeded", "done", "complete", "pending", "queued", "running",
    "still_processing", "error", "timeout", "expired", "cancelled", "canceled",
];

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_status() -> impl Strategy<Value = CommandStatus> {
    prop_oneof![
        Just(CommandStatus::Pending),
        Just(CommandStatus::Complete),
        Just(CommandStatus::Error),
        Just(CommandStatus::Timeout),
        Just(CommandStatus::Expired),
        Just(CommandStatus::Cancelled),
    ]
}

fn arb_known() -> impl Strategy<Value = &'static str> {
    prop::sample::select(KNOWN)
}

/// Random casing plus surrounding whitespace.
fn arb_noisy(raw: &'static str) -> impl Strategy<Value = String> {
    (prop::collection::vec(any::<bool>(), raw.len()), 0usize..3, 0usize..3).prop_map(
        move |(upper, pre, post)| {
            let body: String = raw
                .chars()
                .zip(upper)
                .map(|(c, u)| if u { c.to_ascii_uppercase() } else { c })
                .collect();
            format!("{}{}{}", " ".repeat(pre), body, "\t".repeat(post))
        },
    )
}

fn dispatcher() -> Arc<QueryDispatcher> {
    Arc::new(QueryDispatcher::new(
        QueryConfig::default(),
        ManualClock::new().shared(),
    ))
}

// ────────────────────────────────────────────────────────────────────
// Normalisation
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Canonical names are fixed points.
    #[test]
    fn prop_canonical_is_fixed_point(status in arb_status()) {
        prop_assert_eq!(CommandStatus::normalize(status.as_str()), status);
        prop_assert_eq!(status.to_string(), status.as_str());
    }

    /// Casing and padding never change the result.
    #[test]
    fn prop_noise_insensitive(
        (raw, noisy) in arb_known().prop_flat_map(|raw| (Just(raw), arb_noisy(raw)))
    ) {
        prop_assert_eq!(CommandStatus::normalize(&noisy), CommandStatus::normalize(raw));
    }

    /// Anything outside the vocabulary counts as success.
    #[test]
    fn prop_unknown_is_complete(raw in "[a-z_]{1,16}") {
        prop_assume!(!KNOWN.contains(&raw.as_str()));
        prop_assert_eq!(CommandStatus::normalize(&raw), CommandStatus::Complete);
    }

    /// Serde uses the snake_case canonical names.
    #[test]
    fn prop_serde_matches_as_str(status in arb_status()) {
        let json = serde_json::to_string(&status).unwrap();
        prop_assert_eq!(json, format!("\"{}\"", status.as_str()));
    }
}

// ────────────────────────────────────────────────────────────────────
// Terminal transitions
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The first terminal status applied is the one that sticks.
    #[test]
    fn prop_first_terminal_wins(statuses in prop::collection::vec(arb_known(), 1..8)) {
        let d = dispatcher();
        d.register_command("corr", "q-1", std::time::Duration::from_secs(30));
        let first_terminal = statuses
            .iter()
            .map(|s| CommandStatus::normalize(s))
            .find(|s| s.is_terminal());

        for raw in &statuses {
            d.apply_command_result("corr", raw, None, "");
        }

        let cmd = d.get_command_result("corr").unwrap();
        match first_terminal {
            Some(expected) => prop_assert_eq!(cmd.status, expected),
            None => prop_assert_eq!(cmd.status, CommandStatus::Pending),
        }
    }

    /// A failed command appears in the failed list exactly once.
    #[test]
    fn prop_failed_listed_once(
        status in prop::sample::select(&["error", "timeout", "expired", "cancelled"][..]),
        repeats in 1usize..5,
    ) {
        let d = dispatcher();
        d.register_command("corr", "q-1", std::time::Duration::from_secs(30));
        for _ in 0..repeats {
            d.apply_command_result("corr", status, None, "boom");
        }
        let failed = d.get_failed_commands();
        prop_assert_eq!(failed.iter().filter(|c| c.correlation_id == "corr").count(), 1);
    }
}
