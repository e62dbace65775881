//! Property-based tests for the capture composition root.
//!
//! Verifies, under arbitrary interleavings of ingest batches:
//! - Buffer counts never exceed their configured capacities
//! - total_added equals everything ever ingested, despite eviction
//! - Stored network bodies respect the body limits and cut on char boundaries
//! - Password values are never readable back
//! - Reads are newest first and bounded by the limit
//! - The network error counter matches a reference count of status >= 400
//! - Active test IDs tag exactly the batches ingested while active

use proptest::prelude::*;

use gasoline_core::capture::Capture;
use gasoline_core::clock::ManualClock;
use gasoline_core::config::BridgeConfig;
use gasoline_core::types::{
    EnhancedAction, EnhancedActionFilter, NetworkBody, NetworkBodyFilter, REDACTED_VALUE,
    WebSocketEvent, WebSocketEventFilter,
};

const MAX_WS: usize = 12;
const MAX_NET: usize = 6;
const MAX_ACTIONS: usize = 5;
const MAX_REQ: usize = 40;
const MAX_RESP: usize = 60;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Ws(Vec<String>),
    Net(Vec<(u16, usize, usize)>),
    Actions(Vec<(bool, String)>),
    StartTest(u8),
    EndTest(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop::collection::vec("[a-z]{0,8}", 0..6).prop_map(Op::Ws),
        prop::collection::vec((100u16..600, 0usize..100, 0usize..100), 0..4).prop_map(Op::Net),
        prop::collection::vec((any::<bool>(), "[a-z0-9]{1,8}"), 0..4).prop_map(Op::Actions),
        (0u8..3).prop_map(Op::StartTest),
        (0u8..3).prop_map(Op::EndTest),
    ]
}

fn config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.buffers.max_ws_events = MAX_WS;
    config.buffers.max_network_bodies = MAX_NET;
    config.buffers.max_enhanced_actions = MAX_ACTIONS;
    config.buffers.max_request_body = MAX_REQ;
    config.buffers.max_response_body = MAX_RESP;
    config.buffers.default_ws_limit = 4;
    config
}

// ────────────────────────────────────────────────────────────────────
// RefModel: totals only, the buffers themselves are covered elsewhere
// ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RefModel {
    ws_added: u64,
    net_added: u64,
    actions_added: u64,
    net_errors: u64,
}

fn apply(capture: &Capture, model: &mut RefModel, op: &Op) {
    match op {
        Op::Ws(payloads) => {
            model.ws_added += payloads.len() as u64;
            capture.add_websocket_events(
                payloads
                    .iter()
                    .map(|p| WebSocketEvent {
                        event: "message".to_string(),
                        id: "ws-1".to_string(),
                        direction: "incoming".to_string(),
                        data: p.clone(),
                        ..Default::default()
                    })
                    .collect(),
            );
        }
        Op::Net(bodies) => {
            model.net_added += bodies.len() as u64;
            model.net_errors += bodies.iter().filter(|(s, _, _)| *s >= 400).count() as u64;
            capture.add_network_bodies(
                bodies
                    .iter()
                    .map(|&(status, req, resp)| NetworkBody {
                        status,
                        request_body: "q".repeat(req),
                        response_body: "ü".repeat(resp),
                        ..Default::default()
                    })
                    .collect(),
            );
        }
        Op::Actions(actions) => {
            model.actions_added += actions.len() as u64;
            capture.add_enhanced_actions(
                actions
                    .iter()
                    .map(|(password, value)| EnhancedAction {
                        kind: "input".to_string(),
                        input_type: if *password { "password" } else { "text" }.to_string(),
                        value: value.clone(),
                        ..Default::default()
                    })
                    .collect(),
            );
        }
        Op::StartTest(id) => capture.set_test_boundary_start(&format!("t{id}")),
        Op::EndTest(id) => capture.set_test_boundary_end(&format!("t{id}")),
    }
}

// ────────────────────────────────────────────────────────────────────
// Properties
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn capture_matches_model(ops in prop::collection::vec(arb_op(), 1..40)) {
        let capture = Capture::with_clock(config(), ManualClock::new().shared());
        let mut model = RefModel::default();
        for op in &ops {
            apply(&capture, &mut model, op);

            let snap = capture.snapshot();
            prop_assert!(snap.websocket_count <= MAX_WS);
            prop_assert!(snap.network_count <= MAX_NET);
            prop_assert!(snap.action_count <= MAX_ACTIONS);
            prop_assert_eq!(snap.websocket_total_added, model.ws_added);
            prop_assert_eq!(snap.network_total_added, model.net_added);
            prop_assert_eq!(snap.action_total_added, model.actions_added);
            prop_assert_eq!(snap.network_error_total_added, model.net_errors);
        }
    }

    #[test]
    fn bodies_within_limits(ops in prop::collection::vec(arb_op(), 1..30)) {
        let capture = Capture::with_clock(config(), ManualClock::new().shared());
        let mut model = RefModel::default();
        for op in &ops {
            apply(&capture, &mut model, op);
        }
        for body in capture.get_all_network_bodies() {
            prop_assert!(body.request_body.len() <= MAX_REQ);
            prop_assert!(body.response_body.len() <= MAX_RESP);
            if body.request_truncated {
                prop_assert_eq!(body.request_body.len(), MAX_REQ);
            }
            prop_assert!(body.response_body.chars().all(|c| c == 'ü'));
        }
    }

    #[test]
    fn passwords_never_readable(ops in prop::collection::vec(arb_op(), 1..30)) {
        let capture = Capture::with_clock(config(), ManualClock::new().shared());
        let mut model = RefModel::default();
        for op in &ops {
            apply(&capture, &mut model, op);
        }
        for action in capture.get_enhanced_actions(&EnhancedActionFilter::default()) {
            if action.input_type == "password" {
                prop_assert_eq!(action.value.as_str(), REDACTED_VALUE);
            } else {
                prop_assert_ne!(action.value.as_str(), REDACTED_VALUE);
            }
        }
    }

    #[test]
    fn reads_newest_first_and_bounded(payloads in prop::collection::vec("[a-z]{1,6}", 1..30)) {
        let capture = Capture::with_clock(config(), ManualClock::new().shared());
        let mut model = RefModel::default();
        for p in &payloads {
            apply(&capture, &mut model, &Op::Ws(vec![p.clone()]));
        }
        let read = capture.get_websocket_events(&WebSocketEventFilter::default());
        prop_assert_eq!(read.len(), payloads.len().min(4));
        let expected: Vec<&String> = payloads.iter().rev().take(4).collect();
        let got: Vec<&String> = read.iter().map(|e| &e.data).collect();
        prop_assert_eq!(got, expected);

        let limited = capture.get_network_bodies(&NetworkBodyFilter {
            limit: Some(1),
            ..Default::default()
        });
        prop_assert!(limited.is_empty());
    }

    #[test]
    fn test_ids_tag_active_batches(ids in prop::collection::btree_set(0u8..5, 0..4)) {
        let capture = Capture::with_clock(config(), ManualClock::new().shared());
        let mut model = RefModel::default();
        for id in &ids {
            apply(&capture, &mut model, &Op::StartTest(*id));
        }
        apply(&capture, &mut model, &Op::Ws(vec!["tagged".to_string()]));
        for id in &ids {
            apply(&capture, &mut model, &Op::EndTest(*id));
        }
        apply(&capture, &mut model, &Op::Ws(vec!["untagged".to_string()]));

        let all = capture.get_all_websocket_events();
        let expected: Vec<String> = ids.iter().map(|id| format!("t{id}")).collect();
        prop_assert_eq!(&all[0].test_ids, &expected);
        prop_assert!(all[1].test_ids.is_empty());
        prop_assert!(capture.active_test_ids().is_empty());
    }
}
