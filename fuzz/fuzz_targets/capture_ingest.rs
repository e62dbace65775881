#![no_main]

use std::time::Duration;

use gasoline_core::capture::Capture;
use gasoline_core::clock::ManualClock;
use gasoline_core::config::BridgeConfig;
use gasoline_core::connection_tracker::format_duration;
use gasoline_core::query_dispatcher::PendingQuery;
use gasoline_core::types::{
    EnhancedAction, EnhancedActionFilter, NetworkBody, NetworkBodyFilter, WebSocketEvent,
    WebSocketEventFilter, WebSocketStatusFilter,
};
use libfuzzer_sys::fuzz_target;

const EVENTS: &[&str] = &["open", "close", "error", "message", "bogus"];
const DIRECTIONS: &[&str] = &["incoming", "outgoing", ""];

fn small_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.buffers.max_ws_events = 16;
    config.buffers.max_network_bodies = 8;
    config.buffers.max_enhanced_actions = 8;
    config.buffers.max_request_body = 64;
    config.buffers.max_response_body = 64;
    config.memory.soft_limit = 4_000;
    config.memory.hard_limit = 8_000;
    config.memory.critical_limit = 16_000;
    config.connections.max_active = 4;
    config.connections.max_closed = 2;
    config
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fuzz_target!(|data: &[u8]| {
    let clock = ManualClock::new();
    let capture = Capture::with_clock(small_config(), clock.shared());

    for chunk in data.chunks(6) {
        let op = chunk[0];
        let arg = chunk.get(1).copied().unwrap_or(0);
        let rest = chunk.get(2..).unwrap_or(&[]);
        match op % 8 {
            0 => capture.add_websocket_events(vec![WebSocketEvent {
                ts: text(rest),
                event: EVENTS[arg as usize % EVENTS.len()].to_string(),
                id: format!("ws-{}", arg % 6),
                url: "wss://fuzz".to_string(),
                direction: DIRECTIONS[arg as usize % DIRECTIONS.len()].to_string(),
                data: text(rest).repeat(arg as usize % 40),
                ..Default::default()
            }]),
            1 => capture.add_network_bodies(vec![NetworkBody {
                status: u16::from(arg) * 3,
                request_body: text(rest).repeat(arg as usize % 50),
                response_body: "é".repeat(arg as usize),
                ..Default::default()
            }]),
            2 => capture.add_enhanced_actions(vec![EnhancedAction {
                input_type: if arg % 2 == 0 { "password" } else { "text" }.to_string(),
                value: text(rest),
                ..Default::default()
            }]),
            3 => {
                let _ = capture.admit(u64::from(arg) * 10);
            }
            4 => {
                capture.queries().create_pending_query(
                    PendingQuery::new("dom", serde_json::Value::Null)
                        .with_correlation_id(format!("c-{arg}")),
                );
            }
            5 => {
                let corr = format!("c-{}", arg);
                let status = ["complete", "error", "timeout", "weird"][arg as usize % 4];
                capture
                    .queries()
                    .apply_command_result(&corr, status, None, "");
            }
            6 => {
                clock.advance(Duration::from_millis(u64::from(arg) * 100));
                let _ = capture.get_pending_queries_disconnect_aware();
            }
            _ => {
                let _ = capture.get_websocket_events(&WebSocketEventFilter::default());
                let _ = capture.get_network_bodies(&NetworkBodyFilter::default());
                let _ = capture.get_enhanced_actions(&EnhancedActionFilter {
                    last_n: Some(arg as usize),
                    ..Default::default()
                });
                let status = capture.websocket_status(&WebSocketStatusFilter::default());
                assert!(status.connections.len() <= 4);
                assert!(status.closed.len() <= 2);
                let _ = format_duration(Duration::from_millis(u64::from(arg) * 997));
            }
        }

        let snap = capture.snapshot();
        assert!(snap.websocket_count <= 16);
        assert!(snap.network_count <= 8);
        assert!(snap.action_count <= 8);
        for body in capture.get_all_network_bodies() {
            assert!(body.request_body.len() <= 64);
            assert!(body.response_body.len() <= 64);
        }
    }

    let health = capture.health();
    assert_eq!(health.websocket_count, capture.snapshot().websocket_count);
});
