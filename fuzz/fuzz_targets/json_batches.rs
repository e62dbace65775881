#![no_main]

use gasoline_core::capture::Capture;
use gasoline_core::clock::ManualClock;
use gasoline_core::config::BridgeConfig;
use gasoline_core::types::{EnhancedAction, ExtensionLog, NetworkBody, WebSocketEvent};
use libfuzzer_sys::fuzz_target;
use serde::Deserialize;

/// One POST body per buffer, the way the extension batches them.
#[derive(Deserialize)]
#[serde(tag = "kind", content = "entries", rename_all = "snake_case")]
enum Batch {
    Websocket(Vec<WebSocketEvent>),
    Network(Vec<NetworkBody>),
    Actions(Vec<EnhancedAction>),
    Logs(Vec<ExtensionLog>),
}

fn small_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.buffers.max_ws_events = 32;
    config.buffers.max_network_bodies = 16;
    config.buffers.max_enhanced_actions = 16;
    config.buffers.max_extension_logs = 32;
    config.buffers.max_request_body = 128;
    config.buffers.max_response_body = 128;
    config
}

fuzz_target!(|data: &[u8]| {
    let Ok(batches) = serde_json::from_slice::<Vec<Batch>>(data) else {
        return;
    };
    let capture = Capture::with_clock(small_config(), ManualClock::new().shared());
    let mut added = [0u64; 4];
    for batch in batches {
        match batch {
            Batch::Websocket(events) => {
                added[0] += events.len() as u64;
                capture.add_websocket_events(events);
            }
            Batch::Network(bodies) => {
                added[1] += bodies.len() as u64;
                capture.add_network_bodies(bodies);
            }
            Batch::Actions(actions) => {
                added[2] += actions.len() as u64;
                capture.add_enhanced_actions(actions);
            }
            Batch::Logs(logs) => {
                added[3] += logs.len() as u64;
                capture.add_extension_logs(logs);
            }
        }
    }

    let snap = capture.snapshot();
    assert!(snap.websocket_count <= 32);
    assert!(snap.network_count <= 16);
    assert!(snap.action_count <= 16);
    assert!(snap.extension_log_count <= 32);
    assert_eq!(snap.websocket_total_added, added[0]);
    assert_eq!(snap.network_total_added, added[1]);
    assert_eq!(snap.action_total_added, added[2]);
    assert_eq!(snap.extension_log_total_added, added[3]);
    for body in capture.get_all_network_bodies() {
        assert!(body.request_body.len() <= 128);
        assert!(body.response_body.len() <= 128);
    }
    let _ = capture.websocket_status(&Default::default());
});
