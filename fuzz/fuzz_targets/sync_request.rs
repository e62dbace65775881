#![no_main]

use gasoline_core::commands::CommandStatus;
use gasoline_core::sync::{SyncRequest, SyncResponse};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(req) = serde_json::from_slice::<SyncRequest>(data) {
        let encoded = serde_json::to_vec(&req).expect("request re-encodes");
        let back: SyncRequest = serde_json::from_slice(&encoded).expect("request re-parses");
        assert_eq!(back.command_results.len(), req.command_results.len());
        for res in &req.command_results {
            let status = CommandStatus::normalize(&res.status);
            assert_eq!(CommandStatus::normalize(status.as_str()), status);
        }
    }
    let _ = serde_json::from_slice::<SyncResponse>(data);
});
