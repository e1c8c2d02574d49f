#![no_main]

use libfuzzer_sys::fuzz_target;

use fleetlink::protocol::{decode_client_frame, ClientMessage};

// Arbitrary text must decode or fail cleanly, never panic.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    match decode_client_frame(text) {
        Ok(ClientMessage::Command(req)) => {
            let targets = req.targets();
            assert!(targets.iter().all(|t| !t.trim().is_empty()));
        }
        Ok(frame) => {
            let _ = frame.kind();
        }
        Err(err) => {
            let _ = err.reason();
        }
    }
});
