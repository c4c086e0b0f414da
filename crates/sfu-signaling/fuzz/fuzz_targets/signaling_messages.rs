#![no_main]

use libfuzzer_sys::fuzz_target;
use sfu_signaling::signaling::protocol::ServerMessage;
use sfu_signaling::signaling::ClientEnvelope;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Parsing must never panic; bad frames become InvalidFrame
    match ClientEnvelope::parse(text) {
        Ok(envelope) => {
            // Every accepted request must survive validation again
            assert!(envelope.request.validate().is_ok());
        }
        Err(invalid) => {
            // Error replies must always encode
            let reply = ServerMessage::error(invalid.id, &invalid.error);
            assert!(reply.to_json().is_ok());
        }
    }
});
