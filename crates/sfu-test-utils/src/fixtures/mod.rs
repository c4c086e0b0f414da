//! Negotiation payloads accepted by the loopback engine.
//!
//! The loopback engine supports `audio/opus` and `video/VP8`. Anything else
//! is rejected at produce time or fails `can_consume`.

use common::types::MediaKind;
use serde_json::{json, Value};

/// DTLS parameters with one SHA-256 fingerprint.
#[must_use]
pub fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{
            "algorithm": "sha-256",
            "value": "82:5A:68:3D:36:C3:0A:DE:AF:E7:32:43:D2:88:83:57"
        }]
    })
}

/// DTLS parameters the engine rejects (no fingerprints).
#[must_use]
pub fn invalid_dtls_parameters() -> Value {
    json!({ "role": "client", "fingerprints": [] })
}

/// Single-encoding Opus send parameters.
#[must_use]
pub fn opus_rtp_parameters() -> Value {
    json!({
        "mid": "0",
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 100,
            "clockRate": 48000,
            "channels": 2
        }],
        "encodings": [{ "ssrc": 11_111_111 }]
    })
}

/// Single-encoding VP8 send parameters.
#[must_use]
pub fn vp8_rtp_parameters() -> Value {
    json!({
        "mid": "1",
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 101,
            "clockRate": 90000
        }],
        "encodings": [{ "ssrc": 22_222_222 }]
    })
}

/// Three-layer VP8 simulcast send parameters.
#[must_use]
pub fn vp8_simulcast_rtp_parameters() -> Value {
    json!({
        "mid": "1",
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 101,
            "clockRate": 90000
        }],
        "encodings": [
            { "rid": "r0", "scalabilityMode": "L1T3", "maxBitrate": 100_000 },
            { "rid": "r1", "scalabilityMode": "L1T3", "maxBitrate": 300_000 },
            { "rid": "r2", "scalabilityMode": "L1T3", "maxBitrate": 900_000 }
        ]
    })
}

/// Default send parameters for `kind`.
#[must_use]
pub fn rtp_parameters(kind: MediaKind) -> Value {
    match kind {
        MediaKind::Audio => opus_rtp_parameters(),
        MediaKind::Video => vp8_rtp_parameters(),
    }
}

/// Receive capabilities covering every loopback codec.
#[must_use]
pub fn client_rtp_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ],
        "headerExtensions": []
    })
}

/// Receive capabilities with no codec in common with the loopback engine.
#[must_use]
pub fn h264_only_rtp_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "video", "mimeType": "video/H264", "clockRate": 90000 }
        ],
        "headerExtensions": []
    })
}
