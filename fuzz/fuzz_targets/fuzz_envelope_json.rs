//! Fuzz target for envelope parsing and payload decoding.
//!
//! Arbitrary request bodies must never panic: parsing, authentication and
//! decoding only return Ok or Err.

#![no_main]

use commune_server::pipeline::{DecodedCall, Envelope};
use commune_server::serializer::{JsonSerializer, Serializer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = Envelope::from_slice(data) else {
        return;
    };
    let _ = envelope.clone().authenticate(false);

    let Ok(verified) = envelope.authenticate(true) else {
        return;
    };
    let (payload, address) = verified.into_payload();
    if let Ok(payload) = JsonSerializer::default().deserialize(payload) {
        if let Ok(call) = DecodedCall::from_value(payload, &address) {
            let _ = call.age(i64::MAX);
            let _ = call.age(i64::MIN);
            let _ = call.call_args();
        }
    }
});
