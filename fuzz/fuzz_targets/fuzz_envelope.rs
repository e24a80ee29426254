//! Fuzz target: envelope verification.
//!
//! Arbitrary bytes must never panic the verifier, never advance the
//! nonce high-water mark on rejection, and never verify under a key the
//! fuzzer does not know.
//!
//! cargo fuzz run fuzz_envelope

#![no_main]

use gridpulse::security;
use libfuzzer_sys::fuzz_target;

const PSK: &[u8] = b"fuzz-secret-key";

fuzz_target!(|data: &[u8]| {
    let Ok(text) = core::str::from_utf8(data) else {
        return;
    };

    let mut last_seen = 7u64;
    let result = security::unwrap_and_verify(text, PSK, &mut last_seen, true);
    if result.is_err() {
        assert_eq!(last_seen, 7, "rejection must not advance the nonce");
    }
});
