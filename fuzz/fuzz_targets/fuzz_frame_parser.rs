//! Fuzz target: Modbus response parsers.
//!
//! Drives arbitrary (possibly non-hex) strings through both parsers and
//! asserts they never panic and that an accepted read response is
//! structurally sound.
//!
//! cargo fuzz run fuzz_frame_parser

#![no_main]

use gridpulse::modbus;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = core::str::from_utf8(data) else {
        return;
    };

    if let Ok((_, func, regs)) = modbus::parse_read_response(text) {
        assert_eq!(func, 0x03);
        assert!(regs.len() <= 125, "byte_count is one u8, so at most 125 regs");
    }

    if let Ok((_, func, _code)) = modbus::parse_exception_response(text) {
        assert!(func & 0x80 != 0, "accepted exception must have MSB set");
    }
});
