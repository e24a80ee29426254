//! Modbus-RTU frame codec (hex-transcoded).
//!
//! Frames cross the HTTP tunnel as uppercase ASCII hex. Wire layout:
//!
//! ```text
//! read request    [slave][0x03][addr_hi][addr_lo][cnt_hi][cnt_lo][crc_lo][crc_hi]
//! write request   [slave][0x06][addr_hi][addr_lo][val_hi][val_lo][crc_lo][crc_hi]
//! read response   [slave][0x03][byte_count][data…][crc_lo][crc_hi]
//! exception       [slave][func | 0x80][code][crc_lo][crc_hi]
//! ```
//!
//! CRC-16 is the Modbus variant (reflected poly 0xA001, init 0xFFFF),
//! serialized low byte first. Register words are big-endian.

use crc::{Crc, CRC_16_MODBUS};

use crate::error::FrameError;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Smallest parseable frame: slave + function + one payload byte + CRC.
const MIN_FRAME_LEN: usize = 5;

/// Read-holding-registers function code.
pub const FUNC_READ_HOLDING: u8 = 0x03;

/// Write-single-register function code.
pub const FUNC_WRITE_SINGLE: u8 = 0x06;

/// CRC-16/MODBUS over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

// ── Hex transcoding ──────────────────────────────────────────

/// Decode ASCII hex, tolerating whitespace and any other non-hex bytes
/// (they are skipped). An odd trailing nibble is silently dropped.
pub fn hex_to_bytes(hex: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(hex.len() / 2);
    let mut hi: Option<u8> = None;
    for c in hex.chars() {
        let v = match c.to_digit(16) {
            Some(v) => v as u8,
            None => continue,
        };
        match hi.take() {
            None => hi = Some(v),
            Some(h) => out.push((h << 4) | v),
        }
    }
    out
}

/// Encode to uppercase hex, no separators.
pub fn bytes_to_hex(data: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push(HEX[(b >> 4) as usize] as char);
        s.push(HEX[(b & 0x0F) as usize] as char);
    }
    s
}

// ── Request builders ─────────────────────────────────────────

fn finish_frame(mut buf: Vec<u8>) -> String {
    let c = crc16(&buf);
    buf.push((c & 0xFF) as u8);
    buf.push((c >> 8) as u8);
    bytes_to_hex(&buf)
}

/// Build a read-holding-registers request as a 16-hex-char string.
pub fn make_read_holding(slave: u8, start_addr: u16, count: u16) -> String {
    let buf = vec![
        slave,
        FUNC_READ_HOLDING,
        (start_addr >> 8) as u8,
        (start_addr & 0xFF) as u8,
        (count >> 8) as u8,
        (count & 0xFF) as u8,
    ];
    finish_frame(buf)
}

/// Build a write-single-register request as a 16-hex-char string.
pub fn make_write_single(slave: u8, reg_addr: u16, value: u16) -> String {
    let buf = vec![
        slave,
        FUNC_WRITE_SINGLE,
        (reg_addr >> 8) as u8,
        (reg_addr & 0xFF) as u8,
        (value >> 8) as u8,
        (value & 0xFF) as u8,
    ];
    finish_frame(buf)
}

// ── Response parsers ─────────────────────────────────────────

/// CRC-check a decoded frame and strip nothing — returns the full byte
/// vector once the trailer validates.
fn checked_bytes(resp_hex: &str) -> Result<Vec<u8>, FrameError> {
    let bytes = hex_to_bytes(resp_hex);
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort);
    }
    let n = bytes.len();
    let given = u16::from(bytes[n - 2]) | (u16::from(bytes[n - 1]) << 8);
    if given != crc16(&bytes[..n - 2]) {
        return Err(FrameError::CrcMismatch);
    }
    Ok(bytes)
}

/// Parse a normal read response into `(slave, function, registers)`.
pub fn parse_read_response(resp_hex: &str) -> Result<(u8, u8, Vec<u16>), FrameError> {
    let bytes = checked_bytes(resp_hex)?;
    let slave = bytes[0];
    let func = bytes[1];
    if func & 0x80 != 0 {
        return Err(FrameError::ExceptionFrame);
    }
    if func != FUNC_READ_HOLDING {
        return Err(FrameError::WrongFunction);
    }
    let byte_count = bytes[2] as usize;
    if 3 + byte_count + 2 != bytes.len() {
        return Err(FrameError::LengthMismatch);
    }
    if byte_count % 2 != 0 {
        return Err(FrameError::OddByteCount);
    }
    let regs = bytes[3..3 + byte_count]
        .chunks_exact(2)
        .map(|w| (u16::from(w[0]) << 8) | u16::from(w[1]))
        .collect();
    Ok((slave, func, regs))
}

/// Parse an exception response into `(slave, function_with_msb, code)`.
pub fn parse_exception_response(resp_hex: &str) -> Result<(u8, u8, u8), FrameError> {
    let bytes = checked_bytes(resp_hex)?;
    let slave = bytes[0];
    let func = bytes[1];
    if func & 0x80 == 0 {
        return Err(FrameError::WrongFunction);
    }
    Ok((slave, func, bytes[2]))
}

/// Human-readable name for a Modbus exception code.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge (processing delayed)",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Failed to Respond",
        _ => "Unknown Modbus exception",
    }
}

// ── Tests ────────────────────────────────────────────────────
