//! Columnar delta + run-length batch codec (`delta_rle_v1`).
//!
//! Blob layout:
//!
//! ```text
//! ┌─────────┬──────────┬────────────┬──────────┬───────────────┬──────────────┬──────────┐
//! │ version │ n_fields │ n_samples  │ reserved │ initial values │ field streams │ crc32_le │
//! │ (1B)=1  │ (1B)     │ (2B LE)    │ (4B)=0   │ (2B LE each)   │ (opcodes)     │ (4B)     │
//! └─────────┴──────────┴────────────┴──────────┴───────────────┴──────────────┴──────────┘
//! ```
//!
//! Each per-field stream walks records 1..n: `0x00 <len:u8>` repeats the
//! previous value `len` times, `0x01 <delta:i16 LE>` applies a delta and
//! emits one value. With `n_samples == 0` only the header and CRC are
//! present. The CRC32 (IEEE 802.3, reflected) covers everything before it.
//!
//! Delta arithmetic is mod-2^16, so `decode(encode(batch)) == batch` holds
//! for every batch — the bundled self-check proves it per upload.

use crc::{Crc, CRC_32_ISO_HDLC};
use log::warn;

use crate::app::ports::ClockPort;
use crate::error::CodecError;
use crate::sample::{Sample, TimestampedRecord, ALL_FIELDS, FIELD_COUNT};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const VERSION: u8 = 1;
const HEADER_LEN: usize = 8;
const TRAILER_LEN: usize = 4;

/// Run-repeat opcode.
const OP_RUN: u8 = 0x00;
/// Delta opcode.
const OP_DELTA: u8 = 0x01;

/// Raw footprint of one record: ten 16-bit registers + 8-byte timestamp.
/// Informational only — the uplink reports it as `orig_bytes`.
pub const RAW_BYTES_PER_SAMPLE: usize = 28;

/// CRC32/ISO-HDLC over `data`.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Canonical wire names, in encode order.
pub fn field_order() -> [&'static str; FIELD_COUNT] {
    let mut names = [""; FIELD_COUNT];
    for (i, f) in ALL_FIELDS.iter().enumerate() {
        names[i] = f.name();
    }
    names
}

// ── Encode ───────────────────────────────────────────────────

/// Encode a batch. Panics only if the batch exceeds `u16::MAX` records,
/// which the ring capacity rules out by construction.
pub fn encode_delta_rle_v1(records: &[TimestampedRecord]) -> Vec<u8> {
    let n = u16::try_from(records.len()).expect("batch bounded by ring capacity");
    let mut out = Vec::with_capacity(HEADER_LEN + 2 * FIELD_COUNT + records.len() + TRAILER_LEN);

    out.push(VERSION);
    out.push(FIELD_COUNT as u8);
    out.extend_from_slice(&n.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);

    if n == 0 {
        let crc = crc32_ieee(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        return out;
    }

    let initial = records[0].sample.as_array();
    for v in initial {
        out.extend_from_slice(&v.to_le_bytes());
    }

    for (f, &init) in initial.iter().enumerate() {
        let mut prev = init;
        let mut zero_run: u8 = 0;
        for rec in &records[1..] {
            let cur = rec.sample.as_array()[f];
            if cur == prev {
                if zero_run == u8::MAX {
                    out.push(OP_RUN);
                    out.push(zero_run);
                    zero_run = 0;
                }
                zero_run += 1;
            } else {
                if zero_run > 0 {
                    out.push(OP_RUN);
                    out.push(zero_run);
                    zero_run = 0;
                }
                let delta = (i32::from(cur) - i32::from(prev)) as i16;
                out.push(OP_DELTA);
                out.extend_from_slice(&delta.to_le_bytes());
                prev = cur;
            }
        }
        if zero_run > 0 {
            out.push(OP_RUN);
            out.push(zero_run);
        }
    }

    let crc = crc32_ieee(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

// ── Decode ───────────────────────────────────────────────────

/// Decode a blob back into samples. Every opcode is bounds-checked so the
/// stream can never read into the 4-byte CRC trailer.
pub fn decode_delta_rle_v1(blob: &[u8]) -> Result<Vec<Sample>, CodecError> {
    if blob.len() < HEADER_LEN + TRAILER_LEN {
        return Err(CodecError::TooShort);
    }
    if blob[0] != VERSION {
        return Err(CodecError::BadVersion);
    }
    if blob[1] as usize != FIELD_COUNT {
        return Err(CodecError::BadFieldCount);
    }
    let n = u16::from_le_bytes([blob[2], blob[3]]) as usize;
    let payload_end = blob.len() - TRAILER_LEN;
    let mut off = HEADER_LEN;

    let mut columns = vec![vec![0u16; n]; FIELD_COUNT];
    if n > 0 {
        if payload_end < off + 2 * FIELD_COUNT {
            return Err(CodecError::Truncated);
        }
        let mut last = [0u16; FIELD_COUNT];
        for v in last.iter_mut() {
            *v = u16::from_le_bytes([blob[off], blob[off + 1]]);
            off += 2;
        }

        for (f, column) in columns.iter_mut().enumerate() {
            column[0] = last[f];
            let mut produced = 0usize;
            while produced < n - 1 {
                if off >= payload_end {
                    return Err(CodecError::Truncated);
                }
                match blob[off] {
                    OP_RUN => {
                        if off + 1 >= payload_end {
                            return Err(CodecError::Truncated);
                        }
                        let len = blob[off + 1] as usize;
                        off += 2;
                        if produced + len > n - 1 {
                            return Err(CodecError::Truncated);
                        }
                        for _ in 0..len {
                            produced += 1;
                            column[produced] = last[f];
                        }
                    }
                    OP_DELTA => {
                        if off + 3 > payload_end {
                            return Err(CodecError::Truncated);
                        }
                        let delta = i16::from_le_bytes([blob[off + 1], blob[off + 2]]);
                        off += 3;
                        let cur = (i32::from(last[f]) + i32::from(delta)) as u16;
                        produced += 1;
                        column[produced] = cur;
                        last[f] = cur;
                    }
                    _ => return Err(CodecError::UnknownOpcode),
                }
            }
        }
    }

    let given = u32::from_le_bytes([
        blob[payload_end],
        blob[payload_end + 1],
        blob[payload_end + 2],
        blob[payload_end + 3],
    ]);
    if given != crc32_ieee(&blob[..payload_end]) {
        return Err(CodecError::CrcMismatch);
    }

    let mut samples = vec![Sample::default(); n];
    for (f, field) in ALL_FIELDS.iter().enumerate() {
        for (i, sample) in samples.iter_mut().enumerate() {
            sample.set(*field, columns[f][i]);
        }
    }
    Ok(samples)
}

// ── Self-check benchmark ─────────────────────────────────────

/// Outcome of one encode + decode self-check, reported with the upload.
#[derive(Debug, Clone)]
pub struct BenchReport {
    pub method: &'static str,
    pub n_samples: usize,
    pub orig_bytes: usize,
    pub comp_bytes: usize,
    pub encode_ms: u64,
    pub lossless_ok: bool,
}

/// Encode a batch, time it, and prove the round trip before it ships.
/// A failed self-check is reported (`lossless_ok = false`) — the batch is
/// still sent.
pub fn run_self_check(
    records: &[TimestampedRecord],
    clock: &impl ClockPort,
) -> (Vec<u8>, BenchReport) {
    let t0 = clock.monotonic_ms();
    let blob = encode_delta_rle_v1(records);
    let encode_ms = clock.monotonic_ms().saturating_sub(t0);

    let lossless_ok = match decode_delta_rle_v1(&blob) {
        Ok(decoded) => {
            decoded.len() == records.len()
                && decoded
                    .iter()
                    .zip(records)
                    .all(|(d, r)| *d == r.sample)
        }
        Err(e) => {
            warn!("codec self-check failed to decode: {e}");
            false
        }
    };
    if !lossless_ok {
        warn!("codec self-check: round trip NOT lossless ({} samples)", records.len());
    }

    let report = BenchReport {
        method: "delta_rle_v1",
        n_samples: records.len(),
        orig_bytes: records.len() * RAW_BYTES_PER_SAMPLE,
        comp_bytes: blob.len(),
        encode_ms,
        lossless_ok,
    };
    (blob, report)
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(values: [u16; FIELD_COUNT], ts: u64) -> TimestampedRecord {
        let mut s = Sample::default();
        for (f, v) in ALL_FIELDS.iter().zip(values) {
            s.set(*f, v);
        }
        TimestampedRecord { epoch_ms: ts, sample: s }
    }

    fn flat(v: u16, ts: u64) -> TimestampedRecord {
        rec([v; FIELD_COUNT], ts)
    }

    #[test]
    fn empty_batch_is_header_plus_crc() {
        let blob = encode_delta_rle_v1(&[]);
        assert_eq!(blob.len(), HEADER_LEN + TRAILER_LEN);
        assert_eq!(decode_delta_rle_v1(&blob).unwrap(), Vec::<Sample>::new());
    }

    #[test]
    fn two_sample_pac_delta_layout() {
        // Two samples differing only in `pac` by +1. Nine fields flush a
        // one-long run (2 bytes each); pac emits a single delta (3 bytes).
        let a = rec([300, 150, 210, 200, 100, 100, 100, 0, 90, 1000], 1);
        let mut b = a;
        b.sample.pac += 1;
        b.epoch_ms = 2;

        let blob = encode_delta_rle_v1(&[a, b]);
        let expected = HEADER_LEN + 2 * FIELD_COUNT + 9 * 2 + 3 + TRAILER_LEN;
        assert_eq!(blob.len(), expected);
        // pac is the last stream: delta +1 little-endian
        let tail = &blob[blob.len() - TRAILER_LEN - 3..blob.len() - TRAILER_LEN];
        assert_eq!(tail, &[OP_DELTA, 0x01, 0x00]);

        let decoded = decode_delta_rle_v1(&blob).unwrap();
        assert_eq!(decoded, vec![a.sample, b.sample]);
    }

    #[test]
    fn constant_batch_compresses_to_runs() {
        let records: Vec<_> = (0..100).map(|i| flat(500, i)).collect();
        let blob = encode_delta_rle_v1(&records);
        // one run opcode per field
        assert_eq!(
            blob.len(),
            HEADER_LEN + 2 * FIELD_COUNT + FIELD_COUNT * 2 + TRAILER_LEN
        );
        assert_eq!(decode_delta_rle_v1(&blob).unwrap().len(), 100);
    }

    #[test]
    fn long_runs_split_at_255() {
        // 300 equal deltas per field forces a 255 run + a 44 run.
        let records: Vec<_> = (0..301).map(|i| flat(7, i)).collect();
        let blob = encode_delta_rle_v1(&records);
        assert_eq!(
            blob.len(),
            HEADER_LEN + 2 * FIELD_COUNT + FIELD_COUNT * 4 + TRAILER_LEN
        );
        let decoded = decode_delta_rle_v1(&blob).unwrap();
        assert_eq!(decoded.len(), 301);
        assert!(decoded.iter().all(|s| *s == records[0].sample));
    }

    #[test]
    fn wrapping_deltas_round_trip() {
        let records = vec![flat(0, 0), flat(u16::MAX, 1), flat(1, 2), flat(u16::MAX / 2, 3)];
        let blob = encode_delta_rle_v1(&records);
        let decoded = decode_delta_rle_v1(&blob).unwrap();
        for (d, r) in decoded.iter().zip(&records) {
            assert_eq!(*d, r.sample);
        }
    }

    #[test]
    fn single_byte_mutation_rejected() {
        let records: Vec<_> = (0..20).map(|i| flat(40 + (i % 5) as u16, i)).collect();
        let blob = encode_delta_rle_v1(&records);
        for i in 0..blob.len() {
            let mut corrupted = blob.clone();
            corrupted[i] ^= 0x10;
            assert!(
                decode_delta_rle_v1(&corrupted).is_err(),
                "mutation at byte {i} must be rejected"
            );
        }
    }

    #[test]
    fn truncation_never_reads_trailer() {
        let records = vec![flat(1, 0), flat(2, 1), flat(3, 2)];
        let blob = encode_delta_rle_v1(&records);
        for end in HEADER_LEN + TRAILER_LEN..blob.len() {
            // chop payload bytes but keep a plausible length
            let truncated = &blob[..end];
            assert!(decode_delta_rle_v1(truncated).is_err());
        }
    }

    #[test]
    fn unknown_opcode_rejected() {
        let records = vec![flat(1, 0), flat(2, 1)];
        let mut blob = encode_delta_rle_v1(&records);
        let first_op = HEADER_LEN + 2 * FIELD_COUNT;
        blob[first_op] = 0x7E;
        assert_eq!(decode_delta_rle_v1(&blob), Err(CodecError::UnknownOpcode));
    }

    #[test]
    fn self_check_reports_stats() {
        struct FakeClock(core::cell::Cell<u64>);
        impl ClockPort for FakeClock {
            fn monotonic_ms(&self) -> u64 {
                let t = self.0.get();
                self.0.set(t + 3);
                t
            }
            fn set_epoch_offset(&mut self, _: i64) {}
            fn epoch_ms(&self) -> u64 {
                self.monotonic_ms()
            }
            fn time_sync_available(&self) -> bool {
                false
            }
        }

        let records: Vec<_> = (0..12).map(|i| flat(100 + i as u16, i)).collect();
        let clock = FakeClock(core::cell::Cell::new(5));
        let (blob, report) = run_self_check(&records, &clock);
        assert!(report.lossless_ok);
        assert_eq!(report.n_samples, 12);
        assert_eq!(report.orig_bytes, 12 * RAW_BYTES_PER_SAMPLE);
        assert_eq!(report.comp_bytes, blob.len());
        assert_eq!(report.encode_ms, 3);
        assert_eq!(report.method, "delta_rle_v1");
    }
}
