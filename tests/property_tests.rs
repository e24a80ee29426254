//! Property tests for the core data paths.
//!
//! Runs on host only — proptest is not available for ESP32 targets.

#![cfg(not(target_os = "espidf"))]

use gridpulse::codec::{decode_delta_rle_v1, encode_delta_rle_v1};
use gridpulse::modbus;
use gridpulse::ring::Ring;
use gridpulse::sample::{Sample, TimestampedRecord, ALL_FIELDS};
use gridpulse::security;
use proptest::prelude::*;

fn arb_sample() -> impl Strategy<Value = Sample> {
    proptest::collection::vec(any::<u16>(), 10).prop_map(|values| {
        let mut s = Sample::default();
        for (f, v) in ALL_FIELDS.iter().zip(values) {
            s.set(*f, v);
        }
        s
    })
}

fn arb_batch(max: usize) -> impl Strategy<Value = Vec<TimestampedRecord>> {
    proptest::collection::vec(arb_sample(), 0..max).prop_map(|samples| {
        samples
            .into_iter()
            .enumerate()
            .map(|(i, sample)| TimestampedRecord {
                epoch_ms: i as u64 * 1000,
                sample,
            })
            .collect()
    })
}

// ── Batch codec: lossless round trip + tamper detection ──────

proptest! {
    /// decode(encode(B)) == B for arbitrary batches.
    #[test]
    fn codec_round_trip_lossless(batch in arb_batch(120)) {
        let blob = encode_delta_rle_v1(&batch);
        let decoded = decode_delta_rle_v1(&blob).expect("well-formed blob decodes");
        prop_assert_eq!(decoded.len(), batch.len());
        for (got, want) in decoded.iter().zip(&batch) {
            prop_assert_eq!(*got, want.sample);
        }
    }

    /// Any single-byte mutation anywhere in the blob is rejected.
    #[test]
    fn codec_rejects_any_single_byte_mutation(
        batch in arb_batch(40),
        offset in any::<prop::sample::Index>(),
        xor in 1u8..=255,
    ) {
        let blob = encode_delta_rle_v1(&batch);
        let mut corrupted = blob.clone();
        let i = offset.index(corrupted.len());
        corrupted[i] ^= xor;
        prop_assert!(decode_delta_rle_v1(&corrupted).is_err());
    }
}

// ── Ring: conservation of samples ────────────────────────────

proptest! {
    /// size() + total dropped == total pushes, and snapshots preserve
    /// push order.
    #[test]
    fn ring_conserves_samples(
        capacity in 1usize..32,
        ops in proptest::collection::vec(0u8..=8, 1..200),
    ) {
        let mut ring = Ring::new(capacity);
        let mut pushes = 0u64;
        let mut drained = 0u64;
        let mut dropped = 0u64;
        let mut seq = 0u64;
        let mut expected_front = 0u64;

        for op in ops {
            if op == 0 {
                let records = ring.snapshot_and_clear();
                // FIFO: strictly increasing stamps starting past any drops
                if let Some(first) = records.first() {
                    prop_assert!(first.epoch_ms >= expected_front);
                }
                for pair in records.windows(2) {
                    prop_assert_eq!(pair[1].epoch_ms, pair[0].epoch_ms + 1);
                }
                if let Some(last) = records.last() {
                    expected_front = last.epoch_ms + 1;
                }
                drained += records.len() as u64;
                dropped += u64::from(ring.take_dropped());
            } else {
                ring.push(TimestampedRecord { epoch_ms: seq, sample: Sample::default() });
                seq += 1;
                pushes += 1;
            }
        }
        drained += ring.snapshot_and_clear().len() as u64;
        dropped += u64::from(ring.take_dropped());
        prop_assert_eq!(drained + dropped, pushes);
    }
}

// ── Frame codec: builder/parser duality ──────────────────────

proptest! {
    /// Requests are 16 hex chars whose last four equal the little-endian
    /// CRC-16 of the first twelve.
    #[test]
    fn request_trailer_is_crc_of_body(slave: u8, addr: u16, count: u16) {
        for hex in [
            modbus::make_read_holding(slave, addr, count),
            modbus::make_write_single(slave, addr, count),
        ] {
            prop_assert_eq!(hex.len(), 16);
            let bytes = modbus::hex_to_bytes(&hex);
            let crc = modbus::crc16(&bytes[..6]);
            prop_assert_eq!(bytes[6], (crc & 0xFF) as u8);
            prop_assert_eq!(bytes[7], (crc >> 8) as u8);
        }
    }

    /// An echoed read frame parses back to (slave, 0x03, n regs); any
    /// single-bit flip fails the CRC.
    #[test]
    fn read_response_parses_and_detects_bit_flips(
        slave: u8,
        regs in proptest::collection::vec(any::<u16>(), 1..=16),
        flip_byte in any::<prop::sample::Index>(),
        flip_bit in 0u8..8,
    ) {
        let mut frame = vec![slave, 0x03, (regs.len() * 2) as u8];
        for r in &regs {
            frame.push((r >> 8) as u8);
            frame.push((r & 0xFF) as u8);
        }
        let crc = modbus::crc16(&frame);
        frame.push((crc & 0xFF) as u8);
        frame.push((crc >> 8) as u8);
        let hex = modbus::bytes_to_hex(&frame);

        let (got_slave, func, got_regs) = modbus::parse_read_response(&hex).unwrap();
        prop_assert_eq!(got_slave, slave);
        prop_assert_eq!(func, 0x03);
        prop_assert_eq!(got_regs, regs);

        let mut corrupted = frame.clone();
        let i = flip_byte.index(corrupted.len());
        corrupted[i] ^= 1 << flip_bit;
        prop_assert!(modbus::parse_read_response(&modbus::bytes_to_hex(&corrupted)).is_err());
    }
}

// ── Envelope: wrap/unwrap duality and replay ─────────────────

proptest! {
    /// unwrap(wrap(x)) == x iff the nonce advances; a replay of the same
    /// envelope is rejected.
    #[test]
    fn envelope_round_trip_iff_nonce_advances(
        payload in "[ -~]{1,64}",
        psk in proptest::collection::vec(any::<u8>(), 1..32),
        nonce in 1u64..u64::MAX,
        last_seen in 0u64..u64::MAX,
    ) {
        let env = security::wrap(&payload, &psk, nonce);
        let mut seen = last_seen;
        let result = security::unwrap_and_verify(&env, &psk, &mut seen, true);
        if nonce > last_seen {
            prop_assert_eq!(result.unwrap(), payload.as_bytes());
            prop_assert_eq!(seen, nonce);
            // second delivery of the same envelope must fail
            prop_assert!(security::unwrap_and_verify(&env, &psk, &mut seen, true).is_err());
        } else {
            prop_assert!(result.is_err());
            prop_assert_eq!(seen, last_seen);
        }
    }
}
