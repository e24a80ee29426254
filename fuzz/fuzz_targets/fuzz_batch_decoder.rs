//! Fuzz target: delta+RLE batch decoder.
//!
//! The decoder must reject or cleanly decode arbitrary blobs without
//! panicking or over-reading; anything it accepts must re-encode to a
//! blob that decodes to the same samples.
//!
//! cargo fuzz run fuzz_batch_decoder

#![no_main]

use gridpulse::codec::{decode_delta_rle_v1, encode_delta_rle_v1};
use gridpulse::sample::TimestampedRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(samples) = decode_delta_rle_v1(data) {
        let records: Vec<TimestampedRecord> = samples
            .iter()
            .enumerate()
            .map(|(i, sample)| TimestampedRecord {
                epoch_ms: i as u64,
                sample: *sample,
            })
            .collect();
        let blob = encode_delta_rle_v1(&records);
        let again = decode_delta_rle_v1(&blob).expect("re-encoded blob decodes");
        assert_eq!(again, samples);
    }
});
