#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use shardline_core::Record;
use shardline_replica::{decode_chunk, Chunk};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must be rejected cleanly, never panic or over-allocate
    let _ = decode_chunk(data);

    // Split the input into records and check a marshalled chunk decodes back
    let records: Vec<Bytes> = data
        .split(|b| *b == 0xff)
        .map(Bytes::copy_from_slice)
        .collect();
    let mut chunk = Chunk::new(records.len());
    for record in &records {
        chunk
            .push(Record::new(Bytes::new(), record.clone()))
            .unwrap();
    }
    assert!(chunk.is_full());

    let encoded = chunk.marshal();
    assert_eq!(decode_chunk(&encoded).unwrap(), records);

    // Any single flipped bit is caught by the checksum or the framing
    if !encoded.is_empty() {
        let mut corrupted = encoded.to_vec();
        let bit = data.len() % (corrupted.len() * 8);
        corrupted[bit / 8] ^= 1 << (bit % 8);
        assert!(decode_chunk(&corrupted).is_err());
    }
});
