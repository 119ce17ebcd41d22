#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use shardline_core::varint::{decode_varint_u64, get_length_prefixed};

fuzz_target!(|data: &[u8]| {
    // Invalid varints and truncated length prefixes must return errors
    let mut cursor = data;
    let _ = decode_varint_u64(&mut cursor);

    let mut buf = Bytes::copy_from_slice(data);
    while !buf.is_empty() {
        match get_length_prefixed(&mut buf) {
            Ok(record) => assert!(record.len() <= data.len()),
            Err(_) => break,
        }
    }
});
