//! Edge-case tests for varint framing and the record type.

use bytes::{Bytes, BytesMut};
use shardline_core::varint::{
    decode_varint_u64, encode_varint_u64, get_length_prefixed, put_length_prefixed,
};
use shardline_core::{Error, Record};

// ---------------------------------------------------------------
// Varint boundaries
// ---------------------------------------------------------------

#[test]
fn varint_boundaries_change_width() {
    let cases = [
        (0u64, 1usize),
        (127, 1),
        (128, 2),
        (16_383, 2),
        (16_384, 3),
        (u32::MAX as u64, 5),
    ];
    for (value, width) in cases {
        let mut buf = Vec::new();
        encode_varint_u64(&mut buf, value);
        assert_eq!(buf.len(), width, "width for {value}");
        assert_eq!(decode_varint_u64(&mut &buf[..]).unwrap(), value);
    }
}

#[test]
fn varint_empty_input_is_truncated() {
    let empty: &[u8] = &[];
    let mut cursor = empty;
    assert!(matches!(
        decode_varint_u64(&mut cursor),
        Err(Error::Truncated { .. })
    ));
}

// ---------------------------------------------------------------
// Length-prefixed fields
// ---------------------------------------------------------------

#[test]
fn consecutive_fields_share_one_buffer() {
    let mut buf = BytesMut::new();
    let fields: Vec<Vec<u8>> = (0..50).map(|i| vec![i as u8; i * 7]).collect();
    for field in &fields {
        put_length_prefixed(&mut buf, field);
    }

    let mut bytes = buf.freeze();
    for field in &fields {
        let decoded = get_length_prefixed(&mut bytes).unwrap();
        assert_eq!(&decoded[..], &field[..]);
    }
    assert!(bytes.is_empty());
}

#[test]
fn field_missing_body_reports_sizes() {
    let mut buf = BytesMut::new();
    encode_varint_u64(&mut buf, 4);
    let mut bytes = buf.freeze();

    match get_length_prefixed(&mut bytes) {
        Err(Error::Truncated { needed, available }) => {
            assert_eq!(needed, 4);
            assert_eq!(available, 0);
        }
        other => panic!("expected truncation, got {other:?}"),
    }
}

// ---------------------------------------------------------------
// Record
// ---------------------------------------------------------------

#[test]
fn record_with_empty_payload() {
    let record = Record::new(Bytes::from("series"), Bytes::new());
    assert!(record.payload.is_empty());
    assert!(record.encoded_len() > 0);
}
