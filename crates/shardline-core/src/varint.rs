//! Variable-length Integer Encoding (Varint)
//!
//! Chunks pack many small records into one log entry; every record is
//! prefixed with its length as a varint so short payloads pay one or two
//! bytes of framing instead of four.
//!
//! - Each byte carries 7 data bits and 1 continuation bit
//! - Values 0-127 take 1 byte, a full u64 takes at most [`MAX_VARINT_LEN`]
//!
//! Decoding is fallible: chunk bytes come off disk or the network, so a
//! truncated or overlong varint is reported as an error rather than a panic.
//!
//! ## Usage
//! ```ignore
//! let mut buf = BytesMut::new();
//! encode_varint_u64(&mut buf, 300);
//! let value = decode_varint_u64(&mut buf.as_ref())?;
//! ```

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Error, Result};

/// Longest encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80; // Set continuation bit
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Decode a varint to an unsigned integer
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(Error::Truncated {
                needed: 1,
                available: 0,
            });
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            break;
        }

        shift += 7;

        if shift >= 64 {
            return Err(Error::VarintOverflow);
        }
    }

    Ok(value)
}

/// Write `data` prefixed with its varint length
pub fn put_length_prefixed(buf: &mut impl BufMut, data: &[u8]) {
    encode_varint_u64(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Read one length-prefixed field, sharing memory with `buf`
pub fn get_length_prefixed(buf: &mut Bytes) -> Result<Bytes> {
    let len = decode_varint_u64(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Truncated {
            needed: len,
            available: buf.remaining(),
        });
    }
    Ok(buf.split_to(len))
}
