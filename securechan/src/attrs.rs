//! The keyed-attribute payload format shared by every message, encrypted or not.
//!
//! ```text
//! record := key-length:i32-le ++ key:ascii ++ value-length:i32-le ++ value:bytes
//! payload := record*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;

use crate::error::ProtocolError;

/// An order-preserving map of ASCII attribute names to raw byte values.
///
/// Backed by [`IndexMap`] rather than a hash map: the wire format does not
/// assign meaning to iteration order, but decoding must reproduce whatever
/// order the bytes were written in rather than scrambling it.
pub type Attributes = IndexMap<String, Bytes>;

/// The largest value length this implementation will place on the wire.
/// The wire format itself is bounded by `i32`; this is that bound, restated.
pub const MAX_VALUE_LEN: usize = i32::MAX as usize;

/// Appends the encoded form of `attrs` to `dst`.
///
/// Returns [`ProtocolError::ValueTooLarge`] without writing anything further
/// if any value exceeds what an `i32` length prefix can express.
pub fn encode(attrs: &Attributes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    for (key, value) in attrs {
        if value.len() > MAX_VALUE_LEN {
            return Err(ProtocolError::ValueTooLarge(value.len()));
        }
        if !key.is_ascii() {
            return Err(ProtocolError::NonAsciiKey(key.clone()));
        }

        dst.put_i32_le(key.len() as i32);
        dst.put_slice(key.as_bytes());
        dst.put_i32_le(value.len() as i32);
        dst.put_slice(value);
    }

    Ok(())
}

/// Returns the number of bytes `encode` would write for `attrs`, without allocating.
pub fn encoded_len(attrs: &Attributes) -> usize {
    attrs.iter().map(|(k, v)| 8 + k.len() + v.len()).sum()
}

/// Parses a full attribute payload (no outer framing) out of `src`.
///
/// `src` must contain exactly the payload bytes; any bytes left over after
/// the last well-formed record is a [`ProtocolError::TrailingBytes`].
pub fn decode(mut src: Bytes) -> Result<Attributes, ProtocolError> {
    let mut attrs = Attributes::new();

    while src.has_remaining() {
        if src.remaining() < 4 {
            return Err(ProtocolError::TrailingBytes(src.remaining()));
        }
        let key_len = src.get_i32_le();
        if key_len < 0 || src.remaining() < key_len as usize {
            return Err(ProtocolError::TrailingBytes(src.remaining() + 4));
        }
        let key_bytes = src.copy_to_bytes(key_len as usize);
        let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| ProtocolError::NonAsciiKey(format!("{key_bytes:?}")))?;
        if !key.is_ascii() {
            return Err(ProtocolError::NonAsciiKey(key));
        }

        if src.remaining() < 4 {
            return Err(ProtocolError::TrailingBytes(src.remaining()));
        }
        let value_len = src.get_i32_le();
        if value_len < 0 {
            return Err(ProtocolError::NegativeValueLength(value_len));
        }
        if src.remaining() < value_len as usize {
            return Err(ProtocolError::TrailingBytes(src.remaining()));
        }
        let value = src.copy_to_bytes(value_len as usize);

        if attrs.insert(key.clone(), value).is_some() {
            return Err(ProtocolError::DuplicateKey(key));
        }
    }

    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_round_trips() {
        let attrs = Attributes::new();
        let mut buf = BytesMut::new();
        encode(&attrs, &mut buf).unwrap();
        assert_eq!(buf.len(), 0);
        assert_eq!(decode(buf.freeze()).unwrap(), attrs);
    }

    #[test]
    fn two_attributes_round_trip() {
        let mut attrs = Attributes::new();
        attrs.insert("foo".to_string(), Bytes::from_static(&[0x01, 0x02, 0x03]));
        attrs.insert("bar".to_string(), Bytes::new());

        let mut buf = BytesMut::new();
        encode(&attrs, &mut buf).unwrap();
        assert_eq!(buf.len(), 14 + 11);

        let decoded = decode(buf.freeze()).unwrap();
        assert_eq!(decoded, attrs);
    }

    #[test]
    fn oversize_value_is_rejected() {
        let mut attrs = Attributes::new();
        attrs.insert("huge".to_string(), Bytes::from(vec![0u8; MAX_VALUE_LEN + 1]));

        let mut buf = BytesMut::new();
        match encode(&attrs, &mut buf) {
            Err(ProtocolError::ValueTooLarge(len)) => assert_eq!(len, MAX_VALUE_LEN + 1),
            other => panic!("expected ValueTooLarge, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn negative_value_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(3);
        buf.put_slice(b"foo");
        buf.put_i32_le(-1);

        match decode(buf.freeze()) {
            Err(ProtocolError::NegativeValueLength(-1)) => {}
            other => panic!("expected NegativeValueLength, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut buf = BytesMut::new();
        for _ in 0..2 {
            buf.put_i32_le(1);
            buf.put_slice(b"a");
            buf.put_i32_le(0);
        }

        match decode(buf.freeze()) {
            Err(ProtocolError::DuplicateKey(k)) if k == "a" => {}
            other => panic!("expected DuplicateKey, got {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(3);
        buf.put_slice(b"fo");

        assert!(decode(buf.freeze()).is_err());
    }
}
