//! Pure wire codec for Vendotek messages.
//!
//! A serialized message is a fixed 4-byte header followed by zero or
//! more tag-length-value entries:
//!
//! ```text
//! u16   declared length (big-endian): 2 + encoded size of all arguments
//! u16   protocol id     (big-endian): 0x96FB (VMC) or 0x97FB (POS)
//! TLV*  varint id, varint len, `len` raw value bytes
//! ```
//!
//! The varint form covers values up to 65535. The low 7 bits of the
//! first byte act as a discriminator when the high bit is set:
//!
//! ```text
//! value <= 127   1 byte    the value itself, high bit clear
//! value <= 255   2 bytes   0x81, then the value
//! value >  255   3 bytes   0x82, then the value as big-endian u16
//! ```
//!
//! There is no trailing delimiter; entries are consumed until the read
//! cursor reaches the write length of the stream. Nothing here performs
//! I/O.

use crate::error::CodecError;
use crate::msg::Message;
use crate::stream::ByteStream;

/// Encoded size of a varint value, in bytes.
pub fn varint_len(value: u16) -> usize {
    if value <= 127 {
        1
    } else if value <= 255 {
        2
    } else {
        3
    }
}

pub fn write_varint(out: &mut ByteStream, value: u16) {
    if value <= 127 {
        out.write(&[value as u8]);
    } else if value <= 255 {
        out.write(&[0x81, value as u8]);
    } else {
        out.write(&[0x82, (value >> 8) as u8, (value & 0xFF) as u8]);
    }
}

pub fn read_varint(input: &mut ByteStream) -> Result<u16, CodecError> {
    let first = input.read(1).ok_or(CodecError::Truncated("varint"))?[0];
    if first <= 127 {
        return Ok(u16::from(first));
    }
    match first & 0x7F {
        1 => {
            let byte = input.read(1).ok_or(CodecError::Truncated("varint payload"))?[0];
            Ok(u16::from(byte))
        }
        2 => input
            .read_u16_be()
            .ok_or(CodecError::Truncated("varint payload")),
        _ => Err(CodecError::BadDiscriminator(first)),
    }
}

/// Serializes a message into `out`, replacing any previous content.
pub fn serialize(msg: &Message, out: &mut ByteStream) {
    out.clear();
    out.write_u16_be(msg.declared_len());
    out.write_u16_be(msg.proto());

    for arg in msg.args() {
        write_varint(out, arg.id);
        write_varint(out, arg.value.len() as u16);
        out.write(&arg.value);
    }
}

/// Deserializes one message from the whole content of `input`.
///
/// `msg` is reset to the protocol id carried in the header, then every
/// TLV entry is appended until the stream is exhausted. A declared
/// argument length that exceeds the remaining bytes is an error and
/// never reads out of bounds.
pub fn deserialize(msg: &mut Message, input: &mut ByteStream) -> Result<(), CodecError> {
    input.rewind();
    if input.remaining() < 4 {
        return Err(CodecError::Truncated("message header"));
    }
    let _declared = input.read_u16_be().ok_or(CodecError::Truncated("header"))?;
    let proto = input.read_u16_be().ok_or(CodecError::Truncated("header"))?;
    msg.reset(proto);

    while input.remaining() > 0 {
        let id = read_varint(input)?;
        let len = read_varint(input)? as usize;
        let value = input
            .read(len)
            .ok_or(CodecError::Truncated("argument value"))?
            .to_vec();
        msg.append_bin(id, &value)?;
    }
    Ok(())
}

// --- tests ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{ARG_MESSAGE_NAME, PROTO_POS, PROTO_VMC};

    fn encode(value: u16) -> Vec<u8> {
        let mut s = ByteStream::new();
        write_varint(&mut s, value);
        s.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<u16, CodecError> {
        let mut s = ByteStream::new();
        s.write(bytes);
        read_varint(&mut s)
    }

    // --- varint -------------------------------------------------------------

    #[test]
    fn varint_size_classes() {
        assert_eq!(encode(0), [0x00]);
        assert_eq!(encode(127), [0x7F]);
        assert_eq!(encode(128), [0x81, 0x80]);
        assert_eq!(encode(255), [0x81, 0xFF]);
        assert_eq!(encode(256), [0x82, 0x01, 0x00]);
        assert_eq!(encode(0xFFFF), [0x82, 0xFF, 0xFF]);
    }

    #[test]
    fn varint_round_trips_across_full_range() {
        for v in 0..=u16::MAX {
            let bytes = encode(v);
            assert_eq!(bytes.len(), varint_len(v));
            assert_eq!(decode(&bytes).unwrap(), v);
        }
    }

    /// Pins the two-byte branch to the payload byte. A decoder that
    /// yields the discriminator byte instead would return 0x81 for
    /// every value in 128..=255.
    #[test]
    fn varint_two_byte_decodes_payload_not_discriminator() {
        assert_eq!(decode(&[0x81, 200]).unwrap(), 200);
        assert_eq!(decode(&[0x81, 0x81]).unwrap(), 0x81);
    }

    #[test]
    fn varint_rejects_unknown_discriminator() {
        assert_eq!(decode(&[0x83, 0, 0]), Err(CodecError::BadDiscriminator(0x83)));
        assert_eq!(decode(&[0xFF]), Err(CodecError::BadDiscriminator(0xFF)));
    }

    #[test]
    fn varint_truncated_payload_is_an_error() {
        assert_eq!(decode(&[0x81]), Err(CodecError::Truncated("varint payload")));
        assert_eq!(decode(&[0x82, 0x01]), Err(CodecError::Truncated("varint payload")));
        assert_eq!(decode(&[]), Err(CodecError::Truncated("varint")));
    }

    // --- message ------------------------------------------------------------

    #[test]
    fn serialize_produces_exact_wire_bytes() {
        let mut m = Message::new(PROTO_VMC);
        m.append_str(ARG_MESSAGE_NAME, "IDL").unwrap();

        let mut s = ByteStream::new();
        serialize(&m, &mut s);

        // declared length: 2 (proto) + 1 (id) + 1 (len) + 3 (value)
        assert_eq!(
            s.as_bytes(),
            &[0x00, 0x07, 0x96, 0xFB, 0x01, 0x03, b'I', b'D', b'L']
        );
    }

    #[test]
    fn message_round_trip_preserves_order_and_binary_values() {
        let mut m = Message::new(PROTO_POS);
        m.append_str(0x01, "VRP").unwrap();
        m.append_bin(0x0D, &[0x00, 0x01, 0x00]).unwrap();
        m.append_bin(0x0E, &[]).unwrap();
        m.append_str(0x0D, "again").unwrap(); // duplicate id
        m.append_bin(0x1234, &vec![0xAB; 300]).unwrap(); // 3-byte varints

        let mut s = ByteStream::new();
        serialize(&m, &mut s);

        let mut back = Message::new(0);
        deserialize(&mut back, &mut s).unwrap();

        assert_eq!(back.proto(), PROTO_POS);
        assert_eq!(back.args(), m.args());
        assert_eq!(back.declared_len(), m.declared_len());
    }

    #[test]
    fn deserialize_requires_full_header() {
        let mut m = Message::new(0);

        let mut s = ByteStream::new();
        s.write(&[0x00]);
        assert_eq!(
            deserialize(&mut m, &mut s),
            Err(CodecError::Truncated("message header"))
        );

        let mut s = ByteStream::new();
        s.write(&[0x00, 0x02, 0x96]);
        assert_eq!(
            deserialize(&mut m, &mut s),
            Err(CodecError::Truncated("message header"))
        );
    }

    #[test]
    fn deserialize_rejects_argument_longer_than_remaining_bytes() {
        let mut s = ByteStream::new();
        // header, then id 0x01 with declared value length 10 but only 2 bytes
        s.write(&[0x00, 0x0E, 0x96, 0xFB, 0x01, 0x0A, b'I', b'D']);

        let mut m = Message::new(0);
        assert_eq!(
            deserialize(&mut m, &mut s),
            Err(CodecError::Truncated("argument value"))
        );
    }

    #[test]
    fn empty_message_round_trips() {
        let m = Message::new(PROTO_VMC);
        let mut s = ByteStream::new();
        serialize(&m, &mut s);
        assert_eq!(s.as_bytes(), &[0x00, 0x02, 0x96, 0xFB]);

        let mut back = Message::new(0);
        deserialize(&mut back, &mut s).unwrap();
        assert_eq!(back.proto(), PROTO_VMC);
        assert!(back.args().is_empty());
    }
}
