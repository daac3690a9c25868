//! Vendotek message data model.
//!
//! A message is a 16-bit protocol id plus an ordered sequence of
//! tag-length-value arguments. Insertion order is wire-significant and
//! duplicate ids are legal; nothing is deduplicated. The declared wire
//! length is maintained eagerly on every mutation so that it is always
//! `2 + sum(varint_len(id) + varint_len(len) + len)` over the current
//! arguments.

use std::fmt;

use crate::codec::varint_len;
use crate::error::CodecError;

/// Protocol id used by the active (connecting) side of the exchange.
pub const PROTO_VMC: u16 = 0x96FB;
/// Protocol id used by the passive (accepting) side.
pub const PROTO_POS: u16 = 0x97FB;

/// Hard limit of the 16-bit declared length field.
pub const MSG_MAX_LEN: usize = 0xFFFF;

// Well-known argument ids.
pub const ARG_MESSAGE_NAME: u16 = 0x01;
pub const ARG_OPERATION_NUMBER: u16 = 0x03;
pub const ARG_PRICE: u16 = 0x04;
pub const ARG_KEEPALIVE: u16 = 0x05;
pub const ARG_OPERATION_TIMEOUT: u16 = 0x06;
pub const ARG_EVENT_NAME: u16 = 0x07;
pub const ARG_EVENT_NUMBER: u16 = 0x08;
pub const ARG_PRODUCT_ID: u16 = 0x09;
pub const ARG_QR_CODE: u16 = 0x0A;
pub const ARG_TCPIP_DESTINATION: u16 = 0x0B;
pub const ARG_OUTGOING_BYTE_COUNTER: u16 = 0x0C;
pub const ARG_SIMPLE_DATA: u16 = 0x0D;
pub const ARG_CONFIRMABLE_DATA: u16 = 0x0E;
pub const ARG_PRODUCT_NAME: u16 = 0x0F;
pub const ARG_POS_MANAGEMENT: u16 = 0x10;
pub const ARG_LOCAL_TIME: u16 = 0x11;
pub const ARG_SYSTEM_INFORMATION: u16 = 0x12;
pub const ARG_BANKING_RECEIPT: u16 = 0x13;
pub const ARG_DISPLAY_TIME: u16 = 0x14;

/// Human-readable description of a well-known argument id.
///
/// Unknown ids are legal on the wire and map to a generic description.
pub fn describe_id(id: u16) -> &'static str {
    match id {
        ARG_MESSAGE_NAME => "Message name",
        ARG_OPERATION_NUMBER => "Operation number",
        ARG_PRICE => "Minor currency units",
        ARG_KEEPALIVE => "Keepalive interval, sec",
        ARG_OPERATION_TIMEOUT => "Operation timeout, sec",
        ARG_EVENT_NAME => "Event name",
        ARG_EVENT_NUMBER => "Event number",
        ARG_PRODUCT_ID => "Product id",
        ARG_QR_CODE => "QR-code data",
        ARG_TCPIP_DESTINATION => "TCP/IP destination",
        ARG_OUTGOING_BYTE_COUNTER => "Outgoing byte counter",
        ARG_SIMPLE_DATA => "Simple data block",
        ARG_CONFIRMABLE_DATA => "Confirmable data block",
        ARG_PRODUCT_NAME => "Product name",
        ARG_POS_MANAGEMENT => "POS management data",
        ARG_LOCAL_TIME => "Local time",
        ARG_SYSTEM_INFORMATION => "System information",
        ARG_BANKING_RECEIPT => "Banking receipt",
        ARG_DISPLAY_TIME => "Display time, ms",
        _ => "Unknown argument ID",
    }
}

/// One tag-length-value entry of a message.
///
/// The value is arbitrary binary; a textual argument is simply a value
/// whose bytes happen to form a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub id: u16,
    pub value: Vec<u8>,
}

impl Argument {
    /// The value as UTF-8 text, when it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Message {
    proto: u16,
    length: u16,
    args: Vec<Argument>,
}

impl Message {
    pub fn new(proto: u16) -> Self {
        Self {
            proto,
            length: 2,
            args: Vec::new(),
        }
    }

    /// Clears all arguments and re-establishes the length baseline.
    pub fn reset(&mut self, proto: u16) {
        self.proto = proto;
        self.length = 2;
        self.args.clear();
    }

    pub fn proto(&self) -> u16 {
        self.proto
    }

    /// The declared wire length: 2 for the protocol id plus the encoded
    /// size of every argument.
    pub fn declared_len(&self) -> u16 {
        self.length
    }

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    /// First argument with the given id, in insertion order.
    pub fn find(&self, id: u16) -> Option<&Argument> {
        self.args.iter().find(|a| a.id == id)
    }

    /// Appends a textual argument whose length is the string byte length.
    pub fn append_str(&mut self, id: u16, value: &str) -> Result<(), CodecError> {
        self.append_bin(id, value.as_bytes())
    }

    /// Appends a binary argument, copying the value verbatim.
    ///
    /// The append is atomic: when the projected declared length would
    /// exceed the 16-bit wire limit the message is left untouched.
    pub fn append_bin(&mut self, id: u16, value: &[u8]) -> Result<(), CodecError> {
        if value.len() > MSG_MAX_LEN {
            return Err(CodecError::Oversize);
        }
        let vlen = value.len() as u16;
        let projected =
            self.length as usize + varint_len(id) + varint_len(vlen) + value.len();
        if projected > MSG_MAX_LEN {
            return Err(CodecError::Oversize);
        }
        self.length = projected as u16;
        self.args.push(Argument {
            id,
            value: value.to_vec(),
        });
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            let printable = arg
                .text()
                .filter(|t| t.chars().all(|c| !c.is_control() || c == '\t'));
            match printable {
                Some(text) => writeln!(
                    f,
                    "  {i:2}: 0x{:02x}  {:<24} => {text}",
                    arg.id,
                    describe_id(arg.id)
                )?,
                None => writeln!(
                    f,
                    "  {i:2}: 0x{:02x}  {:<24} => {}",
                    arg.id,
                    describe_id(arg.id),
                    hex::encode(&arg.value)
                )?,
            }
        }
        Ok(())
    }
}

// --- tests ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Encoded size of one argument as it will appear on the wire.
    fn arg_wire_len(id: u16, len: usize) -> usize {
        varint_len(id) + varint_len(len as u16) + len
    }

    #[test]
    fn declared_length_tracks_appends() {
        let mut m = Message::new(PROTO_VMC);
        assert_eq!(m.declared_len(), 2);

        m.append_str(ARG_MESSAGE_NAME, "IDL").unwrap();
        assert_eq!(m.declared_len() as usize, 2 + arg_wire_len(0x01, 3));

        // id above 255 takes a 3-byte varint
        m.append_bin(0x1234, &[0u8; 200]).unwrap();
        assert_eq!(
            m.declared_len() as usize,
            2 + arg_wire_len(0x01, 3) + arg_wire_len(0x1234, 200)
        );

        m.reset(PROTO_POS);
        assert_eq!(m.declared_len(), 2);
        assert!(m.args().is_empty());
        assert_eq!(m.proto(), PROTO_POS);
    }

    #[test]
    fn oversize_append_is_rejected_atomically() {
        let mut m = Message::new(PROTO_VMC);
        m.append_bin(0x0D, &vec![0u8; 60_000]).unwrap();
        let len_before = m.declared_len();
        let args_before = m.args().len();

        assert_eq!(
            m.append_bin(0x0E, &vec![0u8; 10_000]),
            Err(CodecError::Oversize)
        );
        assert_eq!(m.declared_len(), len_before);
        assert_eq!(m.args().len(), args_before);
    }

    #[test]
    fn single_value_longer_than_wire_limit_is_rejected() {
        let mut m = Message::new(PROTO_VMC);
        assert_eq!(
            m.append_bin(0x0D, &vec![0u8; MSG_MAX_LEN + 1]),
            Err(CodecError::Oversize)
        );
        assert!(m.args().is_empty());
    }

    #[test]
    fn duplicate_ids_are_kept_and_find_returns_first() {
        let mut m = Message::new(PROTO_VMC);
        m.append_str(0x0D, "first").unwrap();
        m.append_str(0x0D, "second").unwrap();

        assert_eq!(m.args().len(), 2);
        assert_eq!(m.find(0x0D).unwrap().text(), Some("first"));
        assert!(m.find(0x33).is_none());
    }

    #[test]
    fn describe_id_covers_known_and_unknown() {
        assert_eq!(describe_id(ARG_MESSAGE_NAME), "Message name");
        assert_eq!(describe_id(ARG_DISPLAY_TIME), "Display time, ms");
        assert_eq!(describe_id(0x42), "Unknown argument ID");
    }

    #[test]
    fn display_falls_back_to_hex_for_binary_values() {
        let mut m = Message::new(PROTO_VMC);
        m.append_str(ARG_MESSAGE_NAME, "IDL").unwrap();
        m.append_bin(ARG_SIMPLE_DATA, &[0x00, 0xFF]).unwrap();

        let dump = m.to_string();
        assert!(dump.contains("Message name"));
        assert!(dump.contains("=> IDL"));
        assert!(dump.contains("=> 00ff"));
    }
}
