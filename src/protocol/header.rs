//! Message header encoding and decoding.
//!
//! Every ETP message starts with the same five-field envelope:
//! ```text
//! ┌──────────┬─────────────┬───────────┬───────────────┬──────────────┐
//! │ protocol │ messageType │ messageId │ correlationId │ messageFlags │
//! │ int      │ int         │ long      │ long          │ int          │
//! └──────────┴─────────────┴───────────┴───────────────┴──────────────┘
//! ```
//! In the binary framing each field is Avro zigzag-varint encoded; in the
//! JSON framing the header is the first element of the `[header, body]`
//! array with camelCase field names.

use serde::{Deserialize, Serialize};

use super::avro::{write_int, write_long, AvroCursor};
use crate::error::{EtpError, Result};

/// Flag constants for `messageFlags`.
pub mod flags {
    /// Message is one part of a multipart response set.
    pub const MULTI_PART: u32 = 0x1;
    /// Message is the final part of its response set.
    pub const FINAL_PART: u32 = 0x2;
    /// Final part of a multipart set (both bits).
    pub const MULTI_PART_AND_FINAL_PART: u32 = MULTI_PART | FINAL_PART;
    /// Message intentionally carries no body payload.
    pub const NO_DATA: u32 = 0x4;
    /// Body is compressed per the negotiated session capability.
    pub const COMPRESSED: u32 = 0x8;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u32, flag: u32) -> bool {
        flags & flag != 0
    }
}

/// The uniform envelope carried by every ETP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Numeric protocol id (0 = Core, 4 = Store, 6 = GrowingObject, ...).
    pub protocol: u16,
    /// Protocol-scoped message type id.
    pub message_type: u16,
    /// Monotonically increasing per-session id, stamped at send time.
    pub message_id: i64,
    /// 0 when this message initiates an exchange, otherwise the
    /// `message_id` of the message it replies to.
    pub correlation_id: i64,
    /// Bitfield, see the [`flags`] module.
    pub message_flags: u32,
}

impl MessageHeader {
    /// Create a header that initiates a new exchange on `protocol`.
    pub fn request(protocol: u16, message_type: u16) -> Self {
        Self {
            protocol,
            message_type,
            message_id: 0,
            correlation_id: 0,
            message_flags: 0,
        }
    }

    /// Create a header replying to `correlation_id` on `protocol`.
    pub fn response(protocol: u16, message_type: u16, correlation_id: i64) -> Self {
        Self {
            protocol,
            message_type,
            message_id: 0,
            correlation_id,
            message_flags: 0,
        }
    }

    /// Set `messageFlags`, builder style.
    pub fn with_flags(mut self, message_flags: u32) -> Self {
        self.message_flags = message_flags;
        self
    }

    /// Append the Avro-binary encoding of this header.
    pub fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_int(buf, i32::from(self.protocol));
        write_int(buf, i32::from(self.message_type));
        write_long(buf, self.message_id);
        write_long(buf, self.correlation_id);
        write_int(buf, self.message_flags as i32);
    }

    /// Consume the Avro-binary encoding of a header from `cursor`.
    ///
    /// The header schema is self-delimiting: after this returns, the cursor
    /// sits on the first byte of the body record.
    pub fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        let protocol = field_u16(cursor.read_int()?, "protocol")?;
        let message_type = field_u16(cursor.read_int()?, "messageType")?;
        let message_id = cursor.read_long()?;
        let correlation_id = cursor.read_long()?;
        let message_flags = cursor.read_int()? as u32;
        Ok(Self {
            protocol,
            message_type,
            message_id,
            correlation_id,
            message_flags,
        })
    }

    /// Check if this message is one part of a multipart set.
    #[inline]
    pub fn is_multi_part(&self) -> bool {
        flags::has_flag(self.message_flags, flags::MULTI_PART)
    }

    /// Check if this message is the final part of its set.
    #[inline]
    pub fn is_final_part(&self) -> bool {
        flags::has_flag(self.message_flags, flags::FINAL_PART)
    }

    /// Check if this message carries no body payload.
    #[inline]
    pub fn is_no_data(&self) -> bool {
        flags::has_flag(self.message_flags, flags::NO_DATA)
    }

    /// Check if the body is compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        flags::has_flag(self.message_flags, flags::COMPRESSED)
    }

    /// Check if this message initiates its exchange (request or
    /// unsolicited notification).
    #[inline]
    pub fn initiates_exchange(&self) -> bool {
        self.correlation_id == 0
    }
}

fn field_u16(value: i32, field: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| EtpError::Codec(format!("header field {} out of range: {}", field, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_avro_roundtrip() {
        let header = MessageHeader {
            protocol: 4,
            message_type: 1,
            message_id: 42,
            correlation_id: 7,
            message_flags: flags::MULTI_PART_AND_FINAL_PART,
        };
        let mut buf = Vec::new();
        header.encode_avro(&mut buf);
        let mut cursor = AvroCursor::new(&buf);
        let decoded = MessageHeader::decode_avro(&mut cursor).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_header_is_self_delimiting() {
        let header = MessageHeader::request(0, 1);
        let mut buf = Vec::new();
        header.encode_avro(&mut buf);
        buf.extend_from_slice(b"body bytes follow");

        let mut cursor = AvroCursor::new(&buf);
        let decoded = MessageHeader::decode_avro(&mut cursor).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(cursor.remaining(), b"body bytes follow".len());
    }

    #[test]
    fn test_header_json_field_names() {
        let header = MessageHeader {
            protocol: 4,
            message_type: 1,
            message_id: 1,
            correlation_id: 0,
            message_flags: 0,
        };
        let json = serde_json::to_value(header).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "protocol": 4,
                "messageType": 1,
                "messageId": 1,
                "correlationId": 0,
                "messageFlags": 0
            })
        );
    }

    #[test]
    fn test_flag_accessors() {
        let multi = MessageHeader::request(6, 6).with_flags(flags::MULTI_PART);
        assert!(multi.is_multi_part());
        assert!(!multi.is_final_part());

        let last = MessageHeader::request(6, 6).with_flags(flags::MULTI_PART_AND_FINAL_PART);
        assert!(last.is_multi_part());
        assert!(last.is_final_part());

        let ack = MessageHeader::request(0, 1001).with_flags(flags::NO_DATA);
        assert!(ack.is_no_data());
        assert!(!ack.is_compressed());
    }

    #[test]
    fn test_initiates_exchange() {
        assert!(MessageHeader::request(4, 1).initiates_exchange());
        assert!(!MessageHeader::response(4, 4, 9).initiates_exchange());
    }

    #[test]
    fn test_negative_protocol_rejected() {
        let mut buf = Vec::new();
        write_int(&mut buf, -3);
        write_int(&mut buf, 1);
        write_long(&mut buf, 1);
        write_long(&mut buf, 0);
        write_int(&mut buf, 0);
        let mut cursor = AvroCursor::new(&buf);
        assert!(MessageHeader::decode_avro(&mut cursor).is_err());
    }
}
