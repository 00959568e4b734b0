//! Codec module - message framing in the two ETP encodings.
//!
//! - [`binary`]: one WebSocket binary frame carrying Avro-binary header
//!   then Avro-binary body, no length prefix between them
//! - [`json`]: one text frame carrying a two-element JSON array
//!   `[header, body]`
//!
//! The encoding is latched per session from the `etp-encoding` upgrade
//! header and never changes for the session lifetime. Decoding always
//! recovers the header first; the body is decoded only after the header has
//! been inspected, because the header selects the body schema. A body-level
//! failure therefore still yields a usable header for the error reply.

pub mod binary;
pub mod json;

use crate::error::Result;
use crate::messages::Body;
use crate::protocol::{MessageCatalog, MessageHeader};
use crate::transport::WireFrame;

/// Default name of the handshake header that selects the encoding.
pub const ENCODING_HEADER: &str = "etp-encoding";

/// Session message encoding, fixed at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageEncoding {
    /// Avro-binary framing (`etp+binary`), the default.
    #[default]
    Binary,
    /// Avro-JSON framing (`etp+json`).
    Json,
}

impl MessageEncoding {
    /// Parse a handshake header value.
    pub fn from_header_value(value: &str) -> Option<Self> {
        match value.trim() {
            "etp+binary" => Some(MessageEncoding::Binary),
            "etp+json" => Some(MessageEncoding::Json),
            _ => None,
        }
    }

    /// Handshake header value for this encoding.
    pub fn header_value(self) -> &'static str {
        match self {
            MessageEncoding::Binary => "etp+binary",
            MessageEncoding::Json => "etp+json",
        }
    }
}

/// A decoded inbound message.
///
/// The outer decode can fail only at header level (the frame is then
/// dropped); a body-level failure is carried in `body` so the session can
/// answer it with a `ProtocolException` correlated to the header.
#[derive(Debug)]
pub struct DecodedMessage {
    /// The decoded envelope.
    pub header: MessageHeader,
    /// The decoded body, or the body-level decode failure.
    pub body: Result<Body>,
}

/// Encode one message in the given encoding.
pub fn encode(
    encoding: MessageEncoding,
    header: &MessageHeader,
    body: &Body,
) -> Result<WireFrame> {
    match encoding {
        MessageEncoding::Binary => Ok(WireFrame::Binary(binary::encode(header, body))),
        MessageEncoding::Json => Ok(WireFrame::Text(json::encode(header, body)?)),
    }
}

/// Decode one inbound frame. The framing is taken from the frame kind
/// itself: binary frames carry Avro-binary, text frames carry JSON.
pub fn decode(frame: &WireFrame, catalog: &MessageCatalog) -> Result<DecodedMessage> {
    match frame {
        WireFrame::Binary(bytes) => binary::decode(bytes, catalog),
        WireFrame::Text(text) => json::decode(text, catalog),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{EtpVersion, GetObject};
    use crate::protocol::protocols;

    fn sample() -> (MessageHeader, Body) {
        let mut header = MessageHeader::request(protocols::STORE, 1);
        header.message_id = 1;
        (
            header,
            Body::GetObject(GetObject {
                uri: "eml://well/1".to_string(),
            }),
        )
    }

    #[test]
    fn test_encoding_header_values() {
        assert_eq!(
            MessageEncoding::from_header_value("etp+binary"),
            Some(MessageEncoding::Binary)
        );
        assert_eq!(
            MessageEncoding::from_header_value(" etp+json "),
            Some(MessageEncoding::Json)
        );
        assert_eq!(MessageEncoding::from_header_value("etp+cbor"), None);
        assert_eq!(MessageEncoding::Binary.header_value(), "etp+binary");
    }

    #[test]
    fn test_default_encoding_is_binary() {
        assert_eq!(MessageEncoding::default(), MessageEncoding::Binary);
    }

    #[test]
    fn test_roundtrip_both_framings() {
        let catalog = MessageCatalog::for_version(EtpVersion::V11);
        let (header, body) = sample();

        for encoding in [MessageEncoding::Binary, MessageEncoding::Json] {
            let frame = encode(encoding, &header, &body).unwrap();
            let decoded = decode(&frame, &catalog).unwrap();
            assert_eq!(decoded.header, header);
            assert_eq!(decoded.body.unwrap(), body);
        }
    }

    #[test]
    fn test_frame_kind_selects_framing() {
        let catalog = MessageCatalog::for_version(EtpVersion::V11);
        let (header, body) = sample();
        let frame = encode(MessageEncoding::Binary, &header, &body).unwrap();
        assert!(matches!(frame, WireFrame::Binary(_)));
        let frame = encode(MessageEncoding::Json, &header, &body).unwrap();
        assert!(matches!(frame, WireFrame::Text(_)));
    }
}
