//! Avro-binary framing.
//!
//! A frame is the Avro-binary header record immediately followed by the
//! Avro-binary body record. The header schema is self-delimiting, so no
//! length prefix separates the two.

use crate::error::Result;
use crate::messages::Body;
use crate::protocol::avro::AvroCursor;
use crate::protocol::{MessageCatalog, MessageHeader};

use super::DecodedMessage;

/// Encode header + body into one binary frame.
pub fn encode(header: &MessageHeader, body: &Body) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    header.encode_avro(&mut buf);
    body.encode_avro(&mut buf);
    buf
}

/// Decode one binary frame: header first, then the body via the catalog
/// schema the header selects.
pub fn decode(bytes: &[u8], catalog: &MessageCatalog) -> Result<DecodedMessage> {
    let mut cursor = AvroCursor::new(bytes);
    let header = MessageHeader::decode_avro(&mut cursor)?;
    let body = catalog.decode_binary(&header, &mut cursor);
    Ok(DecodedMessage { header, body })
}
