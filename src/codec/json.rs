//! Avro-JSON framing.
//!
//! A text frame is a JSON array of exactly two elements: `[header, body]`.
//! The outer array and the header element are parsed first; the body element
//! is handed to the catalog only after the header has been inspected, since
//! the header selects the body schema.

use serde_json::Value;

use crate::error::{EtpError, Result};
use crate::messages::Body;
use crate::protocol::{MessageCatalog, MessageHeader};

use super::DecodedMessage;

/// Encode header + body into one text frame.
pub fn encode(header: &MessageHeader, body: &Body) -> Result<String> {
    let frame = Value::Array(vec![serde_json::to_value(header)?, body.to_json()?]);
    Ok(frame.to_string())
}

/// Decode one text frame.
pub fn decode(text: &str, catalog: &MessageCatalog) -> Result<DecodedMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| EtpError::Codec(format!("malformed JSON frame: {}", e)))?;
    let Value::Array(mut elements) = value else {
        return Err(EtpError::Codec("JSON frame is not an array".to_string()));
    };
    if elements.len() != 2 {
        return Err(EtpError::Codec(format!(
            "JSON frame has {} elements, expected 2",
            elements.len()
        )));
    }
    let body_value = elements.pop().expect("length checked");
    let header_value = elements.pop().expect("length checked");

    let header: MessageHeader = serde_json::from_value(header_value)
        .map_err(|e| EtpError::Codec(format!("malformed JSON header: {}", e)))?;
    let body = catalog.decode_json(&header, body_value);
    Ok(DecodedMessage { header, body })
}
