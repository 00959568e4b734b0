//! Typed message bodies - the closed record catalog.
//!
//! Every `(protocol, messageType)` pair on the wire selects exactly one of
//! the record structs in this module. Records carry two encodings:
//!
//! - **Avro-binary** via the hand-written [`AvroRecord`] impls (field order
//!   is the schema; no tags, no length prefixes)
//! - **Avro-JSON** via serde derives with camelCase field names
//!
//! [`Body`] wraps one value of any record type so the session and handlers
//! can dispatch with an exhaustive `match`.

pub mod core;
pub mod growing_object;
pub mod store;

pub use self::core::{
    capability_keys, Acknowledge, Capabilities, CapabilityValue, CloseSession, ErrorInfo,
    EtpVersion, OpenSession, ProtocolException, RequestSession, Role, SupportedProtocol, Version,
};
pub use self::growing_object::{
    DeletePart, DeleteRange, GetPart, GetRange, ObjectFragment, ObjectPart, PutPart,
    RangeEndpoint, RangeValue, ReplacePartsByRange,
};
pub use self::store::{DataObject, DeleteObject, GetObject, Object, PutObject};

use crate::error::Result;
use crate::protocol::avro::AvroCursor;

/// A typed record with a hand-written Avro-binary encoding.
///
/// Field order in `encode_avro`/`decode_avro` *is* the record schema; the
/// two must stay mirror images.
pub trait AvroRecord: Sized {
    /// Record name as it appears in catalog diagnostics.
    const NAME: &'static str;

    /// Append this record's Avro-binary encoding.
    fn encode_avro(&self, buf: &mut Vec<u8>);

    /// Consume this record's Avro-binary encoding.
    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self>;
}

/// One decoded message body of any catalog record type.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Core 0 / message 1.
    RequestSession(RequestSession),
    /// Core 0 / message 2.
    OpenSession(OpenSession),
    /// Core 0 / message 5.
    CloseSession(CloseSession),
    /// Core 0 / message 1000.
    ProtocolException(ProtocolException),
    /// Core 0 / message 1001.
    Acknowledge(Acknowledge),
    /// Store 4 / message 1.
    GetObject(GetObject),
    /// Store 4 / message 2.
    PutObject(PutObject),
    /// Store 4 / message 3.
    DeleteObject(DeleteObject),
    /// Store 4 / message 4.
    Object(Object),
    /// GrowingObject 6 / message 1.
    GetPart(GetPart),
    /// GrowingObject 6 / message 2.
    GetRange(GetRange),
    /// GrowingObject 6 / message 3.
    PutPart(PutPart),
    /// GrowingObject 6 / message 4.
    DeletePart(DeletePart),
    /// GrowingObject 6 / message 5.
    DeleteRange(DeleteRange),
    /// GrowingObject 6 / message 6.
    ObjectFragment(ObjectFragment),
    /// GrowingObject 6 / message 7 (v1.2).
    ReplacePartsByRange(ReplacePartsByRange),
}

macro_rules! body_dispatch {
    ($self:expr, $inner:ident => $expr:expr) => {
        match $self {
            Body::RequestSession($inner) => $expr,
            Body::OpenSession($inner) => $expr,
            Body::CloseSession($inner) => $expr,
            Body::ProtocolException($inner) => $expr,
            Body::Acknowledge($inner) => $expr,
            Body::GetObject($inner) => $expr,
            Body::PutObject($inner) => $expr,
            Body::DeleteObject($inner) => $expr,
            Body::Object($inner) => $expr,
            Body::GetPart($inner) => $expr,
            Body::GetRange($inner) => $expr,
            Body::PutPart($inner) => $expr,
            Body::DeletePart($inner) => $expr,
            Body::DeleteRange($inner) => $expr,
            Body::ObjectFragment($inner) => $expr,
            Body::ReplacePartsByRange($inner) => $expr,
        }
    };
}

impl Body {
    /// Record name of the wrapped body.
    pub fn name(&self) -> &'static str {
        fn name_of<T: AvroRecord>(_record: &T) -> &'static str {
            T::NAME
        }
        body_dispatch!(self, inner => name_of(inner))
    }

    /// Append the Avro-binary encoding of the wrapped record.
    pub fn encode_avro(&self, buf: &mut Vec<u8>) {
        body_dispatch!(self, inner => inner.encode_avro(buf))
    }

    /// Avro-JSON encoding of the wrapped record.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        fn json_of<T: serde::Serialize>(record: &T) -> Result<serde_json::Value> {
            Ok(serde_json::to_value(record)?)
        }
        body_dispatch!(self, inner => json_of(inner))
    }
}
