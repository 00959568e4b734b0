//! Message catalog: `(protocol, messageType)` to typed-record mapping.
//!
//! The catalog is the single declaration site for a wire version. Each
//! `declare::<T>` call installs the record name, a direction hint, the
//! multipart hint, and decode closures for both framings. Adding a message
//! means one record struct and one `declare` line.

use std::collections::HashMap;

use crate::error::{EtpError, Result};
use crate::messages::{
    Acknowledge, Body, CloseSession, DeleteObject, DeletePart, DeleteRange, EtpVersion, GetObject,
    GetPart, GetRange, Object, ObjectFragment, OpenSession, ProtocolException, PutObject, PutPart,
    ReplacePartsByRange, RequestSession,
};

use super::avro::AvroCursor;
use super::header::MessageHeader;

/// Numeric protocol ids used by this runtime.
pub mod protocols {
    /// Core session protocol.
    pub const CORE: u16 = 0;
    /// Store protocol (whole objects).
    pub const STORE: u16 = 4;
    /// GrowingObject protocol (parts and ranges).
    pub const GROWING_OBJECT: u16 = 6;
}

/// Protocol-scoped message type ids.
pub mod message_types {
    /// `ProtocolException` lives in every protocol's number space.
    pub const PROTOCOL_EXCEPTION: u16 = 1000;
    /// `Acknowledge` lives in every protocol's number space.
    pub const ACKNOWLEDGE: u16 = 1001;

    /// Core protocol message types.
    pub mod core {
        pub const REQUEST_SESSION: u16 = 1;
        pub const OPEN_SESSION: u16 = 2;
        pub const CLOSE_SESSION: u16 = 5;
    }

    /// Store protocol message types.
    pub mod store {
        pub const GET_OBJECT: u16 = 1;
        pub const PUT_OBJECT: u16 = 2;
        pub const DELETE_OBJECT: u16 = 3;
        pub const OBJECT: u16 = 4;
    }

    /// GrowingObject protocol message types.
    pub mod growing_object {
        pub const GET_PART: u16 = 1;
        pub const GET_RANGE: u16 = 2;
        pub const PUT_PART: u16 = 3;
        pub const DELETE_PART: u16 = 4;
        pub const DELETE_RANGE: u16 = 5;
        pub const OBJECT_FRAGMENT: u16 = 6;
        pub const REPLACE_PARTS_BY_RANGE: u16 = 7;
    }
}

/// Direction hint for a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Initiates an exchange; expects a correlated reply.
    Request,
    /// Correlated reply to a request.
    Response,
    /// Unsolicited, no reply expected.
    Notification,
    /// Sent by either side in either position.
    Bidirectional,
}

type BinaryDecoder = Box<dyn Fn(&mut AvroCursor<'_>) -> Result<Body> + Send + Sync>;
type JsonDecoder = Box<dyn Fn(serde_json::Value) -> Result<Body> + Send + Sync>;

/// One `(protocol, messageType)` slot in the catalog.
pub struct CatalogEntry {
    /// Record name, for diagnostics.
    pub name: &'static str,
    /// Direction hint.
    pub direction: Direction,
    /// Whether replies to this request are inherently multipart.
    pub multipart_response: bool,
    decode_binary: BinaryDecoder,
    decode_json: JsonDecoder,
}

impl std::fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("multipart_response", &self.multipart_response)
            .finish()
    }
}

/// Static mapping from `(protocol, messageType)` to typed-record schema,
/// built once per session for the negotiated wire version.
pub struct MessageCatalog {
    version: EtpVersion,
    entries: HashMap<(u16, u16), CatalogEntry>,
}

impl MessageCatalog {
    /// Build the catalog for one wire version.
    pub fn for_version(version: EtpVersion) -> Self {
        use crate::messages::AvroRecord;

        let mut catalog = Self {
            version,
            entries: HashMap::new(),
        };

        fn declare<T>(
            catalog: &mut MessageCatalog,
            protocol: u16,
            message_type: u16,
            direction: Direction,
            multipart_response: bool,
            wrap: fn(T) -> Body,
        ) where
            T: AvroRecord + serde::de::DeserializeOwned + 'static,
        {
            let entry = CatalogEntry {
                name: T::NAME,
                direction,
                multipart_response,
                decode_binary: Box::new(move |cursor| Ok(wrap(T::decode_avro(cursor)?))),
                decode_json: Box::new(move |value| Ok(wrap(serde_json::from_value(value)?))),
            };
            let replaced = catalog.entries.insert((protocol, message_type), entry);
            debug_assert!(replaced.is_none(), "duplicate catalog declaration");
        }

        // Core.
        declare::<RequestSession>(
            &mut catalog,
            protocols::CORE,
            message_types::core::REQUEST_SESSION,
            Direction::Request,
            false,
            Body::RequestSession,
        );
        declare::<OpenSession>(
            &mut catalog,
            protocols::CORE,
            message_types::core::OPEN_SESSION,
            Direction::Response,
            false,
            Body::OpenSession,
        );
        declare::<CloseSession>(
            &mut catalog,
            protocols::CORE,
            message_types::core::CLOSE_SESSION,
            Direction::Notification,
            false,
            Body::CloseSession,
        );
        // ProtocolException and Acknowledge are addressable in every
        // protocol's number space; the header keeps the protocol of the
        // exchange they answer.
        for protocol in [protocols::CORE, protocols::STORE, protocols::GROWING_OBJECT] {
            declare::<ProtocolException>(
                &mut catalog,
                protocol,
                message_types::PROTOCOL_EXCEPTION,
                Direction::Response,
                false,
                Body::ProtocolException,
            );
            declare::<Acknowledge>(
                &mut catalog,
                protocol,
                message_types::ACKNOWLEDGE,
                Direction::Response,
                false,
                Body::Acknowledge,
            );
        }

        // Store. Object replies became inherently multipart in 1.2.
        let object_multipart = version == EtpVersion::V12;
        declare::<GetObject>(
            &mut catalog,
            protocols::STORE,
            message_types::store::GET_OBJECT,
            Direction::Request,
            object_multipart,
            Body::GetObject,
        );
        declare::<PutObject>(
            &mut catalog,
            protocols::STORE,
            message_types::store::PUT_OBJECT,
            Direction::Request,
            false,
            Body::PutObject,
        );
        declare::<DeleteObject>(
            &mut catalog,
            protocols::STORE,
            message_types::store::DELETE_OBJECT,
            Direction::Request,
            false,
            Body::DeleteObject,
        );
        declare::<Object>(
            &mut catalog,
            protocols::STORE,
            message_types::store::OBJECT,
            Direction::Response,
            object_multipart,
            Body::Object,
        );

        // GrowingObject.
        declare::<GetPart>(
            &mut catalog,
            protocols::GROWING_OBJECT,
            message_types::growing_object::GET_PART,
            Direction::Request,
            false,
            Body::GetPart,
        );
        declare::<GetRange>(
            &mut catalog,
            protocols::GROWING_OBJECT,
            message_types::growing_object::GET_RANGE,
            Direction::Request,
            true,
            Body::GetRange,
        );
        declare::<PutPart>(
            &mut catalog,
            protocols::GROWING_OBJECT,
            message_types::growing_object::PUT_PART,
            Direction::Request,
            false,
            Body::PutPart,
        );
        declare::<DeletePart>(
            &mut catalog,
            protocols::GROWING_OBJECT,
            message_types::growing_object::DELETE_PART,
            Direction::Request,
            false,
            Body::DeletePart,
        );
        declare::<DeleteRange>(
            &mut catalog,
            protocols::GROWING_OBJECT,
            message_types::growing_object::DELETE_RANGE,
            Direction::Request,
            false,
            Body::DeleteRange,
        );
        declare::<ObjectFragment>(
            &mut catalog,
            protocols::GROWING_OBJECT,
            message_types::growing_object::OBJECT_FRAGMENT,
            Direction::Response,
            true,
            Body::ObjectFragment,
        );
        if version == EtpVersion::V12 {
            declare::<ReplacePartsByRange>(
                &mut catalog,
                protocols::GROWING_OBJECT,
                message_types::growing_object::REPLACE_PARTS_BY_RANGE,
                Direction::Request,
                false,
                Body::ReplacePartsByRange,
            );
        }

        catalog
    }

    /// Wire version this catalog was built for.
    pub fn version(&self) -> EtpVersion {
        self.version
    }

    /// O(1) lookup of a catalog entry.
    pub fn lookup(&self, protocol: u16, message_type: u16) -> Option<&CatalogEntry> {
        self.entries.get(&(protocol, message_type))
    }

    /// Check whether a protocol id has at least one catalog entry.
    pub fn knows_protocol(&self, protocol: u16) -> bool {
        self.entries.keys().any(|(p, _)| *p == protocol)
    }

    /// Decode an Avro-binary body for `header` from `cursor`.
    pub fn decode_binary(&self, header: &MessageHeader, cursor: &mut AvroCursor<'_>) -> Result<Body> {
        let entry = self.entry_for(header)?;
        (entry.decode_binary)(cursor)
    }

    /// Decode an Avro-JSON body for `header`.
    pub fn decode_json(&self, header: &MessageHeader, value: serde_json::Value) -> Result<Body> {
        let entry = self.entry_for(header)?;
        (entry.decode_json)(value)
    }

    fn entry_for(&self, header: &MessageHeader) -> Result<&CatalogEntry> {
        self.lookup(header.protocol, header.message_type)
            .ok_or(EtpError::UnknownMessage {
                protocol: header.protocol,
                message_type: header.message_type,
            })
    }
}
