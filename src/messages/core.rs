//! Core protocol (id 0) records: session negotiation and error reporting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EtpError, ErrorCode, Result};
use crate::protocol::avro::{
    write_block_count, write_block_end, write_bool, write_double, write_int, write_long,
    write_string, write_union_index, AvroCursor,
};

use super::AvroRecord;

/// Wire versions supported side-by-side by this runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EtpVersion {
    /// ETP 1.1.
    V11,
    /// ETP 1.2.
    V12,
}

impl EtpVersion {
    /// The version record advertised during negotiation.
    pub fn version(self) -> Version {
        match self {
            EtpVersion::V11 => Version {
                major: 1,
                minor: 1,
                revision: 0,
                patch: 0,
            },
            EtpVersion::V12 => Version {
                major: 1,
                minor: 2,
                revision: 0,
                patch: 0,
            },
        }
    }

    /// Match a peer-advertised version record against a known wire version.
    pub fn from_version(version: &Version) -> Option<Self> {
        match (version.major, version.minor) {
            (1, 1) => Some(EtpVersion::V11),
            (1, 2) => Some(EtpVersion::V12),
            _ => None,
        }
    }
}

/// The side of a protocol an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Requests and consumes data objects.
    Customer,
    /// Serves data objects.
    Store,
}

impl Role {
    /// The role the peer plays for the same protocol.
    pub fn counterpart(self) -> Role {
        match self {
            Role::Customer => Role::Store,
            Role::Store => Role::Customer,
        }
    }

    /// Wire spelling of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Store => "store",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "customer" => Ok(Role::Customer),
            "store" => Ok(Role::Store),
            other => Err(EtpError::Codec(format!("unknown role {:?}", other))),
        }
    }
}

/// Four-part wire version record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    /// Major version.
    pub major: i32,
    /// Minor version.
    pub minor: i32,
    /// Revision.
    pub revision: i32,
    /// Patch.
    pub patch: i32,
}

impl Version {
    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_int(buf, self.major);
        write_int(buf, self.minor);
        write_int(buf, self.revision);
        write_int(buf, self.patch);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            major: cursor.read_int()?,
            minor: cursor.read_int()?,
            revision: cursor.read_int()?,
            patch: cursor.read_int()?,
        })
    }
}

/// A single capability value: union of long, double, boolean, or text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityValue {
    /// Integer capability (counts, sizes, periods).
    Long(i64),
    /// Fractional capability.
    Double(f64),
    /// On/off capability.
    Boolean(bool),
    /// Free-form text capability.
    Text(String),
}

impl CapabilityValue {
    fn encode_avro(&self, buf: &mut Vec<u8>) {
        match self {
            CapabilityValue::Long(v) => {
                write_union_index(buf, 0);
                write_long(buf, *v);
            }
            CapabilityValue::Double(v) => {
                write_union_index(buf, 1);
                write_double(buf, *v);
            }
            CapabilityValue::Boolean(v) => {
                write_union_index(buf, 2);
                write_bool(buf, *v);
            }
            CapabilityValue::Text(v) => {
                write_union_index(buf, 3);
                write_string(buf, v);
            }
        }
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        match cursor.read_union_index()? {
            0 => Ok(CapabilityValue::Long(cursor.read_long()?)),
            1 => Ok(CapabilityValue::Double(cursor.read_double()?)),
            2 => Ok(CapabilityValue::Boolean(cursor.read_bool()?)),
            3 => Ok(CapabilityValue::Text(cursor.read_string()?)),
            other => Err(EtpError::Codec(format!(
                "invalid capability union index {}",
                other
            ))),
        }
    }
}

/// Known capability keys read by the core. Unknown keys are carried through
/// unmodified and ignored by both sides.
pub mod capability_keys {
    /// Maximum number of response messages per request.
    pub const MAX_RESPONSE_COUNT: &str = "MaxResponseCount";
    /// Maximum number of concurrent transactions.
    pub const MAX_TRANSACTION_COUNT: &str = "MaxTransactionCount";
    /// Transaction timeout period in seconds.
    pub const TRANSACTION_TIMEOUT_PERIOD: &str = "TransactionTimeoutPeriod";
    /// Maximum WebSocket frame size in bytes.
    pub const MAX_FRAME_SIZE: &str = "MaxFrameSize";
}

/// Capability record attached to a [`SupportedProtocol`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub BTreeMap<String, CapabilityValue>);

impl Capabilities {
    /// Empty capability set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an integer capability.
    pub fn set_long(&mut self, key: &str, value: i64) {
        self.0.insert(key.to_string(), CapabilityValue::Long(value));
    }

    /// Read an integer capability; unknown or differently-typed keys
    /// read as absent.
    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(CapabilityValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        if !self.0.is_empty() {
            write_block_count(buf, self.0.len());
            for (key, value) in &self.0 {
                write_string(buf, key);
                value.encode_avro(buf);
            }
        }
        write_block_end(buf);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        let mut map = BTreeMap::new();
        loop {
            let count = cursor.read_block_count()?;
            if count == 0 {
                return Ok(Self(map));
            }
            for _ in 0..count {
                let key = cursor.read_string()?;
                let value = CapabilityValue::decode_avro(cursor)?;
                map.insert(key, value);
            }
        }
    }
}

/// One `(protocol, version, role, capabilities)` tuple advertised during
/// negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedProtocol {
    /// Numeric protocol id.
    pub protocol: u16,
    /// Agreed wire version for this protocol.
    pub protocol_version: Version,
    /// Role the *advertising* endpoint plays.
    pub role: Role,
    /// Published capability record.
    #[serde(default)]
    pub protocol_capabilities: Capabilities,
}

impl SupportedProtocol {
    /// Tuple with empty capabilities.
    pub fn new(protocol: u16, version: EtpVersion, role: Role) -> Self {
        Self {
            protocol,
            protocol_version: version.version(),
            role,
            protocol_capabilities: Capabilities::new(),
        }
    }

    /// Identity used for dedup: `(protocol, role)`.
    pub fn key(&self) -> (u16, Role) {
        (self.protocol, self.role)
    }

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_int(buf, i32::from(self.protocol));
        self.protocol_version.encode_avro(buf);
        write_string(buf, self.role.as_str());
        self.protocol_capabilities.encode_avro(buf);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        let protocol = cursor.read_int()?;
        let protocol = u16::try_from(protocol)
            .map_err(|_| EtpError::Codec(format!("protocol id out of range: {}", protocol)))?;
        Ok(Self {
            protocol,
            protocol_version: Version::decode_avro(cursor)?,
            role: Role::parse(&cursor.read_string()?)?,
            protocol_capabilities: Capabilities::decode_avro(cursor)?,
        })
    }
}

fn encode_supported_protocols(buf: &mut Vec<u8>, items: &[SupportedProtocol]) {
    if !items.is_empty() {
        write_block_count(buf, items.len());
        for item in items {
            item.encode_avro(buf);
        }
    }
    write_block_end(buf);
}

fn decode_supported_protocols(cursor: &mut AvroCursor<'_>) -> Result<Vec<SupportedProtocol>> {
    let mut items = Vec::new();
    loop {
        let count = cursor.read_block_count()?;
        if count == 0 {
            return Ok(items);
        }
        for _ in 0..count {
            items.push(SupportedProtocol::decode_avro(cursor)?);
        }
    }
}

/// Core message 1: customer opens negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSession {
    /// Name of the requesting application.
    pub application_name: String,
    /// Version of the requesting application.
    pub application_version: String,
    /// Protocols the customer wants, with the roles *it* will play.
    pub requested_protocols: Vec<SupportedProtocol>,
}

impl AvroRecord for RequestSession {
    const NAME: &'static str = "RequestSession";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.application_name);
        write_string(buf, &self.application_version);
        encode_supported_protocols(buf, &self.requested_protocols);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            application_name: cursor.read_string()?,
            application_version: cursor.read_string()?,
            requested_protocols: decode_supported_protocols(cursor)?,
        })
    }
}

/// Core message 2: store accepts negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSession {
    /// Server-assigned session identity (UUID-shaped).
    pub session_id: String,
    /// Name of the serving application.
    pub application_name: String,
    /// Version of the serving application.
    pub application_version: String,
    /// Intersection of the request with the store's registry, with the
    /// roles the *store* plays.
    pub supported_protocols: Vec<SupportedProtocol>,
}

impl AvroRecord for OpenSession {
    const NAME: &'static str = "OpenSession";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.session_id);
        write_string(buf, &self.application_name);
        write_string(buf, &self.application_version);
        encode_supported_protocols(buf, &self.supported_protocols);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            session_id: cursor.read_string()?,
            application_name: cursor.read_string()?,
            application_version: cursor.read_string()?,
            supported_protocols: decode_supported_protocols(cursor)?,
        })
    }
}

/// Core message 5: either side ends the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSession {
    /// Human-readable close reason.
    pub reason: String,
}

impl AvroRecord for CloseSession {
    const NAME: &'static str = "CloseSession";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.reason);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            reason: cursor.read_string()?,
        })
    }
}

/// Core message 1001: empty receipt for messages that request one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Acknowledge {}

impl AvroRecord for Acknowledge {
    const NAME: &'static str = "Acknowledge";

    fn encode_avro(&self, _buf: &mut Vec<u8>) {}

    fn decode_avro(_cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {})
    }
}

/// Detail entry in a v1.2 per-request error collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Wire error code for this sub-request.
    pub code: i32,
    /// Human-readable message for this sub-request.
    pub message: String,
}

impl ErrorInfo {
    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_int(buf, self.code);
        write_string(buf, &self.message);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            code: cursor.read_int()?,
            message: cursor.read_string()?,
        })
    }
}

/// Core message 1000: protocol-level error reply.
///
/// The `errors` collection exists on the 1.2 wire only; 1.1 sessions always
/// carry the null union branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolException {
    /// Numeric error code, see [`ErrorCode`].
    pub error_code: i32,
    /// Human-readable error message.
    pub error_message: String,
    /// v1.2 per-request error collection keyed by sub-id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<BTreeMap<String, ErrorInfo>>,
}

impl ProtocolException {
    /// Build an exception from a core error code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code.as_i32(),
            error_message: message.into(),
            errors: None,
        }
    }

    /// Typed view of the numeric code.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from_i32(self.error_code)
    }
}

impl AvroRecord for ProtocolException {
    const NAME: &'static str = "ProtocolException";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_int(buf, self.error_code);
        write_string(buf, &self.error_message);
        match &self.errors {
            None => write_union_index(buf, 0),
            Some(errors) => {
                write_union_index(buf, 1);
                if !errors.is_empty() {
                    write_block_count(buf, errors.len());
                    for (key, info) in errors {
                        write_string(buf, key);
                        info.encode_avro(buf);
                    }
                }
                write_block_end(buf);
            }
        }
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        let error_code = cursor.read_int()?;
        let error_message = cursor.read_string()?;
        let errors = match cursor.read_union_index()? {
            0 => None,
            1 => {
                let mut map = BTreeMap::new();
                loop {
                    let count = cursor.read_block_count()?;
                    if count == 0 {
                        break;
                    }
                    for _ in 0..count {
                        let key = cursor.read_string()?;
                        map.insert(key, ErrorInfo::decode_avro(cursor)?);
                    }
                }
                Some(map)
            }
            other => {
                return Err(EtpError::Codec(format!(
                    "invalid errors union index {}",
                    other
                )))
            }
        };
        Ok(Self {
            error_code,
            error_message,
            errors,
        })
    }
}
