//! Store protocol (id 4) records: whole-object get/put/delete.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::avro::{write_bytes, write_string, AvroCursor};

use super::AvroRecord;

/// A complete data object as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataObject {
    /// Opaque identifier in the store's namespace.
    pub uri: String,
    /// Media type of `data`.
    pub content_type: String,
    /// Raw object payload.
    pub data: Bytes,
}

impl DataObject {
    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uri);
        write_string(buf, &self.content_type);
        write_bytes(buf, &self.data);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            uri: cursor.read_string()?,
            content_type: cursor.read_string()?,
            data: Bytes::from(cursor.read_bytes()?),
        })
    }
}

/// Store message 1: request one object by uri.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetObject {
    /// Target object uri.
    pub uri: String,
}

impl AvroRecord for GetObject {
    const NAME: &'static str = "GetObject";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uri);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            uri: cursor.read_string()?,
        })
    }
}

/// Store message 2: upsert one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutObject {
    /// Object to store.
    pub data_object: DataObject,
}

impl AvroRecord for PutObject {
    const NAME: &'static str = "PutObject";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        self.data_object.encode_avro(buf);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            data_object: DataObject::decode_avro(cursor)?,
        })
    }
}

/// Store message 3: delete one object by uri.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteObject {
    /// Target object uri.
    pub uri: String,
}

impl AvroRecord for DeleteObject {
    const NAME: &'static str = "DeleteObject";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uri);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            uri: cursor.read_string()?,
        })
    }
}

/// Store message 4: object reply. One `GetObject` may be answered by one or
/// more of these, the last carrying the final-part flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    /// The returned object (or one slice of it).
    pub data_object: DataObject,
}

impl AvroRecord for Object {
    const NAME: &'static str = "Object";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        self.data_object.encode_avro(buf);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            data_object: DataObject::decode_avro(cursor)?,
        })
    }
}
