//! GrowingObject protocol (id 6) records: part and range operations on
//! list-like objects (logs, trajectories).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{EtpError, Result};
use crate::protocol::avro::{
    write_block_count, write_block_end, write_bytes, write_double, write_long, write_string,
    write_union_index, AvroCursor,
};

use super::AvroRecord;

/// A range endpoint value: discriminated union over numeric, time, or
/// index values, serialized through the Avro union on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeValue {
    /// Index value (e.g. row number, md in storage units).
    Long(i64),
    /// Continuous depth or value index.
    Double(f64),
    /// Time index, epoch microseconds.
    Timestamp(i64),
}

impl RangeValue {
    fn encode_avro(&self, buf: &mut Vec<u8>) {
        match self {
            RangeValue::Long(v) => {
                write_union_index(buf, 0);
                write_long(buf, *v);
            }
            RangeValue::Double(v) => {
                write_union_index(buf, 1);
                write_double(buf, *v);
            }
            RangeValue::Timestamp(v) => {
                write_union_index(buf, 2);
                write_long(buf, *v);
            }
        }
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        match cursor.read_union_index()? {
            0 => Ok(RangeValue::Long(cursor.read_long()?)),
            1 => Ok(RangeValue::Double(cursor.read_double()?)),
            2 => Ok(RangeValue::Timestamp(cursor.read_long()?)),
            other => Err(EtpError::Codec(format!(
                "invalid range value union index {}",
                other
            ))),
        }
    }
}

/// A range endpoint with its unit annotations. The uom and depth-datum
/// strings round-trip unchanged; the store interprets them, the core does
/// not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeEndpoint {
    /// Endpoint value.
    pub value: RangeValue,
    /// Unit of measure for `value` (e.g. `"m"`, `"ft"`).
    pub uom: String,
    /// Depth datum the value is referenced to (e.g. `"KB"`); empty for
    /// time endpoints.
    pub depth_datum: String,
}

impl RangeEndpoint {
    fn encode_avro(&self, buf: &mut Vec<u8>) {
        self.value.encode_avro(buf);
        write_string(buf, &self.uom);
        write_string(buf, &self.depth_datum);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            value: RangeValue::decode_avro(cursor)?,
            uom: cursor.read_string()?,
            depth_datum: cursor.read_string()?,
        })
    }
}

/// One part of a growing object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPart {
    /// Part identity within its parent object.
    pub uid: String,
    /// Media type of `data`.
    pub content_type: String,
    /// Raw part payload.
    pub data: Bytes,
}

impl ObjectPart {
    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uid);
        write_string(buf, &self.content_type);
        write_bytes(buf, &self.data);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            uid: cursor.read_string()?,
            content_type: cursor.read_string()?,
            data: Bytes::from(cursor.read_bytes()?),
        })
    }
}

/// GrowingObject message 1: request a single part by uid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPart {
    /// Parent object uri.
    pub uri: String,
    /// Part identity.
    pub uid: String,
}

impl AvroRecord for GetPart {
    const NAME: &'static str = "GetPart";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uri);
        write_string(buf, &self.uid);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            uri: cursor.read_string()?,
            uid: cursor.read_string()?,
        })
    }
}

/// GrowingObject message 2: request all parts inside an index range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRange {
    /// Parent object uri.
    pub uri: String,
    /// Inclusive start of the range.
    pub from: RangeEndpoint,
    /// Inclusive end of the range.
    pub to: RangeEndpoint,
}

impl AvroRecord for GetRange {
    const NAME: &'static str = "GetRange";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uri);
        self.from.encode_avro(buf);
        self.to.encode_avro(buf);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            uri: cursor.read_string()?,
            from: RangeEndpoint::decode_avro(cursor)?,
            to: RangeEndpoint::decode_avro(cursor)?,
        })
    }
}

/// GrowingObject message 3: append or replace one part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutPart {
    /// Parent object uri.
    pub uri: String,
    /// The part to store.
    pub part: ObjectPart,
}

impl AvroRecord for PutPart {
    const NAME: &'static str = "PutPart";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uri);
        self.part.encode_avro(buf);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            uri: cursor.read_string()?,
            part: ObjectPart::decode_avro(cursor)?,
        })
    }
}

/// GrowingObject message 4: delete one part by uid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePart {
    /// Parent object uri.
    pub uri: String,
    /// Part identity.
    pub uid: String,
}

impl AvroRecord for DeletePart {
    const NAME: &'static str = "DeletePart";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uri);
        write_string(buf, &self.uid);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            uri: cursor.read_string()?,
            uid: cursor.read_string()?,
        })
    }
}

/// GrowingObject message 5: delete all parts inside an index range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRange {
    /// Parent object uri.
    pub uri: String,
    /// Inclusive start of the range.
    pub from: RangeEndpoint,
    /// Inclusive end of the range.
    pub to: RangeEndpoint,
}

impl AvroRecord for DeleteRange {
    const NAME: &'static str = "DeleteRange";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uri);
        self.from.encode_avro(buf);
        self.to.encode_avro(buf);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            uri: cursor.read_string()?,
            from: RangeEndpoint::decode_avro(cursor)?,
            to: RangeEndpoint::decode_avro(cursor)?,
        })
    }
}

/// GrowingObject message 6: one part of a reply set. Range replies are
/// multipart: zero or more fragments followed by a final part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectFragment {
    /// Parent object uri.
    pub uri: String,
    /// The returned part.
    pub part: ObjectPart,
}

impl AvroRecord for ObjectFragment {
    const NAME: &'static str = "ObjectFragment";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uri);
        self.part.encode_avro(buf);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        Ok(Self {
            uri: cursor.read_string()?,
            part: ObjectPart::decode_avro(cursor)?,
        })
    }
}

/// GrowingObject message 7 (v1.2 only): atomically delete a range and
/// insert replacement parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacePartsByRange {
    /// Parent object uri.
    pub uri: String,
    /// Inclusive start of the range to delete.
    pub from: RangeEndpoint,
    /// Inclusive end of the range to delete.
    pub to: RangeEndpoint,
    /// Replacement parts, in index order.
    pub parts: Vec<ObjectPart>,
}

impl AvroRecord for ReplacePartsByRange {
    const NAME: &'static str = "ReplacePartsByRange";

    fn encode_avro(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.uri);
        self.from.encode_avro(buf);
        self.to.encode_avro(buf);
        if !self.parts.is_empty() {
            write_block_count(buf, self.parts.len());
            for part in &self.parts {
                part.encode_avro(buf);
            }
        }
        write_block_end(buf);
    }

    fn decode_avro(cursor: &mut AvroCursor<'_>) -> Result<Self> {
        let uri = cursor.read_string()?;
        let from = RangeEndpoint::decode_avro(cursor)?;
        let to = RangeEndpoint::decode_avro(cursor)?;
        let mut parts = Vec::new();
        loop {
            let count = cursor.read_block_count()?;
            if count == 0 {
                break;
            }
            for _ in 0..count {
                parts.push(ObjectPart::decode_avro(cursor)?);
            }
        }
        Ok(Self {
            uri,
            from,
            to,
            parts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth_endpoint(value: f64) -> RangeEndpoint {
        RangeEndpoint {
            value: RangeValue::Double(value),
            uom: "m".to_string(),
            depth_datum: "KB".to_string(),
        }
    }

    fn roundtrip<T: AvroRecord + PartialEq + std::fmt::Debug>(record: &T) {
        let mut buf = Vec::new();
        record.encode_avro(&mut buf);
        let mut cursor = AvroCursor::new(&buf);
        let decoded = T::decode_avro(&mut cursor).unwrap();
        assert_eq!(&decoded, record);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_range_value_variants_roundtrip() {
        for value in [
            RangeValue::Long(1234),
            RangeValue::Double(1234.5),
            RangeValue::Timestamp(1_700_000_000_000_000),
        ] {
            let mut buf = Vec::new();
            value.encode_avro(&mut buf);
            assert_eq!(
                RangeValue::decode_avro(&mut AvroCursor::new(&buf)).unwrap(),
                value
            );
        }
    }

    #[test]
    fn test_range_value_json_tagging() {
        let json = serde_json::to_value(RangeValue::Long(5)).unwrap();
        assert_eq!(json, serde_json::json!({ "long": 5 }));
        let json = serde_json::to_value(RangeValue::Timestamp(99)).unwrap();
        assert_eq!(json, serde_json::json!({ "timestamp": 99 }));
    }

    #[test]
    fn test_endpoint_annotations_preserved() {
        let endpoint = RangeEndpoint {
            value: RangeValue::Long(100),
            uom: "ft".to_string(),
            depth_datum: "DF".to_string(),
        };
        let mut buf = Vec::new();
        endpoint.encode_avro(&mut buf);
        let decoded = RangeEndpoint::decode_avro(&mut AvroCursor::new(&buf)).unwrap();
        assert_eq!(decoded.uom, "ft");
        assert_eq!(decoded.depth_datum, "DF");
    }

    #[test]
    fn test_get_range_roundtrip() {
        roundtrip(&GetRange {
            uri: "eml://log/7".to_string(),
            from: depth_endpoint(100.0),
            to: depth_endpoint(200.0),
        });
    }

    #[test]
    fn test_part_messages_roundtrip() {
        let part = ObjectPart {
            uid: "p-1".to_string(),
            content_type: "application/x-witsml+xml".to_string(),
            data: Bytes::from_static(b"<logData/>"),
        };
        roundtrip(&GetPart {
            uri: "eml://log/7".to_string(),
            uid: "p-1".to_string(),
        });
        roundtrip(&PutPart {
            uri: "eml://log/7".to_string(),
            part: part.clone(),
        });
        roundtrip(&DeletePart {
            uri: "eml://log/7".to_string(),
            uid: "p-1".to_string(),
        });
        roundtrip(&DeleteRange {
            uri: "eml://log/7".to_string(),
            from: depth_endpoint(0.0),
            to: depth_endpoint(50.0),
        });
        roundtrip(&ObjectFragment {
            uri: "eml://log/7".to_string(),
            part,
        });
    }

    #[test]
    fn test_replace_parts_by_range_roundtrip() {
        roundtrip(&ReplacePartsByRange {
            uri: "eml://log/7".to_string(),
            from: depth_endpoint(10.0),
            to: depth_endpoint(20.0),
            parts: vec![
                ObjectPart {
                    uid: "p-1".to_string(),
                    content_type: "application/octet-stream".to_string(),
                    data: Bytes::from_static(&[1, 2, 3]),
                },
                ObjectPart {
                    uid: "p-2".to_string(),
                    content_type: "application/octet-stream".to_string(),
                    data: Bytes::new(),
                },
            ],
        });
    }

    #[test]
    fn test_replace_parts_empty_list_roundtrip() {
        roundtrip(&ReplacePartsByRange {
            uri: "eml://log/7".to_string(),
            from: depth_endpoint(10.0),
            to: depth_endpoint(20.0),
            parts: Vec::new(),
        });
    }
}
