//! # Wire Codec
//!
//! Every message travels as a single frame: a fixed 56-byte header (seven
//! little-endian `u64` words: `version`, `id`, `length`, four spare words
//! of zero) followed by `length` bytes of MessagePack holding one map.
//!
//! The payload mapping is direct: null/bool/int/uint/double/string/bin map
//! to their MessagePack counterparts, arrays and dictionaries nest, dates
//! travel as opaque integers (and therefore come back as an integer kind),
//! and uuids use ext type 1 with the 16 raw bytes. Error values have no
//! wire form; trying to encode a tree containing one fails, which the
//! connection reports as a send failure.
//!
//! Dictionaries built by the decoder carry wire provenance at every depth
//! so that [`Object::dictionary_create_reply`] works on them.

use rmpv::Value;

use crate::defaults::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE, PROTOCOL_VERSION};
use crate::error::IpcError;
use crate::object::{Kind, Object, Payload};

/// MessagePack ext type carrying a 16-byte uuid.
const UUID_EXT_TYPE: i8 = 1;

/// Largest payload that fits a frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

fn read_u64_le(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

/// The fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u64,
    pub id: u64,
    pub length: u64,
}

impl FrameHeader {
    pub fn new(id: u64, length: u64) -> FrameHeader {
        FrameHeader {
            version: PROTOCOL_VERSION,
            id,
            length,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Parse and validate a header. The version must match and the payload
    /// length must fit the frame cap; a header that fails either check
    /// cannot be used to re-synchronize the stream.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<FrameHeader, IpcError> {
        let version = read_u64_le(buf, 0);
        if version != PROTOCOL_VERSION {
            return Err(IpcError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }
        let id = read_u64_le(buf, 8);
        let length = read_u64_le(buf, 16);
        if length > MAX_PAYLOAD_SIZE as u64 {
            return Err(IpcError::FrameTooLarge {
                length,
                limit: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(FrameHeader {
            version,
            id,
            length,
        })
    }
}

/// Serialize `message` into a complete frame carrying correlation `id`.
pub fn encode_frame(message: &Object, id: u64) -> Result<Vec<u8>, IpcError> {
    let value = to_wire_value(message)?;
    let mut payload = Vec::new();
    rmpv::encode::write_value(&mut payload, &value)
        .map_err(|e| IpcError::Encode(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(IpcError::FrameTooLarge {
            length: payload.len() as u64,
            limit: MAX_PAYLOAD_SIZE,
        });
    }

    let header = FrameHeader::new(id, payload.len() as u64);
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse a frame payload back into a value graph.
///
/// The top-level value must be a map; every dictionary in the result
/// carries wire provenance. Any structural problem is a decode failure,
/// which the receive path answers by dropping the frame.
pub fn decode_payload(payload: &[u8]) -> Result<Object, IpcError> {
    let mut cursor = payload;
    let value =
        rmpv::decode::read_value(&mut cursor).map_err(|e| IpcError::Decode(e.to_string()))?;
    let root = from_wire_value(&value)?;
    if root.kind() != Kind::Dictionary {
        return Err(IpcError::Decode("top-level value is not a map".into()));
    }
    Ok(root)
}

fn to_wire_value(object: &Object) -> Result<Value, IpcError> {
    let value = match object.payload() {
        Payload::Null => Value::Nil,
        Payload::Bool(v) => Value::Boolean(*v),
        Payload::Int64(v) => Value::from(*v),
        Payload::Uint64(v) => Value::from(*v),
        Payload::Double(v) => Value::F64(*v),
        // Dates are opaque on the wire; the unit is the producer's business.
        Payload::Date(v) => Value::from(*v),
        Payload::String(s) => Value::String(s.clone().into()),
        Payload::Data(bytes) => Value::Binary(bytes.clone()),
        Payload::Uuid(u) => Value::Ext(UUID_EXT_TYPE, u.as_bytes().to_vec()),
        Payload::Array(items) => {
            let items = items.lock().clone();
            let mut children = Vec::with_capacity(items.len());
            for item in &items {
                children.push(to_wire_value(item)?);
            }
            Value::Array(children)
        }
        Payload::Dictionary(pairs) => {
            let pairs = pairs.lock().clone();
            let mut entries = Vec::with_capacity(pairs.len());
            for (key, value) in &pairs {
                entries.push((Value::String(key.clone().into()), to_wire_value(value)?));
            }
            Value::Map(entries)
        }
        Payload::Error(code) => {
            return Err(IpcError::Encode(format!(
                "error values ({code}) have no wire representation"
            )));
        }
    };
    Ok(value)
}

fn from_wire_value(value: &Value) -> Result<Object, IpcError> {
    let object = match value {
        Value::Nil => Object::null(),
        Value::Boolean(v) => Object::boolean(*v),
        Value::Integer(n) => {
            // Minimal integer encoding: everything non-negative parses as
            // the unsigned class.
            if let Some(u) = n.as_u64() {
                Object::uint64(u)
            } else if let Some(i) = n.as_i64() {
                Object::int64(i)
            } else {
                return Err(IpcError::Decode("integer out of 64-bit range".into()));
            }
        }
        Value::F32(v) => Object::double(*v as f64),
        Value::F64(v) => Object::double(*v),
        Value::String(s) => {
            let s = s
                .as_str()
                .ok_or_else(|| IpcError::Decode("string is not valid utf-8".into()))?;
            Object::string(s)
        }
        Value::Binary(bytes) => Object::data(bytes),
        Value::Ext(ext_type, data) => {
            if *ext_type != UUID_EXT_TYPE || data.len() != 16 {
                return Err(IpcError::Decode(format!(
                    "unsupported ext type {ext_type} ({} bytes)",
                    data.len()
                )));
            }
            let uuid = uuid::Uuid::from_slice(data)
                .map_err(|e| IpcError::Decode(e.to_string()))?;
            Object::uuid(uuid)
        }
        Value::Array(items) => {
            let array = Object::array([]);
            for item in items {
                array.array_append_value(from_wire_value(item)?);
            }
            array
        }
        Value::Map(entries) => {
            let dict = Object::dictionary_from_wire();
            for (key, value) in entries {
                let Value::String(key) = key else {
                    return Err(IpcError::Decode("map key is not a string".into()));
                };
                let key = key
                    .as_str()
                    .ok_or_else(|| IpcError::Decode("map key is not valid utf-8".into()))?;
                if key.is_empty() {
                    return Err(IpcError::Decode("map key is empty".into()));
                }
                dict.dictionary_set_value(key, from_wire_value(value)?);
            }
            dict
        }
    };
    Ok(object)
}
