//! Framing of values stored inside blobs.
//!
//! A serialized value is `metadata || payload`. The manifest records the
//! encoding, the total size, the metadata prefix length and a SHA-256 over
//! both parts, so a manifest plus an offset addresses one value inside a
//! blob that may hold many.

mod download;
mod writer;

use std::fmt;

pub use download::download_serialized_object;
use proto_api::function_executor_pb::{
    SerializedObject,
    SerializedObjectEncoding,
    SerializedObjectManifest,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
pub use writer::SerializedObjectWriter;

pub const ENCODING_VERSION: u64 = 0;

// ============================================================================
// Values
// ============================================================================

/// Binary content carrying its own content type.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub content_type: String,
    pub content: Vec<u8>,
}

/// A function argument or result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Structured data, stored as JSON or in the compact binary encoding.
    Data(serde_json::Value),
    Text(String),
    File(File),
}

impl Value {
    pub fn default_encoding(&self) -> SerializedObjectEncoding {
        match self {
            Value::Data(_) => SerializedObjectEncoding::Utf8Json,
            Value::Text(_) => SerializedObjectEncoding::Utf8Text,
            Value::File(_) => SerializedObjectEncoding::Raw,
        }
    }

    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_data().and_then(|v| v.as_i64())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Data(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Data(value)
    }
}

impl From<File> for Value {
    fn from(file: File) -> Self {
        Value::File(file)
    }
}

/// JSON document stored in the metadata prefix of every value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMetadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SerializationError {
    HashMismatch { expected: String, actual: String },
    Truncated { needed: u64, available: u64 },
    UnknownEncoding(i32),
    UnsupportedEncoding { encoding: String, reason: String },
    MissingField(&'static str),
    Malformed(String),
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::HashMismatch { expected, actual } => write!(
                f,
                "serialized object hash mismatch: expected {}, got {}",
                expected, actual
            ),
            SerializationError::Truncated { needed, available } => write!(
                f,
                "serialized object is truncated: needs {} bytes, {} available",
                needed, available
            ),
            SerializationError::UnknownEncoding(code) => {
                write!(f, "unknown serialized object encoding: {}", code)
            }
            SerializationError::UnsupportedEncoding { encoding, reason } => {
                write!(f, "unsupported encoding {}: {}", encoding, reason)
            }
            SerializationError::MissingField(field) => {
                write!(f, "serialized object manifest is missing {}", field)
            }
            SerializationError::Malformed(reason) => {
                write!(f, "malformed serialized object: {}", reason)
            }
        }
    }
}

impl std::error::Error for SerializationError {}

// ============================================================================
// Encoding
// ============================================================================

#[derive(Debug, Clone)]
pub struct SerializedValue {
    pub manifest: SerializedObjectManifest,
    pub metadata: Vec<u8>,
    pub payload: Vec<u8>,
}

impl SerializedValue {
    pub fn len(&self) -> u64 {
        (self.metadata.len() + self.payload.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len() as usize);
        bytes.extend_from_slice(&self.metadata);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

pub fn sha256_hexdigest(metadata: &[u8], payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(metadata);
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Serializes with the value's default encoding.
pub fn serialize(value: &Value) -> Result<SerializedValue, SerializationError> {
    serialize_with(value, value.default_encoding())
}

pub fn serialize_with(
    value: &Value,
    encoding: SerializedObjectEncoding,
) -> Result<SerializedValue, SerializationError> {
    let unsupported = |reason: &str| SerializationError::UnsupportedEncoding {
        encoding: format!("{:?}", encoding),
        reason: reason.to_string(),
    };

    let (payload, content_type) = match (value, encoding) {
        (Value::Data(v), SerializedObjectEncoding::Utf8Json) => (
            serde_json::to_vec(v).map_err(|e| SerializationError::Malformed(e.to_string()))?,
            None,
        ),
        (Value::Data(v), SerializedObjectEncoding::BinaryPickle) => {
            let mut buf = Vec::new();
            ciborium::into_writer(v, &mut buf)
                .map_err(|e| SerializationError::Malformed(e.to_string()))?;
            (buf, None)
        }
        (Value::Text(s), SerializedObjectEncoding::Utf8Text) => (s.as_bytes().to_vec(), None),
        (Value::File(file), SerializedObjectEncoding::Raw) => {
            (file.content.clone(), Some(file.content_type.clone()))
        }
        (Value::Data(_), _) => return Err(unsupported("data values use UTF8_JSON or BINARY_PICKLE")),
        (Value::Text(_), _) => return Err(unsupported("text values use UTF8_TEXT")),
        (Value::File(_), _) => return Err(unsupported("files use RAW")),
    };

    let metadata = serde_json::to_vec(&ValueMetadata {
        id: nanoid::nanoid!(),
        content_type: content_type.clone(),
    })
    .map_err(|e| SerializationError::Malformed(e.to_string()))?;

    let manifest = SerializedObjectManifest {
        encoding: Some(encoding as i32),
        encoding_version: Some(ENCODING_VERSION),
        size: Some((metadata.len() + payload.len()) as u64),
        metadata_size: Some(metadata.len() as u64),
        sha256_hash: Some(sha256_hexdigest(&metadata, &payload)),
        content_type,
        source_function_call_id: None,
    };
    Ok(SerializedValue {
        manifest,
        metadata,
        payload,
    })
}

// ============================================================================
// Decoding
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedValue {
    pub metadata: Option<ValueMetadata>,
    pub value: Value,
}

/// Checks size and hash of the object at `offset` and returns its bytes
/// split into `(metadata, payload)`.
pub fn verified_bytes<'a>(
    manifest: &SerializedObjectManifest,
    offset: u64,
    blob: &'a [u8],
) -> Result<(&'a [u8], &'a [u8]), SerializationError> {
    let size = manifest.size.ok_or(SerializationError::MissingField("size"))?;
    let expected_hash = manifest
        .sha256_hash
        .as_deref()
        .ok_or(SerializationError::MissingField("sha256_hash"))?;
    let metadata_size = manifest.metadata_size.unwrap_or(0);

    let end = offset
        .checked_add(size)
        .ok_or_else(|| SerializationError::Malformed("offset overflow".to_string()))?;
    if end > blob.len() as u64 {
        return Err(SerializationError::Truncated {
            needed: end,
            available: blob.len() as u64,
        });
    }
    if metadata_size > size {
        return Err(SerializationError::Malformed(format!(
            "metadata size {} exceeds object size {}",
            metadata_size, size
        )));
    }

    let bytes = &blob[offset as usize..end as usize];
    let (metadata, payload) = bytes.split_at(metadata_size as usize);
    let actual = sha256_hexdigest(metadata, payload);
    if actual != expected_hash {
        return Err(SerializationError::HashMismatch {
            expected: expected_hash.to_string(),
            actual,
        });
    }
    Ok((metadata, payload))
}

pub fn deserialize(
    manifest: &SerializedObjectManifest,
    offset: u64,
    blob: &[u8],
) -> Result<DecodedValue, SerializationError> {
    let (metadata, payload) = verified_bytes(manifest, offset, blob)?;

    let metadata = if metadata.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice::<ValueMetadata>(metadata)
                .map_err(|e| SerializationError::Malformed(format!("metadata: {}", e)))?,
        )
    };

    let code = manifest.encoding.unwrap_or(0);
    let encoding = SerializedObjectEncoding::try_from(code)
        .map_err(|_| SerializationError::UnknownEncoding(code))?;
    let value = match encoding {
        SerializedObjectEncoding::Utf8Json => Value::Data(
            serde_json::from_slice(payload)
                .map_err(|e| SerializationError::Malformed(e.to_string()))?,
        ),
        SerializedObjectEncoding::BinaryPickle => Value::Data(
            ciborium::from_reader(payload)
                .map_err(|e| SerializationError::Malformed(e.to_string()))?,
        ),
        SerializedObjectEncoding::Utf8Text => Value::Text(
            String::from_utf8(payload.to_vec())
                .map_err(|e| SerializationError::Malformed(e.to_string()))?,
        ),
        SerializedObjectEncoding::Raw => Value::File(File {
            content_type: manifest
                .content_type
                .clone()
                .or_else(|| metadata.as_ref().and_then(|m| m.content_type.clone()))
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            content: payload.to_vec(),
        }),
        SerializedObjectEncoding::BinaryZip => {
            return Err(SerializationError::UnsupportedEncoding {
                encoding: "BinaryZip".to_string(),
                reason: "code packages are not values".to_string(),
            })
        }
        SerializedObjectEncoding::Unknown => {
            return Err(SerializationError::UnknownEncoding(code));
        }
    };

    Ok(DecodedValue { metadata, value })
}

/// Builds a standalone object (manifest and inline data) for `data` in the
/// given encoding. Used for code packages and request error messages.
pub fn inline_object(data: Vec<u8>, encoding: SerializedObjectEncoding) -> SerializedObject {
    SerializedObject {
        manifest: Some(SerializedObjectManifest {
            encoding: Some(encoding as i32),
            encoding_version: Some(ENCODING_VERSION),
            size: Some(data.len() as u64),
            metadata_size: Some(0),
            sha256_hash: Some(sha256_hexdigest(&[], &data)),
            content_type: None,
            source_function_call_id: None,
        }),
        data: Some(data),
    }
}

/// Verifies an inline object and returns its payload.
pub fn verify_inline_object(object: &SerializedObject) -> Result<&[u8], SerializationError> {
    let manifest = object
        .manifest
        .as_ref()
        .ok_or(SerializationError::MissingField("manifest"))?;
    let data = object
        .data
        .as_deref()
        .ok_or(SerializationError::MissingField("data"))?;
    let (_, payload) = verified_bytes(manifest, 0, data)?;
    Ok(payload)
}
