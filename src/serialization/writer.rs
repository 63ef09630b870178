use bytes::Bytes;
use proto_api::function_executor_pb::SerializedObjectInsideBlob;

use super::{serialize, SerializationError, Value};

/// Packs several values back to back into one blob.
#[derive(Debug, Default)]
pub struct SerializedObjectWriter {
    buffers: Vec<Bytes>,
    size: u64,
}

impl SerializedObjectWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` and returns its address inside the blob.
    pub fn add(&mut self, value: &Value) -> Result<SerializedObjectInsideBlob, SerializationError> {
        let serialized = serialize(value)?;
        let object = SerializedObjectInsideBlob {
            manifest: Some(serialized.manifest),
            offset: Some(self.size),
        };
        self.size += (serialized.metadata.len() + serialized.payload.len()) as u64;
        self.buffers.push(Bytes::from(serialized.metadata));
        self.buffers.push(Bytes::from(serialized.payload));
        Ok(object)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn into_buffers(self) -> Vec<Bytes> {
        self.buffers
    }
}
