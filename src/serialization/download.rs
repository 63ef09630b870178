use anyhow::{anyhow, Context, Result};
use blob_store::{BlobError, BlobStore};
use proto_api::function_executor_pb::{Blob, SerializedObjectInsideBlob};

use super::{deserialize, DecodedValue, SerializationError};

/// Reads the object's byte range from `blob` and decodes it.
///
/// Transport failures come back as [`blob_store::BlobError`] and
/// verification failures as [`super::SerializationError`] inside the
/// returned error chain, so callers can downcast to decide on retries. A
/// manifest that reaches past the end of the blob is
/// [`SerializationError::Truncated`].
pub async fn download_serialized_object(
    blob_store: &BlobStore,
    blob: &Blob,
    object: &SerializedObjectInsideBlob,
) -> Result<DecodedValue> {
    let manifest = object
        .manifest
        .as_ref()
        .ok_or_else(|| anyhow!("serialized object has no manifest"))?;
    let size = manifest
        .size
        .ok_or_else(|| anyhow!("serialized object manifest has no size"))?;
    let offset = object.offset.unwrap_or(0);

    let bytes = match blob_store.get(blob, offset, size).await {
        Ok(bytes) => bytes,
        Err(BlobError::OutOfRange { blob_size, .. }) => {
            return Err(SerializationError::Truncated {
                needed: offset.saturating_add(size),
                available: blob_size,
            }
            .into());
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "downloading {} bytes at offset {} of blob {}",
                    size,
                    offset,
                    blob.id.as_deref().unwrap_or_default()
                )
            })
        }
    };
    Ok(deserialize(manifest, 0, &bytes)?)
}

#[cfg(test)]
mod tests {
    use blob_store::{file_blob, BlobStoreOptions};
    use serde_json::json;

    use super::*;
    use crate::serialization::{serialize, Value};

    fn stored_value(dir: &std::path::Path, value: &Value) -> (SerializedObjectInsideBlob, Blob) {
        let serialized = serialize(value).unwrap();
        let path = dir.join("value");
        std::fs::write(&path, serialized.to_bytes()).unwrap();
        let blob = file_blob("value", &path, &[serialized.len()]).unwrap();
        let object = SerializedObjectInsideBlob {
            manifest: Some(serialized.manifest),
            offset: Some(0),
        };
        (object, blob)
    }

    #[tokio::test]
    async fn test_download_decodes_value() {
        let dir = tempfile::tempdir().unwrap();
        let (object, blob) = stored_value(dir.path(), &Value::Data(json!([1, 2])));
        let store = BlobStore::new(BlobStoreOptions::for_cpus(1)).unwrap();

        let decoded = download_serialized_object(&store, &blob, &object).await.unwrap();
        assert_eq!(decoded.value, Value::Data(json!([1, 2])));
    }

    #[tokio::test]
    async fn test_manifest_past_blob_end_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let (mut object, blob) = stored_value(dir.path(), &Value::Text("abc".into()));
        let store = BlobStore::new(BlobStoreOptions::for_cpus(1)).unwrap();

        object.manifest.as_mut().unwrap().size = Some(u64::MAX);
        let err = download_serialized_object(&store, &blob, &object)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SerializationError>(),
            Some(SerializationError::Truncated {
                needed: u64::MAX,
                ..
            })
        ));

        object.manifest.as_mut().unwrap().size = Some(4);
        object.offset = Some(blob_store::blob_size(&blob));
        let err = download_serialized_object(&store, &blob, &object)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<SerializationError>().is_some());
        assert!(err.downcast_ref::<BlobError>().is_none());
    }
}
