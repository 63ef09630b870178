//! Local filesystem backend for `file://` chunk URIs.
//!
//! Every chunk URI of a file-backed blob points at the start of the same
//! backing file, so reads and writes always use absolute blob offsets.

use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use url::Url;

use crate::error::{BlobError, BlobResult};

pub(crate) fn file_uri_to_path(uri: &Url) -> BlobResult<PathBuf> {
    uri.to_file_path().map_err(|_| BlobError::InvalidUri {
        uri: uri.to_string(),
        reason: "not an absolute local file path".to_string(),
    })
}

pub(crate) fn path_to_file_uri(path: &Path) -> BlobResult<String> {
    Url::from_file_path(path)
        .map(|u| u.to_string())
        .map_err(|_| BlobError::InvalidUri {
            uri: path.display().to_string(),
            reason: "path must be absolute".to_string(),
        })
}

fn io_error(uri: &Url, source: std::io::Error) -> BlobError {
    if source.kind() == ErrorKind::NotFound {
        return BlobError::NotFound {
            uri: uri.to_string(),
        };
    }
    BlobError::IoError {
        uri: uri.to_string(),
        source,
    }
}

/// Reads exactly `len` bytes at `offset`. The buffer only grows with the
/// bytes the file holds.
pub(crate) async fn read(uri: &Url, offset: u64, len: u64) -> BlobResult<Vec<u8>> {
    let path = file_uri_to_path(uri)?;
    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| io_error(uri, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| io_error(uri, e))?;

    let mut buf = Vec::new();
    file.take(len)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| io_error(uri, e))?;
    if buf.len() as u64 != len {
        return Err(io_error(
            uri,
            std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("expected {} bytes at offset {}, got {}", len, offset, buf.len()),
            ),
        ));
    }
    Ok(buf)
}

/// Writes `data` at `offset` and returns the hex SHA-256 of the chunk as its
/// ETag.
pub(crate) async fn write(uri: &Url, offset: u64, data: &[u8]) -> BlobResult<String> {
    let path = file_uri_to_path(uri)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(uri, e))?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .await
        .map_err(|e| io_error(uri, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| io_error(uri, e))?;
    file.write_all(data).await.map_err(|e| io_error(uri, e))?;
    file.flush().await.map_err(|e| io_error(uri, e))?;

    Ok(hex::encode(Sha256::digest(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let uri = Url::parse(&path_to_file_uri(&dir.path().join("blob")).unwrap()).unwrap();

        let etag = write(&uri, 4, b"world").await.unwrap();
        write(&uri, 0, b"hey ").await.unwrap();

        assert_eq!(read(&uri, 0, 9).await.unwrap(), b"hey world");
        assert_eq!(read(&uri, 4, 3).await.unwrap(), b"wor");
        assert_eq!(etag, hex::encode(Sha256::digest(b"world")));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let uri = Url::parse(&path_to_file_uri(&dir.path().join("missing")).unwrap()).unwrap();
        assert!(matches!(
            read(&uri, 0, 1).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_short_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let uri = Url::parse(&path_to_file_uri(&dir.path().join("short")).unwrap()).unwrap();
        write(&uri, 0, b"abc").await.unwrap();

        let err = read(&uri, 0, u64::MAX).await.unwrap_err();
        assert!(matches!(err, BlobError::IoError { .. }));
        assert!(err.is_retryable());
    }
}
